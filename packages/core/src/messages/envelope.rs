//! Canonical request/response envelope, independent of wire transport.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::metric::MetricRecord;
use super::payload::{Payload, Tensor};
use crate::error::CodecError;

// ---------------------------------------------------------------------------
// Meta
// ---------------------------------------------------------------------------

/// Envelope metadata.
///
/// Every field is optional on the wire and omitted when empty, so an empty
/// `Meta` encodes to nothing and decodes back to `Meta::default()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// Prediction unit id, echoed from request to response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub puid: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Value>,
    /// Component id to the branch index chosen by a router.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routing: BTreeMap<String, i64>,
    /// Component id to container image, one entry per unit the request visited.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub request_path: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricRecord>,
}

impl Meta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.puid.is_none()
            && self.tags.is_empty()
            && self.routing.is_empty()
            && self.request_path.is_empty()
            && self.metrics.is_empty()
    }

    /// Folds `other` into `self`. Maps are unioned with `other` winning on key
    /// collisions; metrics are appended; `puid` is replaced when `other` has one.
    pub fn merge(&mut self, other: &Meta) {
        if other.puid.is_some() {
            self.puid.clone_from(&other.puid);
        }
        self.tags
            .extend(other.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.routing
            .extend(other.routing.iter().map(|(k, v)| (k.clone(), *v)));
        self.request_path
            .extend(other.request_path.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.metrics.extend(other.metrics.iter().cloned());
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One request or response envelope.
///
/// Fields are public for reading and pattern matching; construct through
/// [`Message::new`] when `names` are involved so the column check runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub payload: Payload,
    /// Column labels. Empty means "no names".
    pub names: Vec<String>,
    pub meta: Meta,
}

impl Message {
    /// Builds a message, checking that `names` are legal for the payload.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Malformed` if names are attached to a non-data
    /// payload, or if their count disagrees with the payload's second
    /// dimension.
    pub fn new(payload: Payload, names: Vec<String>, meta: Meta) -> Result<Self, CodecError> {
        if !names.is_empty() {
            if !payload.is_data() {
                return Err(CodecError::malformed(format!(
                    "names are only allowed on tensor or ndarray payloads, not {}",
                    payload.kind().as_str()
                )));
            }
            if let Some(columns) = payload.column_count() {
                if columns != names.len() {
                    return Err(CodecError::malformed(format!(
                        "{} names for {columns} columns",
                        names.len()
                    )));
                }
            }
        }
        Ok(Self {
            payload,
            names,
            meta,
        })
    }

    /// A message with no names and empty meta.
    #[must_use]
    pub fn from_payload(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            names: Vec::new(),
            meta: Meta::default(),
        }
    }

    /// Shorthand for a tensor message.
    #[must_use]
    pub fn tensor(tensor: Tensor) -> Self {
        Self::from_payload(tensor)
    }

    #[must_use]
    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }
}

// ---------------------------------------------------------------------------
// Feedback / MessageList
// ---------------------------------------------------------------------------

/// Reward feedback on an earlier prediction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feedback {
    pub request: Option<Message>,
    pub response: Option<Message>,
    pub reward: f64,
    pub truth: Option<Message>,
}

/// Input of the `aggregate` operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageList {
    pub messages: Vec<Message>,
}

impl From<Vec<Message>> for MessageList {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Outcome flag of a [`Status`]. Variant names match the wire strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
pub enum StatusFlag {
    SUCCESS,
    FAILURE,
}

/// Structured error form returned instead of an envelope when a call fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub code: i32,
    pub info: String,
    /// Machine-readable reason code such as `MALFORMED_PAYLOAD`.
    pub reason: String,
    pub status: StatusFlag,
}

impl Status {
    #[must_use]
    pub fn failure(code: i32, reason: impl Into<String>, info: impl Into<String>) -> Self {
        Self {
            code,
            info: info.into(),
            reason: reason.into(),
            status: StatusFlag::FAILURE,
        }
    }

    /// Wraps the status as `{"status": {...}}`, the error body on both
    /// transports.
    #[must_use]
    pub fn into_body(self) -> StatusBody {
        StatusBody { status: self }
    }
}

/// The `{"status": {...}}` wrapper around a [`Status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusBody {
    pub status: Status,
}
