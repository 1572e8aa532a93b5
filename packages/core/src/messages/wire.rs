//! Serde wire forms of the envelope types.
//!
//! The same structs serve both JSON and `MsgPack`: field names are the
//! camelCase names of the JSON protocol, and `binData` switches between
//! base64 text and a native `bin` on `is_human_readable()`. Conversion into
//! the canonical types is where envelope invariants are enforced.

use std::fmt;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::envelope::{Feedback, Message, MessageList, Meta};
use super::payload::{Payload, Tensor};
use crate::error::CodecError;

/// Adapter-specific decode behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Promote a tensor without `shape` to `[1, len(values)]`. Only the JSON
    /// adapter enables this.
    pub infer_missing_shape: bool,
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Deserializes a field that may be present-but-null as `Some(Value::Null)`.
///
/// Without this, serde collapses `"jsonData": null` into `None`, losing the
/// distinction between "no structured payload" and "a null document".
#[allow(clippy::unnecessary_wraps)]
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Some(Value::deserialize(deserializer)?))
}

mod bin_data {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            None => s.serialize_none(),
            Some(bytes) if s.is_human_readable() => s.serialize_some(&STANDARD.encode(bytes)),
            Some(bytes) => s.serialize_some(serde_bytes::Bytes::new(bytes)),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        if d.is_human_readable() {
            let text: Option<String> = Option::deserialize(d)?;
            text.map(|t| STANDARD.decode(t).map_err(D::Error::custom))
                .transpose()
        } else {
            let bytes: Option<serde_bytes::ByteBuf> = Option::deserialize(d)?;
            Ok(bytes.map(serde_bytes::ByteBuf::into_vec))
        }
    }
}

// ---------------------------------------------------------------------------
// Wire structs
// ---------------------------------------------------------------------------

/// `data.tensor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTensor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,
    #[serde(default)]
    pub values: Vec<f64>,
}

/// The `data` object: names plus exactly one of `tensor` / `ndarray`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireData {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensor: Option<WireTensor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ndarray: Option<Vec<Value>>,
}

/// Wire form of [`Message`]. Exactly one payload field must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<WireData>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "bin_data")]
    pub bin_data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub str_data: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub json_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    pub meta: Meta,
}

/// Wire form of [`Feedback`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireFeedback {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<WireMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<WireMessage>,
    #[serde(default)]
    pub reward: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truth: Option<WireMessage>,
}

/// Wire form of [`MessageList`]: `{"seldonMessages": [...]}` or a bare array.
/// Always serialized in the wrapped form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireMessageList {
    pub messages: Vec<WireMessage>,
}

const LIST_FIELD: &str = "seldonMessages";

impl Serialize for WireMessageList {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = s.serialize_map(Some(1))?;
        map.serialize_entry(LIST_FIELD, &self.messages)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for WireMessageList {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct ListVisitor;

        impl<'de> Visitor<'de> for ListVisitor {
            type Value = WireMessageList;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a message array or an object with `{LIST_FIELD}`")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut messages = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(m) = seq.next_element()? {
                    messages.push(m);
                }
                Ok(WireMessageList { messages })
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut messages = None;
                while let Some(key) = map.next_key::<String>()? {
                    if key == LIST_FIELD {
                        messages = Some(map.next_value()?);
                    } else {
                        map.next_value::<de::IgnoredAny>()?;
                    }
                }
                messages
                    .map(|messages| WireMessageList { messages })
                    .ok_or_else(|| de::Error::missing_field(LIST_FIELD))
            }
        }

        d.deserialize_any(ListVisitor)
    }
}

// ---------------------------------------------------------------------------
// Canonical <-> wire
// ---------------------------------------------------------------------------

impl WireMessage {
    /// Converts to the canonical message, enforcing envelope invariants.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Malformed` for zero or multiple payloads, a `data`
    /// object with neither or both of `tensor`/`ndarray`, an invalid tensor,
    /// or names that disagree with the column count.
    pub fn into_message(self, opts: DecodeOptions) -> Result<Message, CodecError> {
        let populated = usize::from(self.data.is_some())
            + usize::from(self.bin_data.is_some())
            + usize::from(self.str_data.is_some())
            + usize::from(self.json_data.is_some());
        if populated == 0 {
            return Err(CodecError::malformed(
                "expected one of data, binData, strData or jsonData",
            ));
        }
        if populated > 1 {
            return Err(CodecError::malformed(
                "only one of data, binData, strData or jsonData may be set",
            ));
        }

        let (payload, names) = if let Some(data) = self.data {
            let payload = match (data.tensor, data.ndarray) {
                (Some(t), None) => Payload::Tensor(tensor_from_wire(t, opts)?),
                (None, Some(rows)) => Payload::NdArray(rows),
                (None, None) => {
                    return Err(CodecError::malformed("data has neither tensor nor ndarray"))
                }
                (Some(_), Some(_)) => {
                    return Err(CodecError::malformed("data has both tensor and ndarray"))
                }
            };
            (payload, data.names)
        } else if let Some(bytes) = self.bin_data {
            (Payload::Binary(bytes), Vec::new())
        } else if let Some(text) = self.str_data {
            (Payload::Str(text), Vec::new())
        } else {
            (Payload::Json(self.json_data.unwrap_or(Value::Null)), Vec::new())
        };

        Message::new(payload, names, self.meta)
    }

    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        let mut wire = Self {
            meta: message.meta.clone(),
            ..Self::default()
        };
        match &message.payload {
            Payload::Tensor(t) => {
                wire.data = Some(WireData {
                    names: message.names.clone(),
                    tensor: Some(WireTensor {
                        shape: Some(t.shape().to_vec()),
                        values: t.values().to_vec(),
                    }),
                    ndarray: None,
                });
            }
            Payload::NdArray(rows) => {
                wire.data = Some(WireData {
                    names: message.names.clone(),
                    tensor: None,
                    ndarray: Some(rows.clone()),
                });
            }
            Payload::Binary(b) => wire.bin_data = Some(b.clone()),
            Payload::Str(s) => wire.str_data = Some(s.clone()),
            Payload::Json(v) => wire.json_data = Some(v.clone()),
        }
        wire
    }
}

fn tensor_from_wire(t: WireTensor, opts: DecodeOptions) -> Result<Tensor, CodecError> {
    let shape = match t.shape {
        Some(shape) => shape,
        None if opts.infer_missing_shape => {
            tracing::debug!(len = t.values.len(), "tensor without shape promoted to [1, len]");
            vec![1, t.values.len()]
        }
        None => return Err(CodecError::malformed("tensor has no shape")),
    };
    Tensor::new(shape, t.values)
}

fn optional(
    wire: Option<WireMessage>,
    opts: DecodeOptions,
) -> Result<Option<Message>, CodecError> {
    wire.map(|w| w.into_message(opts)).transpose()
}

impl WireFeedback {
    /// # Errors
    ///
    /// Propagates the first invalid nested message, or a non-finite reward.
    pub fn into_feedback(self, opts: DecodeOptions) -> Result<Feedback, CodecError> {
        if !self.reward.is_finite() {
            return Err(CodecError::malformed("reward must be finite"));
        }
        Ok(Feedback {
            request: optional(self.request, opts)?,
            response: optional(self.response, opts)?,
            reward: self.reward,
            truth: optional(self.truth, opts)?,
        })
    }

    #[must_use]
    pub fn from_feedback(feedback: &Feedback) -> Self {
        Self {
            request: feedback.request.as_ref().map(WireMessage::from_message),
            response: feedback.response.as_ref().map(WireMessage::from_message),
            reward: feedback.reward,
            truth: feedback.truth.as_ref().map(WireMessage::from_message),
        }
    }
}

impl WireMessageList {
    /// # Errors
    ///
    /// Propagates the first invalid element.
    pub fn into_list(self, opts: DecodeOptions) -> Result<MessageList, CodecError> {
        let messages = self
            .messages
            .into_iter()
            .map(|m| m.into_message(opts))
            .collect::<Result<_, _>>()?;
        Ok(MessageList { messages })
    }

    #[must_use]
    pub fn from_list(list: &MessageList) -> Self {
        Self {
            messages: list.messages.iter().map(WireMessage::from_message).collect(),
        }
    }
}
