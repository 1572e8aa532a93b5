//! Error types for envelope decoding and metric record validation.

/// Errors produced while decoding or encoding an envelope.
///
/// Every variant is a client fault from the serving runtime's point of view:
/// the transport adapters surface all of them as `MalformedPayload`.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The envelope decoded structurally but violates an envelope invariant
    /// (no payload, more than one payload, shape/value mismatch, ...).
    #[error("malformed payload: {reason}")]
    Malformed { reason: String },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid MsgPack: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("MsgPack encoding failed: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
}

impl CodecError {
    /// Shorthand for [`CodecError::Malformed`].
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// A metric record failed validation.
///
/// Raised before any aggregation happens, so one bad record rejects the
/// whole batch it arrived in.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricError {
    #[error("metrics must be a list of records")]
    NotAList,
    #[error("metric #{index} is not an object")]
    NotAnObject { index: usize },
    #[error("metric #{index} has unknown type {found:?}")]
    UnknownType { index: usize, found: String },
    #[error("metric #{index} has no key")]
    MissingKey { index: usize },
    #[error("metric #{index} has no numeric value")]
    MissingValue { index: usize },
    #[error("metric {key:?} has a non-finite value")]
    NonFiniteValue { key: String },
    #[error("timer {key:?} has a negative duration")]
    NegativeTimer { key: String },
    #[error("metric #{index} tags must be a string map")]
    InvalidTags { index: usize },
}
