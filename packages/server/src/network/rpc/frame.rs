//! RPC frames: MessagePack named maps inside 4-byte length-delimited frames.

use std::collections::BTreeMap;

use predictor_core::Status;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::service::OperationError;

/// Metadata key carrying the request id.
pub const REQUEST_ID_KEY: &str = "x-request-id";

/// Errors on the RPC connection itself, as opposed to per-call failures
/// which travel inside a [`ResponseFrame`].
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("rpc frame encoding: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("rpc frame decoding: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("response id {got} does not match request id {expected}")]
    IdMismatch { expected: u64, got: u64 },
}

/// `{id, method, metadata, body}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    /// `Predict`, `predictor.Model/Predict` or `ServerReflection/ListServices`.
    pub method: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub body: ByteBuf,
}

impl RequestFrame {
    #[must_use]
    pub fn new(id: u64, method: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            id,
            method: method.into(),
            metadata: BTreeMap::new(),
            body: ByteBuf::from(body),
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.metadata
            .insert(REQUEST_ID_KEY.to_string(), request_id.into());
        self
    }

    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.metadata.get(REQUEST_ID_KEY).map(String::as_str)
    }
}

/// `{id, ok}` on success, `{id, status}` on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl ResponseFrame {
    #[must_use]
    pub fn ok(id: u64, body: Vec<u8>) -> Self {
        Self {
            id,
            ok: Some(ByteBuf::from(body)),
            status: None,
        }
    }

    #[must_use]
    pub fn failure(id: u64, err: &OperationError) -> Self {
        Self {
            id,
            ok: None,
            status: Some(err.to_status()),
        }
    }

    /// Splits the frame into the success body or the failure status.
    ///
    /// # Errors
    ///
    /// Returns the status of a failed call. A frame carrying neither is
    /// reported as a protocol violation.
    pub fn into_result(self) -> Result<Vec<u8>, Status> {
        match (self.ok, self.status) {
            (Some(body), _) => Ok(body.into_vec()),
            (None, Some(status)) => Err(status),
            (None, None) => Err(OperationError::protocol("empty response frame").to_status()),
        }
    }
}

/// # Errors
///
/// Fails when the value cannot be serialized.
pub fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, RpcError> {
    Ok(rmp_serde::to_vec_named(frame)?)
}

/// # Errors
///
/// Fails when the bytes are not a valid frame of type `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RpcError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use predictor_core::messages::StatusFlag;

    use super::*;

    #[test]
    fn request_frame_roundtrip() {
        let frame = RequestFrame::new(7, "Predict", vec![0x80]).with_request_id("r-1");
        let back: RequestFrame = decode(&encode(&frame).unwrap()).unwrap();
        assert_eq!(back, frame);
        assert_eq!(back.request_id(), Some("r-1"));
    }

    #[test]
    fn failure_frame_carries_status() {
        let frame = ResponseFrame::failure(3, &OperationError::Overloaded);
        let back: ResponseFrame = decode(&encode(&frame).unwrap()).unwrap();
        let status = back.into_result().unwrap_err();
        assert_eq!(status.code, 503);
        assert_eq!(status.reason, "OVERLOADED");
        assert_eq!(status.status, StatusFlag::FAILURE);
    }

    #[test]
    fn missing_optional_fields_default() {
        #[derive(Serialize)]
        struct Bare<'a> {
            id: u64,
            method: &'a str,
        }
        let bytes = rmp_serde::to_vec_named(&Bare {
            id: 1,
            method: "HealthStatus",
        })
        .unwrap();
        let frame: RequestFrame = decode(&bytes).unwrap();
        assert!(frame.body.is_empty());
        assert!(frame.metadata.is_empty());
    }

    #[test]
    fn empty_response_is_a_protocol_violation() {
        let frame = ResponseFrame {
            id: 1,
            ok: None,
            status: None,
        };
        assert_eq!(frame.into_result().unwrap_err().reason, "PROTOCOL_VIOLATION");
    }
}
