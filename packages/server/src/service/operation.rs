//! Operation types carried through the dispatch pipeline.

use std::fmt;

use bytes::Bytes;
use http::StatusCode;
use predictor_core::{CodecError, Feedback, Message, MessageList, MetricError, Status};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Method / Transport
// ---------------------------------------------------------------------------

/// The serving operations a component can be asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    Predict,
    SendFeedback,
    TransformInput,
    TransformOutput,
    Route,
    Aggregate,
    HealthStatus,
    Metadata,
}

impl Method {
    pub const ALL: [Method; 8] = [
        Method::Predict,
        Method::SendFeedback,
        Method::TransformInput,
        Method::TransformOutput,
        Method::Route,
        Method::Aggregate,
        Method::HealthStatus,
        Method::Metadata,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Predict => "predict",
            Self::SendFeedback => "send_feedback",
            Self::TransformInput => "transform_input",
            Self::TransformOutput => "transform_output",
            Self::Route => "route",
            Self::Aggregate => "aggregate",
            Self::HealthStatus => "health_status",
            Self::Metadata => "metadata",
        }
    }

    /// Value of the `method` tag attached to aggregated metrics.
    #[must_use]
    pub fn metric_tag(self) -> &'static str {
        match self {
            Self::SendFeedback => "feedback",
            Self::HealthStatus => "health",
            other => other.as_str(),
        }
    }

    /// RPC method name (`Predict`, `SendFeedback`, ...).
    #[must_use]
    pub fn rpc_name(self) -> &'static str {
        match self {
            Self::Predict => "Predict",
            Self::SendFeedback => "SendFeedback",
            Self::TransformInput => "TransformInput",
            Self::TransformOutput => "TransformOutput",
            Self::Route => "Route",
            Self::Aggregate => "Aggregate",
            Self::HealthStatus => "HealthStatus",
            Self::Metadata => "Metadata",
        }
    }

    #[must_use]
    pub fn from_rpc_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.rpc_name() == name)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire transport a call arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Http,
    Rpc,
}

impl Transport {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Rpc => "rpc",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Context carried with every operation through the pipeline.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Opaque id from `x-request-id` or RPC frame metadata.
    pub request_id: String,
    pub method: Method,
    pub transport: Transport,
    pub call_timeout_ms: u64,
}

impl OperationContext {
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        method: Method,
        transport: Transport,
        call_timeout_ms: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            method,
            transport,
            call_timeout_ms,
        }
    }
}

/// Decoded request body. The variant is fixed by the method.
#[derive(Debug, Clone)]
pub enum Request {
    Message(Message),
    Feedback(Feedback),
    List(MessageList),
    /// `health_status` and `metadata` take no body.
    Empty,
}

/// The request as it arrived on the wire, kept only when a legacy
/// transport-specific override will see it.
#[derive(Debug, Clone)]
pub enum NativeRequest {
    Json(Value),
    MsgPack(Bytes),
}

/// One call through the pipeline.
#[derive(Debug, Clone)]
pub struct Operation {
    pub ctx: OperationContext,
    pub request: Request,
    pub native: Option<NativeRequest>,
}

impl Operation {
    #[must_use]
    pub fn new(ctx: OperationContext, request: Request) -> Self {
        Self {
            ctx,
            request,
            native: None,
        }
    }

    #[must_use]
    pub fn with_native(mut self, native: NativeRequest) -> Self {
        self.native = Some(native);
        self
    }

    #[must_use]
    pub fn ctx(&self) -> &OperationContext {
        &self.ctx
    }
}

/// Successful result of a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResponse {
    /// An assembled envelope, encoded by the transport's codec.
    Message(Message),
    /// A JSON document passed through verbatim (raw map, metadata, legacy
    /// text-transport result).
    Document(Value),
    /// Bytes from a legacy RPC override, written back verbatim.
    Native(Vec<u8>),
}

// ---------------------------------------------------------------------------
// OperationError
// ---------------------------------------------------------------------------

/// Errors returned by the dispatch pipeline.
///
/// Each variant maps to one reason code and one HTTP status; see
/// [`OperationError::to_status`].
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },
    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },
    #[error("bad metric: {0}")]
    BadMetric(#[from] MetricError),
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("server overloaded, try again later")]
    Overloaded,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<CodecError> for OperationError {
    fn from(err: CodecError) -> Self {
        Self::MalformedPayload {
            reason: err.to_string(),
        }
    }
}

pub mod reasons {
    pub const MALFORMED_PAYLOAD: &str = "MALFORMED_PAYLOAD";
    pub const PROTOCOL_VIOLATION: &str = "PROTOCOL_VIOLATION";
    pub const BAD_METRIC: &str = "BAD_METRIC";
    pub const TRANSPORT_FAILURE: &str = "TRANSPORT_FAILURE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const OVERLOADED: &str = "OVERLOADED";
    pub const TIMEOUT: &str = "TIMEOUT";
}

impl OperationError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MalformedPayload { .. } => reasons::MALFORMED_PAYLOAD,
            Self::ProtocolViolation { .. } => reasons::PROTOCOL_VIOLATION,
            Self::BadMetric(_) => reasons::BAD_METRIC,
            Self::Timeout { .. } => reasons::TIMEOUT,
            Self::Overloaded => reasons::OVERLOADED,
            Self::Internal(_) => reasons::INTERNAL_ERROR,
        }
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedPayload { .. } | Self::BadMetric(_) => StatusCode::BAD_REQUEST,
            Self::ProtocolViolation { .. } | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// The client-visible error form. Internal errors carry a generic message
    /// only; the detail goes to the log.
    #[must_use]
    pub fn to_status(&self) -> Status {
        let info = match self {
            Self::Internal(_) => "internal error in component".to_string(),
            other => other.to_string(),
        };
        Status::failure(i32::from(self.status_code().as_u16()), self.reason(), info)
    }
}
