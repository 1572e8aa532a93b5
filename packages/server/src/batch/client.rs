//! Outbound clients the batch workers call the predictor through.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use predictor_core::{
    CodecError, Feedback, JsonCodec, Message, MsgPackCodec, Status, StatusBody, WireCodec,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::network::middleware::REQUEST_ID_HEADER;
use crate::network::rpc::frame::REQUEST_ID_KEY;
use crate::network::rpc::{RpcClient, RpcError};
use crate::service::operation::reasons;
use crate::service::Method;

// ---------------------------------------------------------------------------
// TransportError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("server returned {} {}: {}", .0.code, .0.reason, .0.info)]
    Server(Status),
    #[error("invalid payload: {0}")]
    Codec(#[from] CodecError),
}

impl TransportError {
    /// Whether another attempt may succeed: connection problems, timeouts,
    /// server faults and overload.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Timeout(_) => true,
            Self::Server(status) => {
                status.code >= 500
                    || status.reason == reasons::OVERLOADED
                    || status.reason == reasons::TIMEOUT
            }
            Self::Codec(_) => false,
        }
    }

    /// The status written into a failure record.
    #[must_use]
    pub fn to_status(&self) -> Status {
        match self {
            Self::Connect(_) => Status::failure(503, reasons::TRANSPORT_FAILURE, self.to_string()),
            Self::Timeout(_) => Status::failure(504, reasons::TIMEOUT, self.to_string()),
            Self::Server(status) => status.clone(),
            Self::Codec(_) => Status::failure(400, reasons::MALFORMED_PAYLOAD, self.to_string()),
        }
    }
}

impl From<RpcError> for TransportError {
    fn from(err: RpcError) -> Self {
        Self::Connect(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// PredictorClient
// ---------------------------------------------------------------------------

/// A JSON envelope in, a JSON envelope out.
#[async_trait]
pub trait PredictorClient: Send + Sync + 'static {
    /// # Errors
    ///
    /// See [`TransportError`]; transient errors are retried by the caller.
    async fn call(
        &self,
        method: Method,
        request: &Value,
        correlation_id: &str,
    ) -> Result<Value, TransportError>;
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

pub struct HttpPredictorClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpPredictorClient {
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be built.
    pub fn new(host: &str, port: u16, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: format!("http://{host}:{port}"),
            timeout,
        })
    }

    fn transport_error(&self, err: &reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Connect(err.to_string())
        }
    }

    fn path(method: Method) -> &'static str {
        match method {
            Method::Predict => "/api/v1.0/predictions",
            Method::SendFeedback => "/api/v1.0/feedback",
            Method::TransformInput => "/transform-input",
            Method::TransformOutput => "/transform-output",
            Method::Route => "/route",
            Method::Aggregate => "/aggregate",
            Method::HealthStatus => "/health/status",
            Method::Metadata => "/metadata",
        }
    }
}

#[async_trait]
impl PredictorClient for HttpPredictorClient {
    async fn call(
        &self,
        method: Method,
        request: &Value,
        correlation_id: &str,
    ) -> Result<Value, TransportError> {
        let url = format!("{}{}", self.base_url, Self::path(method));
        let response = self
            .http
            .post(&url)
            .header(REQUEST_ID_HEADER, correlation_id)
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;
        let code = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(&e))?;

        if code.is_success() {
            return Ok(serde_json::from_slice(&body).map_err(CodecError::from)?);
        }
        let status = serde_json::from_slice::<StatusBody>(&body).map_or_else(
            |_| {
                Status::failure(
                    i32::from(code.as_u16()),
                    reasons::TRANSPORT_FAILURE,
                    String::from_utf8_lossy(&body).into_owned(),
                )
            },
            |body| body.status,
        );
        Err(TransportError::Server(status))
    }
}

// ---------------------------------------------------------------------------
// RPC
// ---------------------------------------------------------------------------

/// A fixed set of lazily opened RPC connections used round-robin. A
/// connection that fails is dropped and reopened on its next use.
pub struct RpcPredictorClient {
    addr: String,
    max_frame_bytes: usize,
    timeout: Duration,
    connections: Vec<Mutex<Option<RpcClient>>>,
    next: AtomicUsize,
}

impl RpcPredictorClient {
    #[must_use]
    pub fn new(host: &str, port: u16, connections: usize, timeout: Duration) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            max_frame_bytes: 16 * 1024 * 1024,
            timeout,
            connections: (0..connections.max(1)).map(|_| Mutex::new(None)).collect(),
            next: AtomicUsize::new(0),
        }
    }

    fn encode(method: Method, request: &Value) -> Result<Vec<u8>, CodecError> {
        if method == Method::SendFeedback {
            let feedback: Feedback = JsonCodec.decode_value(request.clone())?;
            MsgPackCodec.encode(&feedback)
        } else {
            let message: Message = JsonCodec.decode_value(request.clone())?;
            MsgPackCodec.encode(&message)
        }
    }
}

#[async_trait]
impl PredictorClient for RpcPredictorClient {
    async fn call(
        &self,
        method: Method,
        request: &Value,
        correlation_id: &str,
    ) -> Result<Value, TransportError> {
        let body = Self::encode(method, request)?;
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        let mut guard = self.connections[slot].lock().await;

        // The connection goes back into its slot only after a clean call; a
        // late response would otherwise be read as the answer to the next one.
        let mut client = match guard.take() {
            Some(client) => client,
            None => {
                debug!(addr = %self.addr, slot, "opening rpc connection");
                RpcClient::connect(&self.addr, self.max_frame_bytes).await?
            }
        };
        let metadata = BTreeMap::from([(REQUEST_ID_KEY.to_string(), correlation_id.to_string())]);
        let frame =
            tokio::time::timeout(self.timeout, client.call(method.rpc_name(), metadata, body))
                .await
                .map_err(|_| TransportError::Timeout(self.timeout))??;
        *guard = Some(client);
        drop(guard);

        let bytes = frame.into_result().map_err(TransportError::Server)?;
        let message: Message = MsgPackCodec.decode(&bytes)?;
        Ok(JsonCodec.encode_value(&message)?)
    }
}
