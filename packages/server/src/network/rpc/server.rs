//! The binary RPC listener.
//!
//! Each accepted connection runs on its own task and handles its frames in
//! order. Connections beyond `rpc_max_connections` wait for a slot. On
//! shutdown the accept loop stops and idle connections close between frames.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use predictor_core::{Feedback, Message, MessageList, MsgPackCodec, WireCodec};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tower::ServiceExt;
use tracing::{debug, info, warn};

use super::frame::{self, RequestFrame, ResponseFrame, RpcError};
use super::reflection::{self, MODEL_SERVICE, REFLECTION_SERVICE};
use crate::network::handlers::AppState;
use crate::service::{
    Method, NativeRequest, Operation, OperationError, OperationResponse, Request, Transport,
};

/// What a frame's method name addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target<'a> {
    Model(Method),
    Reflection(&'a str),
}

/// Accepts `Predict`, `/Predict`, `predictor.Model/Predict` and
/// `ServerReflection/<call>`.
fn resolve(name: &str) -> Option<Target<'_>> {
    let name = name.trim_start_matches('/');
    match name.split_once('/') {
        Some((REFLECTION_SERVICE, call)) => Some(Target::Reflection(call)),
        Some((MODEL_SERVICE, method)) => Method::from_rpc_name(method).map(Target::Model),
        Some(_) => None,
        None => Method::from_rpc_name(name).map(Target::Model),
    }
}

/// Serves RPC connections until shutdown is triggered, then waits for open
/// connections to finish their current frame.
///
/// # Errors
///
/// Currently only returns `Ok`; accept failures are logged and retried.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let slots = Arc::new(Semaphore::new(state.config.rpc_max_connections.max(1)));
    let mut connections = JoinSet::new();

    loop {
        let permit = tokio::select! {
            () = state.shutdown.triggered() => break,
            permit = Arc::clone(&slots).acquire_owned() => permit?,
        };
        let (stream, peer) = tokio::select! {
            () = state.shutdown.triggered() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "rpc accept failed");
                    continue;
                }
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
        }

        let state = state.clone();
        connections.spawn(async move {
            let _permit = permit;
            debug!(peer = %peer, "rpc connection opened");
            if let Err(e) = handle_connection(stream, &state).await {
                debug!(peer = %peer, error = %e, "rpc connection closed with error");
            }
        });
    }

    info!(open = connections.len(), "rpc listener stopped, closing connections");
    while connections.join_next().await.is_some() {}
    Ok(())
}

async fn handle_connection(stream: tokio::net::TcpStream, state: &AppState) -> Result<(), RpcError> {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(state.config.max_request_bytes)
        .new_codec();
    let mut framed = Framed::new(stream, codec);

    loop {
        let next = tokio::select! {
            next = framed.next() => next,
            () = state.shutdown.triggered() => break,
        };
        let Some(bytes) = next else { break };
        let response = handle_frame(state, &bytes?).await;
        framed.send(Bytes::from(frame::encode(&response)?)).await?;
    }
    Ok(())
}

/// Turns one request frame into its response frame. Never fails: errors
/// become a status.
pub(crate) async fn handle_frame(state: &AppState, bytes: &[u8]) -> ResponseFrame {
    let request: RequestFrame = match frame::decode(bytes) {
        Ok(request) => request,
        Err(e) => {
            let err = OperationError::malformed(format!("invalid request frame: {e}"));
            return ResponseFrame::failure(0, &err);
        }
    };
    let id = request.id;
    let _in_flight = state.shutdown.in_flight_guard();

    let (tag, result) = match resolve(&request.method) {
        Some(Target::Reflection(call)) => ("reflection", reflection::handle(call, &request.body)),
        Some(Target::Model(method)) => (method.metric_tag(), dispatch(state, method, &request).await),
        None => (
            "unknown",
            Err(OperationError::malformed(format!(
                "unknown method {}",
                request.method
            ))),
        ),
    };

    ::metrics::counter!(
        "predictor_rpc_requests_total",
        "method" => tag,
        "outcome" => result.as_ref().map_or_else(OperationError::reason, |_| "ok"),
    )
    .increment(1);

    match result {
        Ok(body) => ResponseFrame::ok(id, body),
        Err(err) => {
            if err.status_code().is_client_error() {
                warn!(
                    request_id = request.request_id().unwrap_or_default(),
                    method = %request.method,
                    reason = err.reason(),
                    error = %err,
                    "rpc request rejected"
                );
            }
            ResponseFrame::failure(id, &err)
        }
    }
}

async fn dispatch(
    state: &AppState,
    method: Method,
    request: &RequestFrame,
) -> Result<Vec<u8>, OperationError> {
    let request_id = request
        .request_id()
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);
    let body: &[u8] = &request.body;

    let native = state
        .plan
        .needs_native(method, Transport::Rpc)
        .then(|| NativeRequest::MsgPack(Bytes::copy_from_slice(body)));
    let decoded = if matches!(method, Method::HealthStatus | Method::Metadata) {
        Ok(Request::Empty)
    } else {
        decode_request(method, body)
    };
    let (decoded, native) = match (decoded, native) {
        (Ok(decoded), native) => (decoded, native),
        (Err(_), Some(native)) => (Request::Empty, Some(native)),
        (Err(err), None) => return Err(err),
    };

    let mut op = Operation::new(state.context(&request_id, method, Transport::Rpc), decoded);
    if let Some(native) = native {
        op = op.with_native(native);
    }
    let response = state.pipeline.clone().oneshot(op).await?;

    match response {
        OperationResponse::Message(message) => MsgPackCodec
            .encode(&message)
            .map_err(|e| OperationError::Internal(e.into())),
        OperationResponse::Document(doc) => {
            frame::encode(&doc).map_err(|e| OperationError::Internal(e.into()))
        }
        OperationResponse::Native(bytes) => Ok(bytes),
    }
}

fn decode_request(method: Method, body: &[u8]) -> Result<Request, OperationError> {
    if body.is_empty() {
        return Err(OperationError::malformed("empty request"));
    }
    Ok(match method {
        Method::SendFeedback => Request::Feedback(MsgPackCodec.decode::<Feedback>(body)?),
        Method::Aggregate => Request::List(MsgPackCodec.decode::<MessageList>(body)?),
        _ => Request::Message(MsgPackCodec.decode::<Message>(body)?),
    })
}
