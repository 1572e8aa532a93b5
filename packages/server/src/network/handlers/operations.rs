//! HTTP endpoints for the component operations.
//!
//! Requests arrive as a JSON body or, as older clients send them, in a
//! `?json=` query parameter. The decoded envelope goes through the operation
//! pipeline and the result is written back as JSON.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use predictor_core::{CodecError, Feedback, JsonCodec, Message, MessageList};
use serde::Deserialize;
use serde_json::Value;
use tower::ServiceExt;
use tracing::warn;

use super::AppState;
use crate::network::middleware::REQUEST_ID_HEADER;
use crate::service::{
    Method, NativeRequest, Operation, OperationError, OperationResponse, Request, Transport,
};

/// The `?json=` query form of a request.
#[derive(Debug, Default, Deserialize)]
pub struct JsonQuery {
    json: Option<String>,
}

macro_rules! operation_endpoint {
    ($(#[$doc:meta])* $name:ident, $method:expr) => {
        $(#[$doc])*
        pub async fn $name(
            State(state): State<AppState>,
            headers: HeaderMap,
            Query(query): Query<JsonQuery>,
            body: Bytes,
        ) -> Response {
            handle(&state, $method, &headers, query, body).await
        }
    };
}

operation_endpoint!(
    /// `/predict` and `/api/v1.0/predictions`.
    predict,
    Method::Predict
);
operation_endpoint!(
    /// `/send-feedback` and `/api/v1.0/feedback`.
    send_feedback,
    Method::SendFeedback
);
operation_endpoint!(transform_input, Method::TransformInput);
operation_endpoint!(transform_output, Method::TransformOutput);
operation_endpoint!(route, Method::Route);
operation_endpoint!(aggregate, Method::Aggregate);

/// `/health/status`: the component's own health check.
pub async fn health_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    handle(
        &state,
        Method::HealthStatus,
        &headers,
        JsonQuery::default(),
        Bytes::new(),
    )
    .await
}

pub async fn metadata(State(state): State<AppState>, headers: HeaderMap) -> Response {
    handle(
        &state,
        Method::Metadata,
        &headers,
        JsonQuery::default(),
        Bytes::new(),
    )
    .await
}

// ---------------------------------------------------------------------------
// Shared request path
// ---------------------------------------------------------------------------

async fn handle(
    state: &AppState,
    method: Method,
    headers: &HeaderMap,
    query: JsonQuery,
    body: Bytes,
) -> Response {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);
    let _in_flight = state.shutdown.in_flight_guard();

    let outcome = match decode(state, method, query, &body) {
        Ok((request, native)) => {
            let mut op = Operation::new(state.context(&request_id, method, Transport::Http), request);
            if let Some(native) = native {
                op = op.with_native(native);
            }
            match state.pipeline.clone().oneshot(op).await {
                Ok(response) => encode(response),
                Err(err) => Err(err),
            }
        }
        Err(err) => Err(err),
    };

    let response = outcome.unwrap_or_else(|err| {
        if err.status_code().is_client_error() {
            warn!(
                request_id = %request_id,
                method = %method,
                reason = err.reason(),
                error = %err,
                "request rejected"
            );
        }
        err.into_response()
    });

    ::metrics::counter!(
        "predictor_http_requests_total",
        "method" => method.metric_tag(),
        "code" => response.status().as_u16().to_string(),
    )
    .increment(1);
    response
}

/// Decodes the request for `method`. When a legacy text override is
/// declared the JSON document is kept as the native request, and a body that
/// fails strict decoding is still handed to that override.
fn decode(
    state: &AppState,
    method: Method,
    query: JsonQuery,
    body: &[u8],
) -> Result<(Request, Option<NativeRequest>), OperationError> {
    if matches!(method, Method::HealthStatus | Method::Metadata) {
        return Ok((Request::Empty, None));
    }

    let raw: &[u8] = match &query.json {
        Some(json) => json.as_bytes(),
        None => body,
    };
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(OperationError::malformed("empty request"));
    }
    let doc: Value = serde_json::from_slice(raw).map_err(CodecError::from)?;

    let native = state
        .plan
        .needs_native(method, Transport::Http)
        .then(|| NativeRequest::Json(doc.clone()));

    match (decode_request(method, doc), native) {
        (Ok(request), native) => Ok((request, native)),
        (Err(_), Some(native)) => Ok((Request::Empty, Some(native))),
        (Err(err), None) => Err(err.into()),
    }
}

fn decode_request(method: Method, doc: Value) -> Result<Request, CodecError> {
    Ok(match method {
        Method::SendFeedback => Request::Feedback(JsonCodec.decode_value::<Feedback>(doc)?),
        Method::Aggregate => Request::List(JsonCodec.decode_value::<MessageList>(doc)?),
        _ => Request::Message(JsonCodec.decode_value::<Message>(doc)?),
    })
}

fn encode(response: OperationResponse) -> Result<Response, OperationError> {
    match response {
        OperationResponse::Message(message) => {
            let doc = JsonCodec
                .encode_value(&message)
                .map_err(|e| OperationError::Internal(e.into()))?;
            Ok(Json(doc).into_response())
        }
        OperationResponse::Document(doc) => Ok(Json(doc).into_response()),
        OperationResponse::Native(bytes) => {
            Ok(([(CONTENT_TYPE, "application/octet-stream")], bytes).into_response())
        }
    }
}
