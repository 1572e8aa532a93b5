//! Prometheus exposition endpoint.

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;

use super::AppState;
use crate::metrics::render;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Renders the merged component metrics, followed by the transport counters
/// of the installed recorder, if any.
pub async fn prometheus_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = render(&state.metrics.snapshot(), &state.deployment);
    if let Some(handle) = &state.prometheus {
        body.push_str(&handle.render());
    }
    ([(CONTENT_TYPE, TEXT_FORMAT)], body)
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use predictor_core::MetricRecord;

    use super::*;
    use crate::network::handlers::test_support::{state_for, Neutral};

    #[tokio::test]
    async fn exposes_recorded_metrics() {
        let state = state_for(Neutral);
        state
            .metrics
            .record(&[MetricRecord::counter("hits", 3.0)], "predict")
            .unwrap();
        let resp = prometheus_handler(State(state)).await.into_response();
        assert_eq!(resp.headers()[CONTENT_TYPE], TEXT_FORMAT);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("# TYPE hits counter"));
        assert!(text.contains("hits{method=\"predict\"} 3"));
    }
}
