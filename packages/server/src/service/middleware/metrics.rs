//! Request timing.
//!
//! Every successful operation records a TIMER under [`REQUEST_DURATION`]
//! into the metrics store, tagged with its method. Each call also runs
//! inside an `operation` span carrying the request id.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use predictor_core::MetricRecord;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::metrics::MetricsAggregator;
use crate::service::operation::{Operation, OperationError, OperationResponse};

/// Metric key of the per-request latency histogram.
pub const REQUEST_DURATION: &str = "predictor_request_duration";

#[derive(Debug, Clone)]
pub struct MetricsLayer {
    store: Arc<MetricsAggregator>,
}

impl MetricsLayer {
    #[must_use]
    pub fn new(store: Arc<MetricsAggregator>) -> Self {
        Self { store }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            store: Arc::clone(&self.store),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
    store: Arc<MetricsAggregator>,
}

impl<S> Service<Operation> for MetricsService<S>
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let method = op.ctx().method;
        let span = info_span!(
            "operation",
            request_id = %op.ctx().request_id,
            method = method.as_str(),
            transport = op.ctx().transport.as_str(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let store = Arc::clone(&self.store);
        let fut = self.inner.call(op);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let duration_ms = elapsed.as_secs_f64() * 1000.0;

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(e) => e.reason(),
                };
                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);

                ::metrics::counter!(
                    "predictor_operations_total",
                    "method" => method.metric_tag(),
                    "outcome" => outcome,
                )
                .increment(1);

                if result.is_ok() {
                    let timer = MetricRecord::timer(REQUEST_DURATION, duration_ms);
                    if let Err(e) = store.record(&[timer], method.metric_tag()) {
                        tracing::warn!(error = %e, "failed to record request duration");
                    }
                }
                tracing::debug!(duration_ms, outcome, "operation complete");
                result
            }
            .instrument(span),
        )
    }
}
