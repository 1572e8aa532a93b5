//! Admission control for operations.
//!
//! At most `max_concurrent_operations` calls run at once. A call arriving
//! while every slot is taken fails fast with `OperationError::Overloaded`
//! and is counted under [`OPERATIONS_SHED`] in the metrics store, tagged with
//! its method and the `OVERLOADED` reason code.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use predictor_core::MetricRecord;
use tokio::sync::Semaphore;
use tower::{Layer, Service};
use tracing::warn;

use crate::metrics::MetricsAggregator;
use crate::service::operation::{reasons, Operation, OperationError, OperationResponse};

/// Counter key of refused operations.
pub const OPERATIONS_SHED: &str = "predictor_operations_shed";

/// Shares one pool of call slots between every service it wraps.
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    slots: Arc<Semaphore>,
    store: Arc<MetricsAggregator>,
}

impl AdmissionLayer {
    #[must_use]
    pub fn new(max_concurrent: u32, store: Arc<MetricsAggregator>) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent as usize)),
            store,
        }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = Admission<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Admission {
            inner,
            gate: self.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Admission<S> {
    inner: S,
    gate: AdmissionLayer,
}

impl<S> Admission<S> {
    fn refuse(&self, op: &Operation) -> OperationError {
        let method = op.ctx().method;
        warn!(
            request_id = %op.ctx().request_id,
            method = %method,
            "operation shed, every call slot is busy"
        );
        ::metrics::counter!(
            "predictor_operations_shed_total",
            "method" => method.metric_tag(),
        )
        .increment(1);

        let shed =
            MetricRecord::counter(OPERATIONS_SHED, 1.0).with_tag("reason", reasons::OVERLOADED);
        if let Err(e) = self.gate.store.record(&[shed], method.metric_tag()) {
            warn!(error = %e, "failed to count shed operation");
        }
        OperationError::Overloaded
    }
}

impl<S> Service<Operation> for Admission<S>
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
        match Arc::clone(&self.gate.slots).try_acquire_owned() {
            Ok(slot) => {
                let fut = self.inner.call(op);
                Box::pin(async move {
                    let _slot = slot;
                    fut.await
                })
            }
            Err(_) => {
                let err = self.refuse(&op);
                Box::pin(async move { Err(err) })
            }
        }
    }
}
