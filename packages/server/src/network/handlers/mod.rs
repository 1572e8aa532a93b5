//! HTTP handlers and the shared state they extract.

pub mod health;
pub mod metrics;
pub mod operations;

pub use health::{health_handler, ping_handler, ready_handler};
pub use metrics::prometheus_handler;
pub use operations::{
    aggregate, health_status, metadata, predict, route, send_feedback, transform_input,
    transform_output,
};

use std::sync::Arc;
use std::time::Instant;

use axum::response::{IntoResponse, Response};
use axum::Json;
use metrics_exporter_prometheus::PrometheusHandle;

use super::{NetworkConfig, ShutdownController};
use crate::metrics::{DeploymentLabels, MetricsAggregator};
use crate::service::{
    build_operation_pipeline, DispatchPlan, Dispatcher, Method, OperationContext, OperationError,
    OperationPipeline, ServerConfig, Transport,
};

/// State shared by every handler and by the RPC server. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: OperationPipeline,
    /// Tells the transports when to keep the native request.
    pub plan: Arc<DispatchPlan>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    pub server: Arc<ServerConfig>,
    pub metrics: Arc<MetricsAggregator>,
    pub deployment: Arc<DeploymentLabels>,
    /// Present when a `metrics` facade recorder is installed; its output is
    /// appended to the exposition.
    pub prometheus: Option<PrometheusHandle>,
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(
        dispatcher: Dispatcher,
        network: NetworkConfig,
        server: ServerConfig,
        deployment: DeploymentLabels,
    ) -> Self {
        let plan = dispatcher.plan();
        let metrics = dispatcher.metrics();
        let pipeline = build_operation_pipeline(dispatcher, &server);
        Self {
            pipeline,
            plan,
            shutdown: Arc::new(ShutdownController::new()),
            config: Arc::new(network),
            server: Arc::new(server),
            metrics,
            deployment: Arc::new(deployment),
            prometheus: None,
            start_time: Instant::now(),
        }
    }

    #[must_use]
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Context for one call with the configured timeout.
    #[must_use]
    pub fn context(&self, request_id: &str, method: Method, transport: Transport) -> OperationContext {
        OperationContext::new(
            request_id,
            method,
            transport,
            self.server.default_operation_timeout_ms,
        )
    }
}

/// Status error form with the mapped HTTP status.
impl IntoResponse for OperationError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_status().into_body())).into_response()
    }
}
