//! Network module with deferred startup.
//!
//! `new()` takes the shared state, `start()` binds every listener and
//! reports the ports, and `serve()` runs the HTTP, RPC and optional metrics
//! listeners until shutdown, then drains in-flight calls.

use std::future::Future;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::handlers::{
    aggregate, health_handler, health_status, metadata, ping_handler, predict, prometheus_handler,
    ready_handler, route, send_feedback, transform_input, transform_output, AppState,
};
use super::middleware::build_http_layers;
use super::rpc;
use super::shutdown::ShutdownController;

/// Ports actually bound by [`NetworkModule::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundPorts {
    pub http: u16,
    pub rpc: u16,
    pub metrics: Option<u16>,
}

/// Owns the listeners of one serving process.
pub struct NetworkModule {
    state: AppState,
    http: Option<TcpListener>,
    rpc: Option<TcpListener>,
    metrics: Option<TcpListener>,
}

impl NetworkModule {
    #[must_use]
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            http: None,
            rpc: None,
            metrics: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.state.shutdown)
    }

    /// Binds the HTTP, RPC and (when configured) metrics listeners.
    ///
    /// # Errors
    ///
    /// Returns an error if any address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<BoundPorts> {
        let config = Arc::clone(&self.state.config);

        let http = TcpListener::bind(config.http_addr()).await?;
        let rpc = TcpListener::bind(config.rpc_addr()).await?;
        let metrics = match config.metrics_port {
            Some(port) => Some(TcpListener::bind(format!("{}:{port}", config.host)).await?),
            None => None,
        };

        let ports = BoundPorts {
            http: http.local_addr()?.port(),
            rpc: rpc.local_addr()?.port(),
            metrics: metrics.as_ref().map(|l| l.local_addr()).transpose()?.map(|a| a.port()),
        };
        info!(
            host = %config.host,
            http = ports.http,
            rpc = ports.rpc,
            metrics = ?ports.metrics,
            "listeners bound"
        );

        self.http = Some(http);
        self.rpc = Some(rpc);
        self.metrics = metrics;
        Ok(ports)
    }

    /// Serves until `shutdown` resolves or the controller is triggered, then
    /// waits up to `drain_timeout` for in-flight calls.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called, or if a listener fails.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let (Some(http), Some(rpc_listener)) = (self.http, self.rpc) else {
            anyhow::bail!("start() must be called before serve()");
        };
        let state = self.state;
        let ctrl = Arc::clone(&state.shutdown);

        tokio::spawn({
            let ctrl = Arc::clone(&ctrl);
            async move {
                shutdown.await;
                ctrl.trigger_shutdown();
            }
        });

        ctrl.set_ready();

        let rpc_task = tokio::spawn(rpc::serve(rpc_listener, state.clone()));
        let metrics_task = self.metrics.map(|listener| {
            let router = build_metrics_router(state.clone());
            let ctrl = Arc::clone(&ctrl);
            tokio::spawn(async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move { ctrl.triggered().await })
                    .await
            })
        });

        let router = build_router(state.clone());
        axum::serve(http, router)
            .with_graceful_shutdown({
                let ctrl = Arc::clone(&ctrl);
                async move { ctrl.triggered().await }
            })
            .await?;

        rpc_task.await??;
        if let Some(task) = metrics_task {
            task.await??;
        }

        if ctrl.wait_for_drain(state.config.drain_timeout).await {
            info!("all in-flight calls drained");
        } else {
            warn!(
                in_flight = ctrl.in_flight_count(),
                "drain timeout expired with calls in flight"
            );
        }
        Ok(())
    }
}

/// All HTTP routes with the middleware stack applied.
///
/// Operation endpoints accept `GET` and `POST`:
/// `/predict`, `/api/v1.0/predictions`, `/send-feedback`,
/// `/api/v1.0/feedback`, `/transform-input`, `/transform-output`, `/route`,
/// `/aggregate`. Plus `/health/status`, `/metadata`, `/health/ping`,
/// `/ready`, `/health`, `/prometheus` and `/metrics`.
pub fn build_router(state: AppState) -> Router {
    let layers = build_http_layers(&state.config);

    Router::new()
        .route("/predict", get(predict).post(predict))
        .route("/api/v1.0/predictions", get(predict).post(predict))
        .route("/send-feedback", get(send_feedback).post(send_feedback))
        .route("/api/v1.0/feedback", get(send_feedback).post(send_feedback))
        .route("/transform-input", get(transform_input).post(transform_input))
        .route("/transform-output", get(transform_output).post(transform_output))
        .route("/route", get(route).post(route))
        .route("/aggregate", get(aggregate).post(aggregate))
        .route("/health/status", get(health_status))
        .route("/metadata", get(metadata))
        .route("/health/ping", get(ping_handler))
        .route("/ready", get(ready_handler))
        .route("/health", get(health_handler))
        .route("/prometheus", get(prometheus_handler))
        .route("/metrics", get(prometheus_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(layers)
        .with_state(state)
}

/// Exposition only, for the dedicated metrics port.
pub fn build_metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/prometheus", get(prometheus_handler))
        .route("/metrics", get(prometheus_handler))
        .with_state(state)
}
