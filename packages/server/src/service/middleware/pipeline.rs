//! Composes the middleware layers around the dispatcher.

use tower::ServiceBuilder;

use super::load_shed::{Admission, AdmissionLayer};
use super::metrics::{MetricsLayer, MetricsService};
use super::timeout::{TimeoutLayer, TimeoutService};
use crate::service::config::ServerConfig;
use crate::service::dispatcher::Dispatcher;

/// The full operation stack, named so it can live in shared state.
pub type OperationPipeline = Admission<TimeoutService<MetricsService<Dispatcher>>>;

/// Wraps the dispatcher, outermost first:
/// 1. `AdmissionLayer`: refuse and count work beyond the concurrency limit
/// 2. `TimeoutLayer`: per-call deadline
/// 3. `MetricsLayer`: request timing, closest to the dispatcher
#[must_use]
pub fn build_operation_pipeline(dispatcher: Dispatcher, config: &ServerConfig) -> OperationPipeline {
    let store = dispatcher.metrics();
    ServiceBuilder::new()
        .layer(AdmissionLayer::new(
            config.max_concurrent_operations,
            std::sync::Arc::clone(&store),
        ))
        .layer(TimeoutLayer)
        .layer(MetricsLayer::new(store))
        .service(dispatcher)
}
