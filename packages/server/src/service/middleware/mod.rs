//! Tower middleware layers for the operation pipeline.
//!
//! - [`load_shed`]: rejects and counts calls beyond the concurrency limit
//! - [`timeout`]: per-call deadline from the operation context
//! - [`metrics`]: request timing into the metrics store and a tracing span
//! - [`pipeline`]: composes the layers around the dispatcher

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use load_shed::{AdmissionLayer, OPERATIONS_SHED};
pub use metrics::{MetricsLayer, REQUEST_DURATION};
pub use pipeline::{build_operation_pipeline, OperationPipeline};
pub use timeout::TimeoutLayer;
