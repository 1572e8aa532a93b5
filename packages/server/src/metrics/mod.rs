//! Metrics aggregation and exposition.
//!
//! - [`aggregator`]: worker-partitioned store for component metric records
//! - [`histogram`]: fixed buckets for TIMER records
//! - [`exposition`]: Prometheus text rendering with deployment labels

pub mod aggregator;
pub mod exposition;
pub mod histogram;

pub use aggregator::{
    current_worker, MetricValue, MetricsAggregator, MetricsSnapshot, SnapshotEntry, WorkerId,
};
pub use exposition::{render, DeploymentLabels};
pub use histogram::{Histogram, BUCKETS};
