//! Predictor server: serves a pluggable [`component::Component`] over HTTP
//! and a length-delimited MessagePack RPC transport, aggregates component
//! metrics for Prometheus, and drives a running predictor from files in the
//! batch pipeline.

pub mod batch;
pub mod component;
pub mod config;
pub mod metrics;
pub mod network;
pub mod service;
pub mod telemetry;
pub mod worker;
