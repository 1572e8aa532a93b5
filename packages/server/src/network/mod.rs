//! Transports: the HTTP router, the binary RPC listener, and the shutdown
//! control they share.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod rpc;
pub mod shutdown;

pub use config::NetworkConfig;
pub use handlers::AppState;
pub use module::{build_metrics_router, build_router, BoundPorts, NetworkModule};
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
