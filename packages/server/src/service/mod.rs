//! The operation pipeline.
//!
//! 1. **Operation** (`operation`): method, context, request and error types
//! 2. **Capabilities** (`capability`): per-method tier plan for a component
//! 3. **Middleware** (`middleware`): load shedding, timeout, request timing
//! 4. **Dispatch** (`dispatcher`): raw, legacy, typed and neutral tiers
//! 5. **Assembly** (`response`): builds the response envelope

pub mod capability;
pub mod config;
pub mod dispatcher;
pub mod middleware;
pub mod operation;
pub(crate) mod response;

pub use capability::{DispatchPlan, Tier, TierPlan};
pub use config::ServerConfig;
pub use dispatcher::Dispatcher;
pub use middleware::{build_operation_pipeline, OperationPipeline};
pub use operation::{
    Method, NativeRequest, Operation, OperationContext, OperationError, OperationResponse,
    Request, Transport,
};
