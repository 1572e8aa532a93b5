//! Binary RPC transport: length-delimited MessagePack frames over TCP.

pub mod client;
pub mod frame;
pub mod reflection;
pub mod server;

pub use client::RpcClient;
pub use frame::{RequestFrame, ResponseFrame, RpcError};
pub use reflection::{ServiceDescriptor, MODEL_SERVICE, REFLECTION_SERVICE};
pub use server::serve;
