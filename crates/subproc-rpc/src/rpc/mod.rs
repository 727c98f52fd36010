//! Multiplexed request/response RPC over framed loopback TCP.

pub mod client;
pub mod server;
pub mod service;

pub use client::RpcClient;
pub use server::RpcServer;
pub use service::{CallContext, MethodService, RpcService, ServiceRegistry};
