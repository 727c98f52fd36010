//! subproc-rpc: run work in isolated worker processes and talk to them over
//! loopback RPC.
//!
//! The parent spawns a runner program with a [`SubProcCaller`], which hands the
//! runner its RPC port on the command line and dials it. The runner serves the
//! parent's calls with a [`SubProcRunner`] and can call back into services the
//! parent exposes through a [`CallbackListener`].

mod abort;
mod base_child;

pub mod bridge;
pub mod callback;
pub mod caller;
pub mod dial;
pub mod error;
pub mod logging;
pub mod ports;
pub mod rpc;
pub mod runner;
pub mod types;

pub use bridge::protocol::{BASE_CHILD_SERVICE, PING_METHOD, STOP_METHOD};
pub use callback::{CallbackClient, CallbackListener};
pub use caller::{CallerConfig, SubProcCaller, Termination};
pub use dial::DialPolicy;
pub use error::{ErrorKind, Result, RpcError, ServiceError, SprError};
pub use ports::PortAllocator;
pub use rpc::{CallContext, MethodService, RpcClient, RpcServer, RpcService, ServiceRegistry};
pub use runner::{RunnerArgs, RunnerConfig, SubProcRunner};
pub use types::{TaggedValue, TypeAdvertisement, TypeRegistry};
