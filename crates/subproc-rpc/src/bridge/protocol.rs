//! Wire protocol types for caller/runner RPC connections.
//!
//! Every connection carries the same two frame types in opposite directions:
//! the dialing side writes [`RpcRequest`] and reads [`RpcResponse`], the
//! serving side does the reverse. Requests are tagged with a sequence number
//! so many calls can be outstanding on one connection.

use serde::{Deserialize, Serialize};

/// Reserved service name of the built-in stop/ping service.
pub const BASE_CHILD_SERVICE: &str = "baseChild";

pub const STOP_CHILD: &str = "RpcStopChild";
pub const PING: &str = "RpcPing";

/// Asks the runner to stop serving. Replies `0` before the listener closes.
pub const STOP_METHOD: &str = "baseChild.RpcStopChild";

/// Asks whether the runner is still alive (no stop requested yet).
pub const PING_METHOD: &str = "baseChild.RpcPing";

/// A call from the dialing side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub seq: u64,
    /// `service.Method`
    pub method: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl RpcRequest {
    pub fn new(seq: u64, method: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            seq,
            method: method.into(),
            args,
        }
    }
}

/// The reply to one [`RpcRequest`], matched by `seq`.
///
/// A response with `error` set is a remote failure; otherwise `reply` holds the
/// result (absent means JSON `null`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub seq: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(seq: u64, method: impl Into<String>, reply: serde_json::Value) -> Self {
        Self {
            seq,
            method: method.into(),
            reply: Some(reply),
            error: None,
        }
    }

    pub fn err(seq: u64, method: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            seq,
            method: method.into(),
            reply: None,
            error: Some(error.into()),
        }
    }

    /// Collapse into the call outcome seen by the waiter.
    pub fn into_result(self) -> Result<serde_json::Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.reply.unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// Split `service.Method` at its last dot.
pub fn split_method(method: &str) -> Option<(&str, &str)> {
    let (service, name) = method.rsplit_once('.')?;
    if service.is_empty() || name.is_empty() {
        return None;
    }
    Some((service, name))
}
