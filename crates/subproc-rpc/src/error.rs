//! Error types for supervision and RPC.

use std::time::Duration;

/// Coarse classification of a [`SprError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Programmer misuse: already running, not connected, duplicate start.
    Logical,
    /// Bad arguments or unparsable ports.
    InvalidParam,
    /// No port available, listen/spawn/dial failure.
    Internal,
    /// Dial budget exhausted, call timed out, or the peer reported an error.
    Remote,
}

/// Errors from a single RPC call on an established channel.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("connection closed")]
    Closed,
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors raised by service handlers. Sent back to the caller as the
/// response's error string.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("rpc: can't find service {0}")]
    UnknownService(String),
    #[error("rpc: can't find method {0}")]
    UnknownMethod(String),
    #[error("rpc: service/method request ill-formed: {0}")]
    IllFormed(String),
    #[error("rpc: invalid args for {method}: {source}")]
    InvalidArgs {
        method: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Failed(String),
}

impl ServiceError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SprError {
    #[error("has been created: {0}")]
    AlreadyCreated(String),
    #[error("has been running: {0}")]
    AlreadyRunning(String),
    #[error("has been connected")]
    AlreadyConnected,
    #[error("not connected: {0}")]
    NotConnected(String),
    #[error("parent did not set a callback port")]
    NoCallback,
    #[error("service name already registered: {0}")]
    DuplicateService(String),
    #[error("type name {name} already registered for a different type")]
    TypeConflict { name: String },
    #[error("type not registered: {0}")]
    UnregisteredType(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("has no available port in {min}..={max}")]
    NoPortAvailable { min: u16, max: u16 },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to connect {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("internal error: {0}")]
    Internal(String),

    #[error("connect {addr} failed after {attempts} attempts: {source}")]
    ConnectTimeout {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl SprError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyCreated(_)
            | Self::AlreadyRunning(_)
            | Self::AlreadyConnected
            | Self::NotConnected(_)
            | Self::NoCallback
            | Self::DuplicateService(_)
            | Self::TypeConflict { .. }
            | Self::UnregisteredType(_) => ErrorKind::Logical,
            Self::InvalidParam(_) => ErrorKind::InvalidParam,
            Self::NoPortAvailable { .. }
            | Self::Spawn { .. }
            | Self::Listen { .. }
            | Self::Dial { .. }
            | Self::Internal(_) => ErrorKind::Internal,
            Self::ConnectTimeout { .. } | Self::Rpc(_) => ErrorKind::Remote,
        }
    }

    pub fn invalid_param(message: impl Into<String>) -> Self {
        Self::InvalidParam(message.into())
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::NotConnected(message.into())
    }
}

pub type Result<T, E = SprError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(SprError::AlreadyCreated("w".into()).kind(), ErrorKind::Logical);
        assert_eq!(SprError::NoCallback.kind(), ErrorKind::Logical);
        assert_eq!(SprError::invalid_param("port").kind(), ErrorKind::InvalidParam);
        assert_eq!(
            SprError::NoPortAvailable { min: 1, max: 2 }.kind(),
            ErrorKind::Internal
        );
        assert_eq!(
            SprError::Rpc(RpcError::Timeout(Duration::from_secs(1))).kind(),
            ErrorKind::Remote
        );
    }

    #[test]
    fn service_errors_name_the_missing_target() {
        assert_eq!(
            ServiceError::UnknownService("nope".into()).to_string(),
            "rpc: can't find service nope"
        );
        assert_eq!(
            ServiceError::UnknownMethod("echo.Nope".into()).to_string(),
            "rpc: can't find method echo.Nope"
        );
    }
}
