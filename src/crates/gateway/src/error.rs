use std::io;
use std::net::SocketAddr;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors that can occur while configuring, acquiring or invoking the engine.
///
/// Query-level failures are not errors: they are reported in
/// [`QueryResult::errors`](crate::QueryResult::errors) of a successful call.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to spawn engine: {0}")]
    EngineStart(String),
    #[error("engine terminated early with status {0}")]
    EngineExited(ExitStatus),
    #[error("engine did not report a listen address within {0:?}")]
    StartupTimeout(Duration),
    #[error("failed to connect to engine at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("engine connection closed")]
    ConnectionClosed,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the protocol limit")]
    FrameTooLarge(usize),
    #[error("unexpected engine response: {0}")]
    UnexpectedResponse(String),
    /// Failure raised by the engine's entry operation, message kept verbatim.
    #[error("{0}")]
    Engine(String),
}

impl GatewayError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        GatewayError::Config(message.into())
    }

    pub(crate) fn engine_start(err: impl Into<String>) -> Self {
        GatewayError::EngineStart(err.into())
    }

    pub(crate) fn unexpected(message: impl Into<String>) -> Self {
        GatewayError::UnexpectedResponse(message.into())
    }
}
