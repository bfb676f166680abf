//! Error types for the proxy RPC client

use nfs4proto::{nfsstat_name, NfsStat4};
use std::time::Duration;
use thiserror::Error;
use xdr::XdrError;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("RPC timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection lost before the reply arrived")]
    Reconnecting,

    #[error("Client is shutting down")]
    ShuttingDown,

    #[error("Reply of {len} bytes exceeds receive buffer of {capacity} bytes")]
    ResponseTooLarge { len: usize, capacity: usize },

    #[error("Encoding error: {0}")]
    Encode(XdrError),

    #[error("Decoding error: {0}")]
    Decode(XdrError),

    #[error("RPC program unavailable")]
    ProgUnavail,

    #[error("RPC program version mismatch (server supports {low}..={high})")]
    ProgMismatch { low: u32, high: u32 },

    #[error("RPC procedure unavailable")]
    ProcUnavail,

    #[error("Server could not decode the arguments")]
    GarbageArgs,

    #[error("Server system error")]
    SystemErr,

    #[error("RPC version mismatch (server supports {low}..={high})")]
    RpcMismatch { low: u32, high: u32 },

    #[error("RPC authentication failed (auth_stat {0})")]
    AuthError(u32),

    #[error("{op} failed: {}", nfsstat_name(.status.to_owned()))]
    Nfs { op: &'static str, status: NfsStat4 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Transport failures the executor absorbs by waiting for a new socket
    pub fn is_retryable(&self) -> bool {
        match self {
            ProxyError::Reconnecting => true,
            ProxyError::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Errors no caller can get past by retrying
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProxyError::ShuttingDown | ProxyError::Config(_))
    }

    /// The NFS status carried by a failed session operation
    pub fn nfs_status(&self) -> Option<NfsStat4> {
        match self {
            ProxyError::Nfs { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ProxyError::Timeout(_) => "Timeout",
            ProxyError::Reconnecting | ProxyError::Io(_) => "Connection",
            ProxyError::ShuttingDown => "Shutdown",
            ProxyError::ResponseTooLarge { .. } | ProxyError::Encode(_) | ProxyError::Decode(_) => {
                "Encoding"
            }
            ProxyError::ProgUnavail
            | ProxyError::ProgMismatch { .. }
            | ProxyError::ProcUnavail
            | ProxyError::GarbageArgs
            | ProxyError::SystemErr
            | ProxyError::RpcMismatch { .. }
            | ProxyError::AuthError(_) => "RpcRejected",
            ProxyError::Nfs { .. } => "Nfs",
            ProxyError::Protocol(_) => "Protocol",
            ProxyError::Config(_) => "Configuration",
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
