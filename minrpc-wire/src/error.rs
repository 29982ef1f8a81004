//! Protocol-level error taxonomy.

use minrpc_core::error::CoreError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    /// Transport-level failure: a read/write on the channel failed, or the
    /// peer closed the connection while the handler was not at a clean
    /// shutdown boundary.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// A framing violation: unknown opcode, unknown packed-value type tag,
    /// or a tensor descriptor with a negative ndim. Fatal to the
    /// connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer's compiled protocol version string did not match ours at
    /// `InitServer` time. The connection survives, but no session was
    /// installed.
    #[error("protocol version mismatch: local={local:?} remote={remote:?}")]
    VersionMismatch { local: String, remote: String },

    /// The peer returned an `Exception` packet.
    #[error("{}", if *.is_timeout { message.clone() } else { format!("RPCError: {message}") })]
    RemoteException { message: String, is_timeout: bool },

    /// A call argument was rejected before being sent: an unsupported
    /// object kind, or an attempt to pass an RPC-session device across the
    /// wire.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A remote-object handle was referenced that this endpoint never
    /// registered (or has already freed).
    #[error("unknown remote handle: {0}")]
    UnknownHandle(u64),

    /// A client call was attempted after the endpoint poisoned itself
    /// (an in-flight write was cancelled) or after `shutdown()`.
    #[error("endpoint not connected (poisoned or shut down)")]
    NotConnected,

    /// The serving session's asynchronous completion reported failure
    /// without a specific exception message.
    #[error("async operation failed: {0}")]
    AsyncOpFailed(String),

    /// A lower-level ring-buffer/arena/transport failure.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// A `CallFunc`/copy/syscall packet arrived before any `InitServer`
    /// installed a serving session.
    #[error("no serving session installed")]
    NoSession,
}

pub type Result<T> = std::result::Result<T, RpcError>;

/// Exceptions whose message starts with this prefix are passed through to
/// the caller verbatim, without the `RPCError:` banner.
pub const TIMEOUT_ERROR_PREFIX: &str = "RPCSessionTimeoutError: ";

impl RpcError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Build a [`RemoteException`](Self::RemoteException) from a raw message
    /// string, classifying it as a timeout per the wire convention in §7.
    #[must_use]
    pub fn from_remote_message(message: String) -> Self {
        let is_timeout = message.starts_with(TIMEOUT_ERROR_PREFIX);
        Self::RemoteException { message, is_timeout }
    }

    /// True for errors that mean the connection itself is no longer usable.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Protocol(_) | Self::NotConnected
        )
    }
}
