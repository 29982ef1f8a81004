//! Low-level error types shared by the ring buffer, arena and transport
//! plumbing. The protocol-level error enum (malformed packets, unknown
//! opcodes, remote exceptions) lives one layer up in `minrpc-wire`; this one
//! only covers failures below the packet boundary.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// The underlying transport returned an error on read or write.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// The transport's read half returned EOF while bytes were still
    /// expected (mid-packet, or while the handshake was in flight).
    #[error("transport closed unexpectedly")]
    UnexpectedEof,

    /// A write was attempted after the other half of a duplex pipe had
    /// already been dropped.
    #[error("transport peer gone")]
    PeerGone,
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Errors a caller can reasonably retry after backing off, as opposed
    /// to ones that mean the channel is unusable going forward.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            Self::UnexpectedEof | Self::PeerGone => false,
        }
    }
}
