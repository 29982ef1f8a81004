//! minrpc-core
//!
//! Runtime-agnostic building blocks the wire protocol is built out of:
//! - A segmented, zero-copy-on-the-fast-path byte FIFO (`ring`)
//! - A per-packet bump arena for decoded argument views (`arena`)
//! - The borrow-based transport contract plus an in-process duplex pipe (`transport`)
//! - Low-level error types (`error`)
//! - A cancellation-safety guard for multi-step writes (`poison`)

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]

pub mod arena;
pub mod error;
pub mod poison;
pub mod ring;
pub mod transport;

pub mod prelude {
    pub use crate::arena::{Arena, ArenaSlice};
    pub use crate::error::{CoreError, Result as CoreResult};
    pub use crate::poison::PoisonGuard;
    pub use crate::ring::RingBuffer;
    pub use crate::transport::{DuplexPipe, Transport};
}
