//! # minrpc-wire
//!
//! **Internal protocol implementation crate for minrpc.**
//!
//! This crate owns the wire format itself: the packed-argument codec, the
//! opcode table, and the event-handler state machine that drives a single
//! endpoint's side of the channel. It has no opinion on transports or
//! process topology — it only knows how to turn bytes into packets and
//! packets into calls against a [`session::ServingSession`].
//!
//! For application development, use the `minrpc` crate, which wraps this
//! one in a connection-oriented facade (`Endpoint`) and a concrete client
//! adapter.

// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::unused_async)]
#![allow(clippy::let_underscore_future)]
#![allow(clippy::future_not_send)] // Runtime-agnostic design
#![allow(clippy::uninlined_format_args)] // Style preference
#![allow(clippy::missing_errors_doc)] // Will add gradually
#![allow(clippy::doc_markdown)] // Too many false positives
#![allow(clippy::while_let_loop)] // Sometimes clearer as explicit loop
#![allow(clippy::option_if_let_else)] // Sometimes clearer as if/else
#![allow(clippy::never_loop)] // State machines use loop with early returns

pub mod config;
pub mod error;
pub mod handler;
pub mod proto;
pub mod session;
pub mod value;

pub use error::{Result, RpcError};
pub use handler::{Event, EventHandler, Role};
pub use proto::{Opcode, PROTOCOL_VERSION, TOINIT_KEY};
pub use session::{ServingSession, SessionFactory};
pub use value::{DataType, Device, ObjectKind, PackedValue, TensorDescriptor};

/// Prelude module for convenient imports.
///
/// ```rust
/// use minrpc_wire::prelude::*;
/// ```
pub mod prelude {
    pub use super::config::EndpointConfig;
    pub use super::{
        DataType, Device, Event, EventHandler, ObjectKind, Opcode, PackedValue, Result, Role,
        RpcError, ServingSession, SessionFactory, TensorDescriptor,
    };
    pub use bytes::Bytes;
}
