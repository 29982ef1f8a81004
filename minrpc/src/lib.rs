//! # minrpc
//!
//! A minimal, bidirectional remote procedure call runtime built on
//! `io_uring`.
//!
//! ## Architecture
//!
//! minrpc is structured in the same layered way as the messaging kernel
//! it grew out of:
//!
//! - **`minrpc-core`**: runtime-agnostic primitives — ring buffer, arena,
//!   the `Transport` abstraction, the poison-guard pattern.
//! - **`minrpc-wire`**: the packed-argument codec and the protocol state
//!   machine (sans-IO, pure).
//! - **`minrpc`**: this crate — a connection-oriented facade
//!   ([`Endpoint`]) plus a host-only reference [`ServingSession`]
//!   implementation and owning remote handles.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use minrpc::{Endpoint, LocalSession, PackedValue};
//! use minrpc_core::transport::DuplexPipe;
//! use minrpc_wire::config::EndpointConfig;
//! use std::sync::Arc;
//!
//! # #[compio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (client_io, server_io) = DuplexPipe::pair();
//!
//! let session = Arc::new(LocalSession::new());
//! session.register_fn("double", |args| {
//!     let PackedValue::Int(n) = args[0] else {
//!         return Err(minrpc_wire::error::RpcError::invalid_argument("expected int"));
//!     };
//!     Ok(vec![PackedValue::Int(n * 2)])
//! });
//! let mut server = Endpoint::server(server_io, EndpointConfig::default(), session);
//! compio::runtime::spawn(async move { let _ = server.server_loop().await; }).detach();
//!
//! let mut client = Endpoint::client(client_io, EndpointConfig::default());
//! client.init_remote_session("minrpc.LocalSession", vec![]).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Safety
//!
//! - `unsafe` code is isolated to `minrpc-core/src/arena.rs` (bump
//!   allocator page lifetime).
//! - The wire and facade layers are 100% safe Rust.

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::future_not_send)] // Runtime-agnostic design
#![allow(clippy::missing_errors_doc)] // Will add gradually
#![allow(clippy::doc_markdown)] // Too many false positives

pub mod client;
pub mod endpoint;
pub mod local_session;
pub mod session_adapter;

/// Development helpers (benches/tests)
pub mod dev_tracing;

pub use client::RemoteObjectRef;
pub use endpoint::Endpoint;
pub use session_adapter::ClientSession;
pub use local_session::LocalSession;

// Re-export the wire and core types embedders actually need day to day,
// so most call sites only depend on this crate.
pub use bytes::Bytes;
pub use minrpc_core::transport::{DuplexPipe, Transport};
pub use minrpc_wire::config::EndpointConfig;
pub use minrpc_wire::error::{Result, RpcError};
pub use minrpc_wire::proto::Opcode;
pub use minrpc_wire::session::{ServingSession, SessionFactory};
pub use minrpc_wire::value::{DataType, Device, ObjectKind, PackedValue, TensorDescriptor};

/// Prelude module for convenient imports.
///
/// ```rust
/// use minrpc::prelude::*;
/// ```
pub mod prelude {
    pub use super::{
        ClientSession, DataType, Device, Endpoint, EndpointConfig, LocalSession, ObjectKind,
        Opcode, PackedValue, RemoteObjectRef, Result, RpcError, ServingSession, SessionFactory,
        TensorDescriptor, Transport,
    };
    pub use bytes::Bytes;
}
