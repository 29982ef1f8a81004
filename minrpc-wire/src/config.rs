//! Endpoint configuration and compile-time defaults.
//!
//! Mirrors the teacher's `BufferConfig`: a handful of compile-time
//! constants plus a small struct an embedder can override. The core never
//! reads the process environment directly — §6's `rpc_chunk_max_size_bytes`
//! and `remote_key` knobs are surfaced here as fields the embedder fills in
//! from whatever configuration source it already uses (env, CLI flags, a
//! config file); that wiring is out of scope for this crate.

use std::time::Duration;

/// Default maximum packet body size negotiated for chunked transfers when
/// the peer does not export `tvm.rpc.server.GetCRTMaxPacketSize`.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 3 * 1024 * 1024 + 128;

/// Initial read-chunk size requested from the transport per `recv` call.
pub const DEFAULT_READ_CHUNK: usize = 8192;

/// Initial capacity reserved in each ring buffer on construction.
pub const DEFAULT_RING_CAPACITY: usize = 4096;

/// Endpoint-level configuration supplied by the embedder at construction.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Upper bound this side is willing to negotiate for a single
    /// `CopyToRemote`/`CopyFromRemote` chunk. The client adapter queries
    /// the peer's actual limit at runtime; this is the local ceiling and
    /// the fallback when the peer does not expose the query function.
    pub max_packet_size: usize,

    /// Client-supplied identifier presented to the server during the
    /// handshake (see [`crate::proto::TOINIT_KEY`] for the read-from-wire
    /// sentinel). Opaque to the protocol; only logged and compared.
    pub remote_key: String,

    /// How long the handshake (`InitHeader` state) may take before the
    /// embedder should consider the connection dead. Not enforced inside
    /// this crate directly — the core has no internal timers (§5) — but
    /// carried here so an embedder's own timeout wrapper has one place to
    /// read it from.
    pub handshake_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            remote_key: String::new(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl EndpointConfig {
    #[must_use]
    pub fn with_remote_key(mut self, key: impl Into<String>) -> Self {
        self.remote_key = key.into();
        self
    }

    #[must_use]
    pub const fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }
}
