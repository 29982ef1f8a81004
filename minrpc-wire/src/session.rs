//! The serving session contract (§1: "out of scope, but the core treats it
//! as an opaque capability").
//!
//! This crate never looks up functions by name, allocates device memory,
//! or touches a real accelerator — it only needs *something* that can do
//! those things on request. [`ServingSession`] is that something: the
//! event handler holds an `Arc<dyn ServingSession>` once one has been
//! installed (lazily, on the first `InitServer` packet) and calls through
//! it for every `CallFunc` and syscall opcode.
//!
//! A reference host-only implementation used by the test suite and by
//! `minrpc`'s client adapter lives in the `minrpc` crate (`local_session`),
//! one layer up, since it is an embedder concern rather than a protocol
//! concern.

use crate::error::Result;
use crate::value::{DataType, Device, ObjectKind, PackedValue, TensorDescriptor};
use async_trait::async_trait;
use bytes::Bytes;

/// Device attribute kind requested by `DevGetAttr`. Only `Exists` has
/// protocol-mandated fallback behavior (§4.4: return 0 if the device API
/// is missing); the rest are forwarded to the session uninterpreted.
pub const DEV_ATTR_EXISTS: i32 = 0;

/// The local executor behind an endpoint acting as a server: looks up and
/// invokes functions by handle, and answers the device-management
/// syscalls. One instance is installed per endpoint via
/// [`SessionFactory`] on the first `InitServer` packet.
#[async_trait]
pub trait ServingSession: Send + Sync {
    /// Invoke the function named by `handle` with `args`, returning its
    /// packed result. Failures surface to the peer as an `Exception`
    /// packet, never propagated locally (§4.4 rule 2).
    async fn call(&self, handle: u64, args: Vec<PackedValue>) -> Result<Vec<PackedValue>>;

    /// `GetGlobalFunc(name)` — resolve a function by name to a handle.
    async fn get_global_func(&self, name: &str) -> Result<u64>;

    /// `FreeHandle(kind, handle)` — release a resource this session owns.
    /// Must be idempotent-safe from the protocol's point of view: the
    /// handler only ever calls this once per handle (§3 invariant), but a
    /// session implementation should not assume it is the only caller.
    async fn free_handle(&self, kind: ObjectKind, handle: u64) -> Result<()>;

    async fn dev_set_device(&self, dev: Device) -> Result<()>;

    /// Returns `Ok(0)` when `attr_kind == DEV_ATTR_EXISTS` and this
    /// session has no backend for `dev` — the uniform "missing device
    /// API" fallback from §4.4 — rather than an error.
    async fn dev_get_attr(&self, dev: Device, attr_kind: i32) -> Result<i64>;

    async fn dev_alloc_data(
        &self,
        dev: Device,
        nbytes: u64,
        alignment: u64,
        dtype_hint: DataType,
    ) -> Result<u64>;

    async fn dev_alloc_data_with_scope(
        &self,
        tensor: &TensorDescriptor,
        scope: Option<&str>,
    ) -> Result<u64>;

    async fn dev_free_data(&self, dev: Device, ptr: u64) -> Result<()>;

    /// `CopyAmongRemote(from, to, stream)` — device-to-device copy local
    /// to this session. The source device governs the copy unless it is
    /// host-resident, per §4.4.
    async fn copy_among_remote(
        &self,
        from: &TensorDescriptor,
        to: &TensorDescriptor,
        stream: Option<u64>,
    ) -> Result<()>;

    async fn dev_create_stream(&self, dev: Device) -> Result<u64>;
    async fn dev_free_stream(&self, dev: Device, stream: u64) -> Result<()>;
    async fn dev_stream_sync(&self, dev: Device, stream: u64) -> Result<()>;
    async fn dev_set_stream(&self, dev: Device, stream: u64) -> Result<()>;
    async fn dev_get_current_stream(&self, dev: Device) -> Result<u64>;

    /// True when `tensor` is backed by host memory this session can hand
    /// out directly, as opposed to memory that must be staged through a
    /// device-specific copy first (§4.4 rules 3-4). The handler logs this
    /// alongside every `copy_from_device`/`copy_to_device` call but does
    /// not branch on it directly: whether to stage is `copy_from_device`/
    /// `copy_to_device`'s own decision, since only the implementation
    /// knows how to reach device memory. Implementations must answer
    /// `false` for any dtype whose element width is not a whole number
    /// of bytes (§9 open question, resolved in the staging direction).
    fn is_host_resident(&self, tensor: &TensorDescriptor) -> bool;

    /// Copy `nbytes` out of `tensor` starting at its byte offset. Used
    /// both for the host fast path and the staged device path — an
    /// implementation backed by a real accelerator performs the device
    /// copy here; a host-only implementation just slices its buffer.
    async fn copy_from_device(&self, tensor: &TensorDescriptor, nbytes: u64) -> Result<Bytes>;

    /// Copy `data` into `tensor` at its byte offset.
    async fn copy_to_device(
        &self,
        tensor: &TensorDescriptor,
        nbytes: u64,
        data: Bytes,
    ) -> Result<()>;
}

/// Constructs a [`ServingSession`] by name on the first `InitServer`
/// packet (§4.4 rule 1): `packed_args[0]` is the constructor name, the
/// remaining args are forwarded verbatim.
pub trait SessionFactory: Send + Sync {
    fn construct(
        &self,
        name: &str,
        args: Vec<PackedValue>,
    ) -> Result<std::sync::Arc<dyn ServingSession>>;
}

impl<F> SessionFactory for F
where
    F: Fn(&str, Vec<PackedValue>) -> Result<std::sync::Arc<dyn ServingSession>> + Send + Sync,
{
    fn construct(
        &self,
        name: &str,
        args: Vec<PackedValue>,
    ) -> Result<std::sync::Arc<dyn ServingSession>> {
        self(name, args)
    }
}
