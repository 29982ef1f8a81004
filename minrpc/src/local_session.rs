//! A host-only [`ServingSession`] reference implementation.
//!
//! Real embedders (a CUDA worker, a remote accelerator shim) implement
//! their own `ServingSession`; this one exists so the crate's tests and
//! examples have something concrete to install behind an [`Endpoint`],
//! and so a multi-hop chain can terminate somewhere without pulling in a
//! real device backend. Every allocation lives in a plain `Vec<u8>`
//! behind a handle; every device/stream syscall is a host-only stub.
//!
//! Locking follows the same shape the rest of this crate's registries
//! use: a handful of `parking_lot::Mutex`-guarded maps, since sessions
//! are shared behind an `Arc` and called from async contexts that never
//! hold the guard across an `.await`.

use async_trait::async_trait;
use bytes::Bytes;
use minrpc_wire::error::{Result, RpcError};
use minrpc_wire::session::{ServingSession, DEV_ATTR_EXISTS};
use minrpc_wire::value::{DataType, Device, ObjectKind, TensorDescriptor};
use minrpc_wire::PackedValue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type NativeFn = dyn Fn(Vec<PackedValue>) -> Result<Vec<PackedValue>> + Send + Sync;

/// A host-resident serving session: function calls dispatch to Rust
/// closures registered with [`LocalSession::register_fn`]; device memory
/// is backed by plain heap buffers.
pub struct LocalSession {
    names: Mutex<HashMap<String, u64>>,
    functions: Mutex<HashMap<u64, Arc<NativeFn>>>,
    buffers: Mutex<HashMap<u64, Vec<u8>>>,
    streams: Mutex<std::collections::HashSet<u64>>,
    next_handle: AtomicU64,
}

impl Default for LocalSession {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            names: Mutex::new(HashMap::new()),
            functions: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            streams: Mutex::new(std::collections::HashSet::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Register a callable function under `name`, returning the handle a
    /// peer would get back from `GetGlobalFunc`.
    pub fn register_fn(
        &self,
        name: impl Into<String>,
        f: impl Fn(Vec<PackedValue>) -> Result<Vec<PackedValue>> + Send + Sync + 'static,
    ) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.names.lock().insert(name.into(), handle);
        self.functions.lock().insert(handle, Arc::new(f));
        handle
    }

    fn alloc_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl ServingSession for LocalSession {
    async fn call(&self, handle: u64, args: Vec<PackedValue>) -> Result<Vec<PackedValue>> {
        let f = self
            .functions
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(RpcError::UnknownHandle(handle))?;
        f(args)
    }

    async fn get_global_func(&self, name: &str) -> Result<u64> {
        self.names
            .lock()
            .get(name)
            .copied()
            .ok_or_else(|| RpcError::invalid_argument(format!("no global function {name:?}")))
    }

    async fn free_handle(&self, kind: ObjectKind, handle: u64) -> Result<()> {
        match kind {
            ObjectKind::Function => {
                self.functions.lock().remove(&handle);
            }
            ObjectKind::Buffer => {
                self.buffers.lock().remove(&handle);
            }
            ObjectKind::Stream => {
                self.streams.lock().remove(&handle);
            }
        }
        Ok(())
    }

    async fn dev_set_device(&self, _dev: Device) -> Result<()> {
        Ok(())
    }

    async fn dev_get_attr(&self, dev: Device, attr_kind: i32) -> Result<i64> {
        if attr_kind == DEV_ATTR_EXISTS {
            return Ok(i64::from(dev.is_host()));
        }
        Ok(0)
    }

    async fn dev_alloc_data(
        &self,
        _dev: Device,
        nbytes: u64,
        _alignment: u64,
        _dtype_hint: DataType,
    ) -> Result<u64> {
        let handle = self.alloc_handle();
        self.buffers.lock().insert(handle, vec![0u8; nbytes as usize]);
        Ok(handle)
    }

    async fn dev_alloc_data_with_scope(
        &self,
        tensor: &TensorDescriptor,
        _scope: Option<&str>,
    ) -> Result<u64> {
        let handle = self.alloc_handle();
        self.buffers
            .lock()
            .insert(handle, vec![0u8; tensor.nbytes() as usize]);
        Ok(handle)
    }

    async fn dev_free_data(&self, _dev: Device, ptr: u64) -> Result<()> {
        self.buffers.lock().remove(&ptr);
        Ok(())
    }

    async fn copy_among_remote(
        &self,
        from: &TensorDescriptor,
        to: &TensorDescriptor,
        _stream: Option<u64>,
    ) -> Result<()> {
        let nbytes = from.nbytes() as usize;
        let mut buffers = self.buffers.lock();
        let src = buffers
            .get(&from.data)
            .ok_or(RpcError::UnknownHandle(from.data))?;
        let region = src
            .get(from.byte_offset as usize..from.byte_offset as usize + nbytes)
            .ok_or_else(|| RpcError::invalid_argument("copy_among_remote source out of bounds"))?
            .to_vec();
        let dst = buffers
            .get_mut(&to.data)
            .ok_or(RpcError::UnknownHandle(to.data))?;
        let dst_region = dst
            .get_mut(to.byte_offset as usize..to.byte_offset as usize + nbytes)
            .ok_or_else(|| RpcError::invalid_argument("copy_among_remote destination out of bounds"))?;
        dst_region.copy_from_slice(&region);
        Ok(())
    }

    async fn dev_create_stream(&self, _dev: Device) -> Result<u64> {
        let handle = self.alloc_handle();
        self.streams.lock().insert(handle);
        Ok(handle)
    }

    async fn dev_free_stream(&self, _dev: Device, stream: u64) -> Result<()> {
        self.streams.lock().remove(&stream);
        Ok(())
    }

    async fn dev_stream_sync(&self, _dev: Device, _stream: u64) -> Result<()> {
        Ok(())
    }

    async fn dev_set_stream(&self, _dev: Device, _stream: u64) -> Result<()> {
        Ok(())
    }

    async fn dev_get_current_stream(&self, _dev: Device) -> Result<u64> {
        Ok(0)
    }

    fn is_host_resident(&self, _tensor: &TensorDescriptor) -> bool {
        true
    }

    async fn copy_from_device(&self, tensor: &TensorDescriptor, nbytes: u64) -> Result<Bytes> {
        let buffers = self.buffers.lock();
        let buf = buffers
            .get(&tensor.data)
            .ok_or(RpcError::UnknownHandle(tensor.data))?;
        let start = tensor.byte_offset as usize;
        let end = start + nbytes as usize;
        let slice = buf
            .get(start..end)
            .ok_or_else(|| RpcError::invalid_argument("copy_from_device out of bounds"))?;
        Ok(Bytes::copy_from_slice(slice))
    }

    async fn copy_to_device(&self, tensor: &TensorDescriptor, nbytes: u64, data: Bytes) -> Result<()> {
        let mut buffers = self.buffers.lock();
        let buf = buffers
            .get_mut(&tensor.data)
            .ok_or(RpcError::UnknownHandle(tensor.data))?;
        let start = tensor.byte_offset as usize;
        let end = start + nbytes as usize;
        let dst = buf
            .get_mut(start..end)
            .ok_or_else(|| RpcError::invalid_argument("copy_to_device out of bounds"))?;
        dst.copy_from_slice(&data);
        Ok(())
    }
}
