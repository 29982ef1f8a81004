//! Remote Object References: an owning handle to a function, buffer, or
//! stream that lives on the peer, released automatically on drop.
//!
//! The protocol core's event handler never tracks handle ownership
//! itself (§3) — it only forwards `FreeHandle` when asked. This module
//! is where "asked" becomes automatic: a [`RemoteObjectRef`] queues its
//! release onto the owning [`Endpoint`]'s free-channel when dropped,
//! and the endpoint drains that queue at the start of its next call
//! (`Endpoint::flush_pending_frees`). Queueing from `Drop` rather than
//! sending the `FreeHandle` packet inline keeps `Drop::drop` synchronous,
//! which a real `async fn drop` cannot be in safe Rust today.

use minrpc_wire::value::ObjectKind;

/// An owning reference to a peer-side function, buffer, or stream
/// handle. Dropping it enqueues exactly one `FreeHandle` release; the
/// owning endpoint's next call (or an explicit
/// `Endpoint::flush_pending_frees`) sends it.
pub struct RemoteObjectRef {
    kind: ObjectKind,
    handle: u64,
    free_tx: flume::Sender<(ObjectKind, u64)>,
}

impl RemoteObjectRef {
    /// Wrap a raw handle obtained from a packed reply (`GetGlobalFunc`,
    /// `DevAllocData`, `DevCreateStream`, ...). `free_tx` should come from
    /// the same [`crate::endpoint::Endpoint`] the handle was minted on —
    /// see [`crate::endpoint::Endpoint::free_queue`].
    #[must_use]
    pub const fn new(kind: ObjectKind, handle: u64, free_tx: flume::Sender<(ObjectKind, u64)>) -> Self {
        Self {
            kind,
            handle,
            free_tx,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        self.kind
    }

    #[must_use]
    pub const fn handle(&self) -> u64 {
        self.handle
    }
}

impl Drop for RemoteObjectRef {
    fn drop(&mut self) {
        // An unbounded flume sender's `send` never blocks; the only
        // failure mode is the receiver (the endpoint) already gone, in
        // which case there is nothing left to free anyway.
        let _ = self.free_tx.send((self.kind, self.handle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_enqueues_exactly_one_release() {
        let (tx, rx) = flume::unbounded();
        {
            let _obj = RemoteObjectRef::new(ObjectKind::Buffer, 7, tx);
        }
        let (kind, handle) = rx.try_recv().expect("release should be queued");
        assert_eq!(kind, ObjectKind::Buffer);
        assert_eq!(handle, 7);
        assert!(rx.try_recv().is_err());
    }
}
