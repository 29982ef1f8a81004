//! The connection-facing facade: pairs an [`EventHandler`] with a
//! concrete [`Transport`] and drives the two together.
//!
//! Every public method takes `&mut self`, so the borrow checker is the
//! serialization mechanism the protocol needs (§3: "at most one
//! outstanding client call per connection") — two calls can never run
//! concurrently against the same `Endpoint` without the caller wrapping
//! it in its own `Arc<parking_lot::Mutex<_>>` or handing it to a single
//! owning task, the way the teacher's per-socket actors already do.

use bytes::Bytes;
use minrpc_core::poison::PoisonGuard;
use minrpc_core::transport::Transport;
use minrpc_wire::config::{EndpointConfig, DEFAULT_READ_CHUNK};
use minrpc_wire::error::{Result, RpcError};
use minrpc_wire::handler::{Event, EventHandler, Role};
use minrpc_wire::proto::Opcode;
use minrpc_wire::session::SessionFactory;
use minrpc_wire::value::{ObjectKind, PackedValue, TensorDescriptor};
use std::sync::Arc;
use tracing::trace;

/// A no-op factory for endpoints that will never receive `InitServer`
/// (pure clients that only ever issue calls).
struct NoSessionFactory;

impl SessionFactory for NoSessionFactory {
    fn construct(
        &self,
        name: &str,
        _args: Vec<PackedValue>,
    ) -> Result<Arc<dyn minrpc_wire::session::ServingSession>> {
        Err(RpcError::protocol(format!(
            "this endpoint does not serve sessions, got InitServer({name:?})"
        )))
    }
}

pub struct Endpoint<T> {
    transport: T,
    handler: EventHandler,
    max_packet_size: usize,
    free_tx: flume::Sender<(ObjectKind, u64)>,
    free_rx: flume::Receiver<(ObjectKind, u64)>,
    /// Set by [`PoisonGuard`] if a flush is dropped mid-write (e.g. an
    /// embedder's executor cancels a timed-out call). Once poisoned the
    /// connection is assumed to hold a half-written frame and every public
    /// method refuses further use (§5 expansion: cancellation safety of
    /// the write path).
    poisoned: bool,
    /// Run once by [`Self::server_loop`] before its first `drive` step.
    pre_start_hook: Option<Box<dyn FnOnce() + Send>>,
    /// Run once by [`Self::server_loop`] after it observes `Event::Shutdown`.
    post_shutdown_hook: Option<Box<dyn FnOnce() + Send>>,
}

impl<T: Transport> Endpoint<T> {
    /// Build a pure client endpoint: it never installs a serving session
    /// of its own, only issues calls to the peer.
    #[must_use]
    pub fn client(transport: T, config: EndpointConfig) -> Self {
        Self::with_factory(transport, config, Role::Client, Arc::new(NoSessionFactory))
    }

    /// Build a server endpoint: the first `InitServer` packet it receives
    /// constructs a session via `factory`.
    #[must_use]
    pub fn server(
        transport: T,
        config: EndpointConfig,
        session: Arc<dyn minrpc_wire::session::ServingSession>,
    ) -> Self {
        struct Installed(Arc<dyn minrpc_wire::session::ServingSession>);
        impl SessionFactory for Installed {
            fn construct(
                &self,
                _name: &str,
                _args: Vec<PackedValue>,
            ) -> Result<Arc<dyn minrpc_wire::session::ServingSession>> {
                Ok(self.0.clone())
            }
        }
        Self::with_factory(transport, config, Role::Server, Arc::new(Installed(session)))
    }

    /// Build an endpoint that plays both client and server roles on the
    /// same connection (§1 simultaneous duties), constructing its
    /// serving session lazily from `factory` on first `InitServer`.
    #[must_use]
    pub fn with_factory(
        transport: T,
        config: EndpointConfig,
        role: Role,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        let mut handler = EventHandler::new(role, config.remote_key, factory);
        if matches!(role, Role::Client) {
            handler.queue_handshake_key();
        }
        let (free_tx, free_rx) = flume::unbounded();
        Self {
            transport,
            handler,
            max_packet_size: config.max_packet_size,
            free_tx,
            free_rx,
            poisoned: false,
            pre_start_hook: None,
            post_shutdown_hook: None,
        }
    }

    /// Register a hook `server_loop` runs once, before its first `drive`
    /// step. Embeddings use this to, e.g., announce readiness only once
    /// the event handler is actually pumping (§4.5).
    #[must_use]
    pub fn with_pre_start_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.pre_start_hook = Some(Box::new(hook));
        self
    }

    /// Register a hook `server_loop` runs once, after it observes
    /// `Event::Shutdown` and before returning (§4.5).
    #[must_use]
    pub fn with_post_shutdown_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.post_shutdown_hook = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub const fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn free_sender(&self) -> flume::Sender<(ObjectKind, u64)> {
        self.free_tx.clone()
    }

    /// Flush every handle queued for release by a dropped
    /// [`crate::client::RemoteObjectRef`] since the last call. Piggybacked
    /// onto every outbound operation; also callable directly.
    pub async fn flush_pending_frees(&mut self) -> Result<()> {
        while let Ok((kind, handle)) = self.free_rx.try_recv() {
            self.handler
                .queue_syscall(Opcode::FreeHandle, &[PackedValue::Handle(kind, handle)]);
            match self.drive().await? {
                Event::Return(_) => {}
                Event::Shutdown => return Err(RpcError::NotConnected),
                other => {
                    return Err(RpcError::protocol(format!(
                        "unexpected reply to FreeHandle: {other:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.poisoned {
            return Err(RpcError::NotConnected);
        }
        let n = self.handler.writer_mut().bytes_available();
        if n == 0 {
            return Ok(());
        }
        let chunk = self
            .handler
            .writer_mut()
            .take_bytes(n)
            .expect("checked bytes_available above");

        // Armed for the duration of the write; if this future is dropped
        // before `write_all` returns (e.g. the embedder's timeout fires),
        // the guard's drop leaves `poisoned` set and every later call on
        // this endpoint is refused rather than risking a half-written
        // frame on the wire.
        let guard = PoisonGuard::new(&mut self.poisoned);
        self.transport.write_all(&chunk).await.map_err(RpcError::Core)?;
        guard.disarm();
        Ok(())
    }

    async fn fill(&mut self) -> Result<bool> {
        let mut buf = vec![0u8; DEFAULT_READ_CHUNK];
        let n = self.transport.read(&mut buf).await.map_err(RpcError::Core)?;
        if n == 0 {
            return Ok(false);
        }
        self.handler.reader_mut().write(&buf[..n]);
        Ok(true)
    }

    /// Pump the state machine: flush any queued outbound bytes, advance
    /// as far as buffered input allows, flush whatever that produced,
    /// and read more only when the state machine is stuck waiting on the
    /// peer. Returns the first terminal event.
    async fn drive(&mut self) -> Result<Event> {
        loop {
            self.flush().await?;
            let ev = self.handler.advance().await?;
            self.flush().await?;
            if !matches!(ev, Event::None) {
                return Ok(ev);
            }
            trace!(needed = self.handler.bytes_needed(), "waiting on transport");
            let alive = self.fill().await?;
            if !alive {
                return if self.handler.can_clean_shutdown() {
                    Ok(Event::Shutdown)
                } else {
                    Err(RpcError::Io(std::io::Error::from(
                        std::io::ErrorKind::UnexpectedEof,
                    )))
                };
            }
        }
    }

    pub async fn init_remote_session(
        &mut self,
        ctor_name: &str,
        ctor_args: Vec<PackedValue>,
    ) -> Result<()> {
        let mut full = Vec::with_capacity(ctor_args.len() + 1);
        full.push(PackedValue::Str(ctor_name.to_string()));
        full.extend(ctor_args);
        self.handler.queue_init_server(&full);
        match self.drive().await? {
            Event::Return(_) => Ok(()),
            Event::Shutdown => Err(RpcError::NotConnected),
            other => Err(RpcError::protocol(format!(
                "unexpected reply to InitServer: {other:?}"
            ))),
        }
    }

    pub async fn call_func(&mut self, handle: u64, args: &[PackedValue]) -> Result<Vec<PackedValue>> {
        minrpc_wire::value::reject_unsendable_args(args)?;
        self.flush_pending_frees().await?;
        self.handler.queue_call_func(handle, args);
        match self.drive().await? {
            Event::Return(values) => Ok(values),
            Event::Shutdown => Err(RpcError::NotConnected),
            other => Err(RpcError::protocol(format!(
                "unexpected reply to CallFunc: {other:?}"
            ))),
        }
    }

    pub async fn syscall(&mut self, opcode: Opcode, args: &[PackedValue]) -> Result<PackedValue> {
        debug_assert!(opcode.is_syscall());
        minrpc_wire::value::reject_unsendable_args(args)?;
        self.flush_pending_frees().await?;
        self.handler.queue_syscall(opcode, args);
        match self.drive().await? {
            Event::Return(mut values) => values
                .pop()
                .ok_or_else(|| RpcError::protocol("syscall reply carried no return value")),
            Event::Shutdown => Err(RpcError::NotConnected),
            other => Err(RpcError::protocol(format!("unexpected reply: {other:?}"))),
        }
    }

    pub async fn copy_to_remote(&mut self, tensor: &TensorDescriptor, data: &[u8]) -> Result<()> {
        minrpc_wire::value::reject_unsendable_args(&[PackedValue::Tensor(tensor.clone())])?;
        self.flush_pending_frees().await?;
        self.handler.queue_copy_to_remote(tensor, data);
        match self.drive().await? {
            Event::Return(_) => Ok(()),
            Event::Shutdown => Err(RpcError::NotConnected),
            other => Err(RpcError::protocol(format!(
                "unexpected reply to CopyToRemote: {other:?}"
            ))),
        }
    }

    pub async fn copy_from_remote(&mut self, tensor: &TensorDescriptor, nbytes: u64) -> Result<Bytes> {
        minrpc_wire::value::reject_unsendable_args(&[PackedValue::Tensor(tensor.clone())])?;
        self.flush_pending_frees().await?;
        self.handler.queue_copy_from_remote(tensor, nbytes);
        match self.drive().await? {
            Event::CopyAck(data) => Ok(data),
            Event::Shutdown => Err(RpcError::NotConnected),
            other => Err(RpcError::protocol(format!(
                "unexpected reply to CopyFromRemote: {other:?}"
            ))),
        }
    }

    /// Serve requests from the peer until a `Shutdown` packet arrives,
    /// optionally invoking pre-start/post-shutdown hooks registered by the
    /// embedding via [`Self::with_pre_start_hook`] /
    /// [`Self::with_post_shutdown_hook`] (§4.5).
    pub async fn server_loop(&mut self) -> Result<()> {
        if let Some(hook) = self.pre_start_hook.take() {
            hook();
        }
        loop {
            match self.drive().await? {
                Event::Shutdown => {
                    if let Some(hook) = self.post_shutdown_hook.take() {
                        hook();
                    }
                    return Ok(());
                }
                _ => continue,
            }
        }
    }

    /// Non-blocking drive step for event-loop embeddings that own their
    /// transport's readiness notifications directly (§4.5) instead of
    /// letting [`Self::drive`] await it. The caller feeds in whatever
    /// bytes it already read off the wire via `in_bytes` (possibly empty,
    /// e.g. on a pure writability notification) and gets back a 0/1/2
    /// readiness code instead of blocking:
    ///
    /// - `0` — a `Shutdown` packet was processed; the connection is done.
    /// - `1` — R was drained and the state machine made no further
    ///   progress; the embedding should wait for more readable bytes.
    /// - `2` — W still holds bytes the embedding must write out before
    ///   calling back in.
    ///
    /// `event_flag` is accepted for embeddings that gate this call on an
    /// edge-triggered readiness mask; the drive step itself only consults
    /// the ring buffers, so the flag is otherwise unused here. This never
    /// touches `self.transport` — unlike [`Self::drive`], all I/O is the
    /// embedding's responsibility.
    pub async fn server_async_io_event_handler(&mut self, in_bytes: &[u8], event_flag: u8) -> Result<u8> {
        let _ = event_flag;
        if self.poisoned {
            return Err(RpcError::NotConnected);
        }
        if !in_bytes.is_empty() {
            self.handler.reader_mut().write(in_bytes);
        }
        let ev = self.handler.advance().await?;
        if matches!(ev, Event::Shutdown) {
            return Ok(0);
        }
        if self.handler.writer_mut().bytes_available() > 0 {
            return Ok(2);
        }
        Ok(1)
    }

    /// Send a `Shutdown` packet and flush it. Does not wait for the peer
    /// to close its side.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.handler.queue_shutdown();
        self.flush().await
    }

    /// A sender the caller can hand to [`crate::client::RemoteObjectRef`]
    /// so dropped handles get released on this endpoint's next call.
    #[must_use]
    pub fn free_queue(&self) -> flume::Sender<(ObjectKind, u64)> {
        self.free_sender()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_session::LocalSession;
    use minrpc_core::transport::DuplexPipe;
    use minrpc_wire::value::{DataType, Device};

    #[compio::test]
    async fn call_func_round_trip_over_duplex_pipe() {
        let (client_io, server_io) = DuplexPipe::pair();
        let mut client = Endpoint::client(client_io, EndpointConfig::default());

        let session = Arc::new(LocalSession::new());
        session.register_fn("double", |args| {
            let PackedValue::Int(n) = args[0] else {
                return Err(RpcError::invalid_argument("expected an int"));
            };
            Ok(vec![PackedValue::Int(n * 2)])
        });
        let mut server = Endpoint::server(server_io, EndpointConfig::default(), session);

        compio::runtime::spawn(async move {
            let _ = server.server_loop().await;
        })
        .detach();

        client.init_remote_session("minrpc.LocalSession", vec![]).await.unwrap();
        let handle_val = client
            .syscall(Opcode::GetGlobalFunc, &[PackedValue::Str("double".into())])
            .await
            .unwrap();
        let PackedValue::Handle(ObjectKind::Function, handle) = handle_val else {
            panic!("expected a function handle");
        };
        let result = client.call_func(handle, &[PackedValue::Int(21)]).await.unwrap();
        assert_eq!(result, vec![PackedValue::Int(42)]);
    }

    #[compio::test]
    async fn copy_to_and_from_remote_round_trip() {
        let (client_io, server_io) = DuplexPipe::pair();
        let mut client = Endpoint::client(client_io, EndpointConfig::default());
        let session = Arc::new(LocalSession::new());
        let mut server = Endpoint::server(server_io, EndpointConfig::default(), session);
        compio::runtime::spawn(async move {
            let _ = server.server_loop().await;
        })
        .detach();

        client.init_remote_session("minrpc.LocalSession", vec![]).await.unwrap();
        let handle = client
            .syscall(
                Opcode::DevAllocData,
                &[
                    PackedValue::Device(Device::cpu(0)),
                    PackedValue::Int(8),
                    PackedValue::Int(1),
                    PackedValue::DataType(DataType::u8_scalar()),
                ],
            )
            .await
            .unwrap();
        let PackedValue::Handle(ObjectKind::Buffer, data) = handle else {
            panic!("expected a buffer handle");
        };
        let tensor = TensorDescriptor {
            device: Device::cpu(0),
            data,
            shape: smallvec::SmallVec::from_slice(&[8]),
            dtype: DataType::u8_scalar(),
            byte_offset: 0,
        };
        client.copy_to_remote(&tensor, b"deadbeef").await.unwrap();
        let back = client.copy_from_remote(&tensor, 8).await.unwrap();
        assert_eq!(&back[..], b"deadbeef");
    }

    #[compio::test]
    async fn poisoned_endpoint_refuses_further_calls() {
        let (client_io, _server_io) = DuplexPipe::pair();
        let mut client = Endpoint::client(client_io, EndpointConfig::default());
        client.poisoned = true;

        let err = client.call_func(1, &[]).await.unwrap_err();
        assert!(matches!(err, RpcError::NotConnected));
    }

    #[compio::test]
    async fn call_func_rejects_rpc_session_backed_device() {
        let (client_io, _server_io) = DuplexPipe::pair();
        let mut client = Endpoint::client(client_io, EndpointConfig::default());

        let bad_device = Device {
            device_kind: Device::RPC_SESSION_KIND,
            device_id: 0,
        };
        let err = client
            .call_func(1, &[PackedValue::Device(bad_device)])
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidArgument(_)));
    }

    #[compio::test]
    async fn server_loop_runs_pre_start_and_post_shutdown_hooks_in_order() {
        let (client_io, server_io) = DuplexPipe::pair();
        let mut client = Endpoint::client(client_io, EndpointConfig::default());
        let session = Arc::new(LocalSession::new());
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let pre_log = log.clone();
        let post_log = log.clone();

        let mut server = Endpoint::server(server_io, EndpointConfig::default(), session)
            .with_pre_start_hook(move || pre_log.lock().push("pre"))
            .with_post_shutdown_hook(move || post_log.lock().push("post"));

        let handle = compio::runtime::spawn(async move {
            server.server_loop().await.unwrap();
        });

        client.init_remote_session("minrpc.LocalSession", vec![]).await.unwrap();
        client.shutdown().await.unwrap();
        handle.await.unwrap();

        assert_eq!(&log.lock()[..], ["pre", "post"]);
    }

    #[compio::test]
    async fn async_io_event_handler_reports_want_read_then_shutdown() {
        // The server endpoint's own transport is never touched by
        // `server_async_io_event_handler`; give it an unused pipe end.
        let (_unused, parked) = DuplexPipe::pair();
        let session = Arc::new(LocalSession::new());
        let mut server = Endpoint::server(parked, EndpointConfig::default(), session);

        // Nothing buffered yet: the server must ask for more input.
        let code = server.server_async_io_event_handler(&[], 0).await.unwrap();
        assert_eq!(code, 1);

        // Drive a real client over its own pipe so its handshake key and
        // shutdown packet land in `wire_io` exactly as bytes on a wire,
        // then feed them into the server by hand, the way a non-blocking
        // embedding would with bytes it already read off its socket.
        let (client_io, mut wire_io) = DuplexPipe::pair();
        let mut client = Endpoint::client(client_io, EndpointConfig::default());
        client.shutdown().await.unwrap();

        let mut buf = vec![0u8; 4096];
        let n = wire_io.read(&mut buf).await.unwrap();
        let code = server.server_async_io_event_handler(&buf[..n], 0).await.unwrap();
        assert_eq!(code, 0);
    }
}
