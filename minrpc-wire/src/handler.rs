//! The event handler: the protocol state machine (§4.4), the largest and
//! most central piece of this crate. It owns the two ring buffers, the
//! per-packet arena, and the reference to the installed [`ServingSession`],
//! and is driven by repeated calls to [`EventHandler::advance`] — each
//! call pumps bytes against a transport and the state machine forward
//! until a terminal [`Event`] or the transport has no more to give right
//! now.
//!
//! # Async completions, translated
//!
//! The source design suspends the state machine in a dedicated
//! `WaitForAsyncCallback` state and resumes it from a completion callback
//! (§9, "Async completions without callbacks-as-control-flow"). In async
//! Rust the natural translation is to `.await` the serving session's
//! operation directly — the suspension *is* the await point, and nothing
//! else can run on this handler while it is pending because `advance`
//! holds `&mut self` for its entire body. The `WaitForAsyncCallback`
//! state is kept anyway (entered just before the await, exited just
//! after) purely so [`EventHandler::can_clean_shutdown`] and
//! `bytes_needed` observe the same state table the spec describes, and so
//! tests can assert on it.
//!
//! The spec's `set_return` callback is similarly collapsed: rather than
//! invoking a callback once, [`Event::Return`] carries the decoded packed
//! sequence directly back to whichever `advance` call triggered it.

use crate::error::{Result, RpcError};
use crate::proto::{Opcode, PROTOCOL_VERSION, SYSCALL_CODE_START};
use crate::session::{ServingSession, SessionFactory};
use crate::value::{self, DataType, Device, ObjectKind, PackedValue, TensorDescriptor};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use minrpc_core::arena::Arena;
use minrpc_core::ring::RingBuffer;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Which side of the handshake this handler plays. Only affects whether
/// it expects to read an incoming key header before ordinary packet
/// dispatch begins; see the module docs on the handshake simplification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    InitHeaderLen,
    InitHeaderBody(u32),
    RecvPacketNumBytes,
    ProcessPacket(u64),
    WaitForAsyncCallback,
    ShutdownReceived,
}

/// A terminal outcome of [`EventHandler::advance`].
#[derive(Debug)]
pub enum Event {
    /// No terminal event yet; the transport has no more bytes right now.
    None,
    /// A `Return` packet arrived for an outstanding client call.
    Return(Vec<PackedValue>),
    /// A `CopyAck` packet arrived; this is its raw payload.
    CopyAck(Bytes),
    /// A `Shutdown` packet arrived, or this side already shut down.
    Shutdown,
}

pub struct EventHandler {
    reader: RingBuffer,
    writer: RingBuffer,
    arena: Arena,
    state: State,
    session: Option<Arc<dyn ServingSession>>,
    factory: Arc<dyn SessionFactory>,
    remote_key: String,
}

impl EventHandler {
    #[must_use]
    pub fn new(role: Role, remote_key: String, factory: Arc<dyn SessionFactory>) -> Self {
        let state = match role {
            Role::Server => State::InitHeaderLen,
            Role::Client => State::RecvPacketNumBytes,
        };
        let mut reader = RingBuffer::new();
        let mut writer = RingBuffer::new();
        reader.reserve(crate::config::DEFAULT_RING_CAPACITY);
        writer.reserve(crate::config::DEFAULT_RING_CAPACITY);
        Self {
            reader,
            writer,
            arena: Arena::new(),
            state,
            session: None,
            factory,
            remote_key,
        }
    }

    /// Install a session directly, bypassing `InitServer` / the factory.
    /// Used by in-process tests and multi-hop setups that already have a
    /// concrete session to hand the handler.
    pub fn install_session(&mut self, session: Arc<dyn ServingSession>) {
        self.session = Some(session);
    }

    #[must_use]
    pub fn reader_mut(&mut self) -> &mut RingBuffer {
        &mut self.reader
    }

    #[must_use]
    pub fn writer_mut(&mut self) -> &mut RingBuffer {
        &mut self.writer
    }

    /// How many more bytes the channel must deliver before `advance` can
    /// make further progress purely from buffered input.
    #[must_use]
    pub fn bytes_needed(&self) -> usize {
        let need = match &self.state {
            State::InitHeaderLen => 4,
            State::InitHeaderBody(n) => *n as usize,
            State::RecvPacketNumBytes => 8,
            State::ProcessPacket(n) => *n as usize,
            State::WaitForAsyncCallback | State::ShutdownReceived => 0,
        };
        need.saturating_sub(self.reader.bytes_available())
    }

    /// True only in `RecvPacketNumBytes` — the sole state from which a
    /// shutdown leaves no half-consumed packet behind.
    #[must_use]
    pub fn can_clean_shutdown(&self) -> bool {
        matches!(self.state, State::RecvPacketNumBytes)
    }

    /// Queue a client request packet for the next flush: `CallFunc`.
    pub fn queue_call_func(&mut self, handle: u64, args: &[PackedValue]) {
        let mut body = BytesMut::new();
        body.put_u64_le(handle);
        value::encode(args, &mut body);
        self.queue_packet(Opcode::CallFunc, &body);
    }

    pub fn queue_init_server(&mut self, ctor_args: &[PackedValue]) {
        let mut body = BytesMut::new();
        body.put_u64_le(PROTOCOL_VERSION.len() as u64);
        body.extend_from_slice(PROTOCOL_VERSION.as_bytes());
        value::encode(ctor_args, &mut body);
        self.queue_packet(Opcode::InitServer, &body);
    }

    pub fn queue_syscall(&mut self, opcode: Opcode, args: &[PackedValue]) {
        debug_assert!(opcode.is_syscall());
        let mut body = BytesMut::new();
        value::encode(args, &mut body);
        self.queue_packet(opcode, &body);
    }

    pub fn queue_copy_to_remote(&mut self, tensor: &TensorDescriptor, data: &[u8]) {
        let mut body = BytesMut::new();
        encode_tensor(tensor, &mut body);
        body.put_u64_le(data.len() as u64);
        body.extend_from_slice(data);
        self.queue_packet(Opcode::CopyToRemote, &body);
    }

    pub fn queue_copy_from_remote(&mut self, tensor: &TensorDescriptor, nbytes: u64) {
        let mut body = BytesMut::new();
        encode_tensor(tensor, &mut body);
        body.put_u64_le(nbytes);
        self.queue_packet(Opcode::CopyFromRemote, &body);
    }

    pub fn queue_shutdown(&mut self) {
        self.queue_packet(Opcode::Shutdown, &[]);
    }

    /// Queue the client's handshake key header. Call once, before the
    /// first `advance`, on a freshly constructed client handler.
    pub fn queue_handshake_key(&mut self) {
        let key = self.remote_key.clone();
        let mut hdr = BytesMut::new();
        hdr.put_i32_le(key.len() as i32);
        hdr.extend_from_slice(key.as_bytes());
        self.writer.write(&hdr);
    }

    fn queue_packet(&mut self, opcode: Opcode, body: &[u8]) {
        let mut framed = BytesMut::with_capacity(12 + body.len());
        framed.put_u64_le(4 + body.len() as u64);
        framed.put_u32_le(opcode.as_u32());
        framed.extend_from_slice(body);
        self.writer.push(framed.freeze());
    }

    /// Advance the state machine as far as currently-buffered input
    /// allows, without performing any transport I/O itself. Returns
    /// `Event::None` when it needs more bytes than `reader` currently
    /// holds; the caller (the endpoint facade's drive loop) is
    /// responsible for flushing `writer` and refilling `reader` between
    /// calls.
    pub async fn advance(&mut self) -> Result<Event> {
        loop {
            match self.state.clone() {
                State::InitHeaderLen => {
                    if self.reader.bytes_available() < 4 {
                        return Ok(Event::None);
                    }
                    let mut buf = [0u8; 4];
                    self.reader.read(&mut buf, 4);
                    let len = i32::from_le_bytes(buf);
                    if len < 0 {
                        return Err(RpcError::protocol(format!(
                            "negative handshake key length {len}"
                        )));
                    }
                    self.state = State::InitHeaderBody(len as u32);
                }
                State::InitHeaderBody(len) => {
                    let len = len as usize;
                    if self.reader.bytes_available() < len {
                        return Ok(Event::None);
                    }
                    let mut buf = vec![0u8; len];
                    self.reader.read(&mut buf, len);
                    debug!(key = %String::from_utf8_lossy(&buf), "handshake key received");
                    self.enter_idle();
                }
                State::RecvPacketNumBytes => {
                    if self.reader.bytes_available() < 8 {
                        return Ok(Event::None);
                    }
                    let mut buf = [0u8; 8];
                    self.reader.read(&mut buf, 8);
                    let len = u64::from_le_bytes(buf);
                    trace!(len, "packet length received");
                    self.state = State::ProcessPacket(len);
                }
                State::ProcessPacket(len) => {
                    let len = len as usize;
                    if self.reader.bytes_available() < len {
                        return Ok(Event::None);
                    }
                    if len < 4 {
                        return Err(RpcError::protocol(format!(
                            "packet body too short for an opcode: {len} bytes"
                        )));
                    }
                    let body = self
                        .reader
                        .take_bytes(len)
                        .expect("length already checked above");
                    let mut cur = &body[..];
                    let raw_opcode = cur.get_u32_le();
                    let opcode = Opcode::from_u32(raw_opcode).ok_or_else(|| {
                        RpcError::protocol(format!("unknown opcode {raw_opcode}"))
                    })?;
                    let rest = Bytes::copy_from_slice(cur);
                    if let Some(event) = self.dispatch(opcode, rest).await? {
                        return Ok(event);
                    }
                }
                State::WaitForAsyncCallback => {
                    // Only reachable if a previous `dispatch` call returned
                    // without resolving its await (it never does in this
                    // implementation — see module docs); guard against a
                    // stuck state rather than spin.
                    return Ok(Event::None);
                }
                State::ShutdownReceived => return Ok(Event::Shutdown),
            }
        }
    }

    fn enter_idle(&mut self) {
        self.arena.recycle_all();
        self.state = State::RecvPacketNumBytes;
    }

    async fn dispatch(&mut self, opcode: Opcode, body: Bytes) -> Result<Option<Event>> {
        match opcode {
            Opcode::InitServer => {
                self.handle_init_server(&body)?;
                self.enter_idle();
                Ok(None)
            }
            Opcode::CallFunc => {
                self.state = State::WaitForAsyncCallback;
                self.handle_call_func(&body).await?;
                self.enter_idle();
                Ok(None)
            }
            Opcode::CopyFromRemote => {
                self.state = State::WaitForAsyncCallback;
                self.handle_copy_from_remote(&body).await?;
                self.enter_idle();
                Ok(None)
            }
            Opcode::CopyToRemote => {
                self.state = State::WaitForAsyncCallback;
                self.handle_copy_to_remote(&body).await?;
                self.enter_idle();
                Ok(None)
            }
            Opcode::Return => {
                let args = value::decode(&body)?;
                self.enter_idle();
                Ok(Some(Event::Return(args)))
            }
            Opcode::Exception => {
                let args = value::decode(&body)?;
                self.enter_idle();
                Err(exception_args_to_error(args))
            }
            Opcode::CopyAck => {
                self.enter_idle();
                Ok(Some(Event::CopyAck(body)))
            }
            Opcode::Shutdown => {
                self.state = State::ShutdownReceived;
                Ok(Some(Event::Shutdown))
            }
            Opcode::None => Err(RpcError::protocol("received control opcode None")),
            _ if opcode.is_syscall() => {
                self.state = State::WaitForAsyncCallback;
                self.handle_syscall(opcode, &body).await?;
                self.enter_idle();
                Ok(None)
            }
            _ => unreachable!("all opcodes are either control or >= SYSCALL_CODE_START"),
        }
    }

    /// Resolve the installed session, or a plain message suitable for an
    /// `Exception` reply (calling before `InitServer` is caller error, not
    /// a connection-level protocol violation — §4.4 rule 2 still applies).
    fn require_session(&self) -> std::result::Result<Arc<dyn ServingSession>, String> {
        self.session
            .clone()
            .ok_or_else(|| RpcError::NoSession.to_string())
    }

    fn handle_init_server(&mut self, body: &Bytes) -> Result<()> {
        let mut cur = &body[..];
        let ver_len = crate::value::get_u64(&mut cur)? as usize;
        if cur.remaining() < ver_len {
            return Err(RpcError::protocol("truncated InitServer protocol version"));
        }
        let ver_bytes = &cur[..ver_len];
        let peer_version = String::from_utf8_lossy(ver_bytes).into_owned();
        cur.advance(ver_len);

        if peer_version != PROTOCOL_VERSION {
            warn!(peer = %peer_version, expected = PROTOCOL_VERSION, "protocol version mismatch");
            let msg = format!(
                "protocol version mismatch: peer={peer_version:?} expected={PROTOCOL_VERSION:?}"
            );
            self.queue_packet(
                Opcode::Exception,
                &encode_exception(&msg),
            );
            return Ok(());
        }

        let args = value::decode(cur)?;
        let Some(PackedValue::Str(ctor_name)) = args.first() else {
            return Err(RpcError::protocol(
                "InitServer packed_args[0] must be the constructor name",
            ));
        };
        let ctor_name = ctor_name.clone();
        let ctor_args = args[1..].to_vec();

        match self.factory.construct(&ctor_name, ctor_args) {
            Ok(session) => {
                debug!(ctor = %ctor_name, "serving session installed");
                self.session = Some(session);
                self.queue_packet(Opcode::Return, &encode_args(&[]));
            }
            Err(e) => {
                warn!(ctor = %ctor_name, error = %e, "serving session construction failed");
                self.queue_packet(Opcode::Exception, &encode_exception(&e.to_string()));
            }
        }
        Ok(())
    }

    async fn handle_call_func(&mut self, body: &Bytes) -> Result<()> {
        let mut cur = &body[..];
        let handle = crate::value::get_u64(&mut cur)?;
        let args = value::decode(cur)?;

        let session = match self.require_session() {
            Ok(s) => s,
            Err(msg) => {
                self.queue_packet(Opcode::Exception, &encode_exception(&msg));
                return Ok(());
            }
        };
        match session.call(handle, args).await {
            Ok(result) => self.queue_packet(Opcode::Return, &encode_args(&result)),
            Err(e) => self.queue_packet(Opcode::Exception, &encode_exception(&e.to_string())),
        }
        Ok(())
    }

    async fn handle_copy_from_remote(&mut self, body: &Bytes) -> Result<()> {
        let mut cur = &body[..];
        let tensor = decode_tensor(&mut cur)?;
        let nbytes = crate::value::get_u64(&mut cur)?;

        let session = match self.require_session() {
            Ok(s) => s,
            Err(msg) => {
                self.queue_packet(Opcode::Exception, &encode_exception(&msg));
                return Ok(());
            }
        };
        trace!(
            host_resident = session.is_host_resident(&tensor),
            nbytes, "copy_from_device"
        );
        match session.copy_from_device(&tensor, nbytes).await {
            Ok(mut data) => {
                if !host_is_little_endian() && tensor.dtype.is_byte_aligned() {
                    let mut owned = data.to_vec();
                    swap_elements(&mut owned, tensor.dtype.element_bytes());
                    data = Bytes::from(owned);
                }
                let mut framed = BytesMut::with_capacity(12 + data.len());
                framed.put_u64_le(4 + data.len() as u64);
                framed.put_u32_le(Opcode::CopyAck.as_u32());
                framed.extend_from_slice(&data);
                self.writer.push(framed.freeze());
            }
            Err(e) => self.queue_packet(Opcode::Exception, &encode_exception(&e.to_string())),
        }
        Ok(())
    }

    async fn handle_copy_to_remote(&mut self, body: &Bytes) -> Result<()> {
        let mut cur = &body[..];
        let tensor = decode_tensor(&mut cur)?;
        let nbytes = crate::value::get_u64(&mut cur)?;
        if cur.remaining() < nbytes as usize {
            return Err(RpcError::protocol("truncated CopyToRemote payload"));
        }
        // Stage the payload in the per-packet arena rather than an ad-hoc
        // Vec: this is the bulk copy staging buffer the arena exists for.
        // It's copied out into an owned Bytes below because copy_to_device
        // may hold onto it past enter_idle()'s recycle_all().
        let mut staged = self.arena.alloc_copy(&cur[..nbytes as usize]);
        if !host_is_little_endian() && tensor.dtype.is_byte_aligned() {
            swap_elements(&mut staged, tensor.dtype.element_bytes());
        }
        let data = Bytes::copy_from_slice(&staged);

        let session = match self.require_session() {
            Ok(s) => s,
            Err(msg) => {
                self.queue_packet(Opcode::Exception, &encode_exception(&msg));
                return Ok(());
            }
        };
        trace!(
            host_resident = session.is_host_resident(&tensor),
            nbytes, "copy_to_device"
        );
        match session.copy_to_device(&tensor, nbytes, data).await {
            Ok(()) => self.queue_packet(Opcode::Return, &encode_args(&[])),
            Err(e) => self.queue_packet(Opcode::Exception, &encode_exception(&e.to_string())),
        }
        Ok(())
    }

    async fn handle_syscall(&mut self, opcode: Opcode, body: &Bytes) -> Result<()> {
        let args = value::decode(body)?;
        let session = match self.require_session() {
            Ok(s) => s,
            Err(msg) => {
                self.queue_packet(Opcode::Exception, &encode_exception(&msg));
                return Ok(());
            }
        };
        let result = self.run_syscall(&session, opcode, args).await;
        match result {
            Ok(value) => self.queue_packet(Opcode::Return, &encode_args(&[value])),
            Err(e) => self.queue_packet(Opcode::Exception, &encode_exception(&e.to_string())),
        }
        Ok(())
    }

    async fn run_syscall(
        &self,
        session: &Arc<dyn ServingSession>,
        opcode: Opcode,
        mut args: Vec<PackedValue>,
    ) -> Result<PackedValue> {
        match opcode {
            Opcode::GetGlobalFunc => {
                let name = expect_str(&mut args, 0)?;
                let handle = session.get_global_func(&name).await?;
                Ok(PackedValue::Handle(ObjectKind::Function, handle))
            }
            Opcode::FreeHandle => {
                let (kind, handle) = expect_handle(&mut args, 0)?;
                session.free_handle(kind, handle).await?;
                Ok(PackedValue::Null)
            }
            Opcode::DevSetDevice => {
                let dev = expect_device(&mut args, 0)?;
                session.dev_set_device(dev).await?;
                Ok(PackedValue::Null)
            }
            Opcode::DevGetAttr => {
                let dev = expect_device(&mut args, 0)?;
                let attr_kind = expect_int(&mut args, 1)? as i32;
                let v = session.dev_get_attr(dev, attr_kind).await?;
                Ok(PackedValue::Int(v))
            }
            Opcode::DevAllocData => {
                let dev = expect_device(&mut args, 0)?;
                let nbytes = expect_int(&mut args, 1)? as u64;
                let alignment = expect_int(&mut args, 2)? as u64;
                let dtype_hint = expect_dtype(&mut args, 3)?;
                let handle = session
                    .dev_alloc_data(dev, nbytes, alignment, dtype_hint)
                    .await?;
                Ok(PackedValue::Handle(ObjectKind::Buffer, handle))
            }
            Opcode::DevAllocDataWithScope => {
                let tensor = expect_tensor(&mut args, 0)?;
                let scope = match args.get(1) {
                    Some(PackedValue::Str(s)) => Some(s.as_str()),
                    _ => None,
                };
                let handle = session.dev_alloc_data_with_scope(&tensor, scope).await?;
                Ok(PackedValue::Handle(ObjectKind::Buffer, handle))
            }
            Opcode::DevFreeData => {
                let dev = expect_device(&mut args, 0)?;
                let (_, ptr) = expect_handle(&mut args, 1)?;
                session.dev_free_data(dev, ptr).await?;
                Ok(PackedValue::Null)
            }
            Opcode::CopyAmongRemote => {
                let from = expect_tensor(&mut args, 0)?;
                let to = expect_tensor(&mut args, 1)?;
                let stream = match args.get(2) {
                    Some(PackedValue::Handle(_, h)) => Some(*h),
                    _ => None,
                };
                session.copy_among_remote(&from, &to, stream).await?;
                Ok(PackedValue::Null)
            }
            Opcode::DevCreateStream => {
                let dev = expect_device(&mut args, 0)?;
                let handle = session.dev_create_stream(dev).await?;
                Ok(PackedValue::Handle(ObjectKind::Stream, handle))
            }
            Opcode::DevFreeStream => {
                let dev = expect_device(&mut args, 0)?;
                let (_, stream) = expect_handle(&mut args, 1)?;
                session.dev_free_stream(dev, stream).await?;
                Ok(PackedValue::Null)
            }
            Opcode::DevStreamSync => {
                let dev = expect_device(&mut args, 0)?;
                let (_, stream) = expect_handle(&mut args, 1)?;
                session.dev_stream_sync(dev, stream).await?;
                Ok(PackedValue::Null)
            }
            Opcode::DevSetStream => {
                let dev = expect_device(&mut args, 0)?;
                let (_, stream) = expect_handle(&mut args, 1)?;
                session.dev_set_stream(dev, stream).await?;
                Ok(PackedValue::Null)
            }
            Opcode::DevGetCurrentStream => {
                let dev = expect_device(&mut args, 0)?;
                let handle = session.dev_get_current_stream(dev).await?;
                Ok(PackedValue::Handle(ObjectKind::Stream, handle))
            }
            _ => unreachable!("dispatch only routes syscall opcodes here"),
        }
    }
}

fn exception_args_to_error(args: Vec<PackedValue>) -> RpcError {
    let message = match args.first() {
        Some(PackedValue::Str(s)) => s.clone(),
        _ => "remote exception with no message".to_string(),
    };
    RpcError::from_remote_message(message)
}

fn encode_exception(message: &str) -> BytesMut {
    encode_args(&[PackedValue::Str(message.to_string())])
}

fn encode_args(values: &[PackedValue]) -> BytesMut {
    let mut out = BytesMut::new();
    value::encode(values, &mut out);
    out
}

fn encode_tensor(t: &TensorDescriptor, out: &mut BytesMut) {
    let mut tmp = BytesMut::new();
    value::encode(&[PackedValue::Tensor(t.clone())], &mut tmp);
    // Strip the packed-seq header (num_args + one type-code word) since
    // CopyTo/CopyFromRemote bodies carry the tensor descriptor bare.
    out.extend_from_slice(&tmp[8..]);
}

fn decode_tensor(cur: &mut &[u8]) -> Result<TensorDescriptor> {
    use crate::value::{get_i32, get_i64, get_u16, get_u32, get_u64, get_u8};

    let device_kind = get_i32(cur)?;
    let device_id = get_i32(cur)?;
    let data = get_u64(cur)?;
    let ndim = i64::from(get_u32(cur)?);
    if !(0..=64).contains(&ndim) {
        return Err(RpcError::protocol(format!("invalid tensor ndim {ndim}")));
    }
    let mut shape = smallvec::SmallVec::with_capacity(ndim as usize);
    for _ in 0..ndim {
        shape.push(get_i64(cur)?);
    }
    let code = get_u8(cur)?;
    let bits = get_u8(cur)?;
    let lanes = get_u16(cur)?;
    let byte_offset = get_u64(cur)?;
    Ok(TensorDescriptor {
        device: Device {
            device_kind,
            device_id,
        },
        data,
        shape,
        dtype: DataType { code, bits, lanes },
        byte_offset,
    })
}

const fn host_is_little_endian() -> bool {
    cfg!(target_endian = "little")
}

/// Byte-swap each `elem_width`-sized element in place. Used only for
/// tensor *payload* words, never for scalar control fields (§6, §9).
fn swap_elements(data: &mut [u8], elem_width: usize) {
    if elem_width <= 1 {
        return;
    }
    for chunk in data.chunks_exact_mut(elem_width) {
        chunk.reverse();
    }
}

fn expect_str(args: &mut Vec<PackedValue>, idx: usize) -> Result<String> {
    match args.get_mut(idx) {
        Some(PackedValue::Str(s)) => Ok(std::mem::take(s)),
        _ => Err(RpcError::protocol(format!("expected string argument at index {idx}"))),
    }
}

fn expect_int(args: &mut Vec<PackedValue>, idx: usize) -> Result<i64> {
    match args.get(idx) {
        Some(PackedValue::Int(i)) => Ok(*i),
        _ => Err(RpcError::protocol(format!("expected int argument at index {idx}"))),
    }
}

fn expect_device(args: &mut Vec<PackedValue>, idx: usize) -> Result<Device> {
    match args.get(idx) {
        Some(PackedValue::Device(d)) => Ok(*d),
        _ => Err(RpcError::protocol(format!("expected device argument at index {idx}"))),
    }
}

fn expect_dtype(args: &mut Vec<PackedValue>, idx: usize) -> Result<DataType> {
    match args.get(idx) {
        Some(PackedValue::DataType(d)) => Ok(*d),
        _ => Err(RpcError::protocol(format!("expected dtype argument at index {idx}"))),
    }
}

fn expect_tensor(args: &mut Vec<PackedValue>, idx: usize) -> Result<TensorDescriptor> {
    match args.get(idx) {
        Some(PackedValue::Tensor(t)) => Ok(t.clone()),
        _ => Err(RpcError::protocol(format!(
            "expected tensor descriptor argument at index {idx}"
        ))),
    }
}

fn expect_handle(args: &mut Vec<PackedValue>, idx: usize) -> Result<(ObjectKind, u64)> {
    match args.get(idx) {
        Some(PackedValue::Handle(kind, h)) => Ok((*kind, *h)),
        _ => Err(RpcError::protocol(format!("expected handle argument at index {idx}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ServingSession, DEV_ATTR_EXISTS};
    use async_trait::async_trait;

    struct EchoSession;

    #[async_trait]
    impl ServingSession for EchoSession {
        async fn call(&self, _handle: u64, args: Vec<PackedValue>) -> Result<Vec<PackedValue>> {
            Ok(args)
        }
        async fn get_global_func(&self, _name: &str) -> Result<u64> {
            Ok(1)
        }
        async fn free_handle(&self, _kind: ObjectKind, _handle: u64) -> Result<()> {
            Ok(())
        }
        async fn dev_set_device(&self, _dev: Device) -> Result<()> {
            Ok(())
        }
        async fn dev_get_attr(&self, _dev: Device, attr_kind: i32) -> Result<i64> {
            Ok(i64::from(attr_kind == DEV_ATTR_EXISTS))
        }
        async fn dev_alloc_data(
            &self,
            _dev: Device,
            _nbytes: u64,
            _alignment: u64,
            _dtype_hint: DataType,
        ) -> Result<u64> {
            Ok(42)
        }
        async fn dev_alloc_data_with_scope(
            &self,
            _tensor: &TensorDescriptor,
            _scope: Option<&str>,
        ) -> Result<u64> {
            Ok(42)
        }
        async fn dev_free_data(&self, _dev: Device, _ptr: u64) -> Result<()> {
            Ok(())
        }
        async fn copy_among_remote(
            &self,
            _from: &TensorDescriptor,
            _to: &TensorDescriptor,
            _stream: Option<u64>,
        ) -> Result<()> {
            Ok(())
        }
        async fn dev_create_stream(&self, _dev: Device) -> Result<u64> {
            Ok(1)
        }
        async fn dev_free_stream(&self, _dev: Device, _stream: u64) -> Result<()> {
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
        async fn copy_from_device(&self, _tensor: &TensorDescriptor, nbytes: u64) -> Result<Bytes> {
            Ok(Bytes::from(vec![7u8; nbytes as usize]))
        }
        async fn copy_to_device(
            &self,
            _tensor: &TensorDescriptor,
            _nbytes: u64,
            _data: Bytes,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn factory() -> Arc<dyn SessionFactory> {
        Arc::new(|_name: &str, _args: Vec<PackedValue>| {
            Ok(Arc::new(EchoSession) as Arc<dyn ServingSession>)
        })
    }

    #[test]
    fn bytes_needed_tracks_idle_and_body_states() {
        let h = EventHandler::new(Role::Client, String::new(), factory());
        assert_eq!(h.bytes_needed(), 8);
        assert!(h.can_clean_shutdown());
    }

    #[compio::test]
    async fn call_func_round_trips_through_echo_session() {
        let mut h = EventHandler::new(Role::Client, String::new(), factory());
        h.install_session(Arc::new(EchoSession));

        h.queue_call_func(7, &[PackedValue::Int(42)]);
        // Feed the handler its own queued bytes, simulating a loopback:
        // move writer -> reader directly instead of going through a
        // transport, since this test only exercises dispatch logic.
        let queued = h.writer.take_bytes(h.writer.bytes_available()).unwrap();
        h.reader.push(queued);

        // First advance: consumes the CallFunc packet, awaits the echo
        // session, and queues a Return packet -- but a real client would
        // be reading from its *peer*, not its own writer, so here we just
        // assert the reply was queued correctly.
        let ev = h.advance().await.unwrap();
        assert!(matches!(ev, Event::None));
        assert!(h.writer.bytes_available() > 0);

        let reply = h.writer.take_bytes(h.writer.bytes_available()).unwrap();
        // length(8) + opcode(4) + packed seq
        let len = u64::from_le_bytes(reply[0..8].try_into().unwrap());
        assert_eq!(len as usize, reply.len() - 8);
        let opcode = u32::from_le_bytes(reply[8..12].try_into().unwrap());
        assert_eq!(opcode, Opcode::Return.as_u32());
        let args = value::decode(&reply[12..]).unwrap();
        assert_eq!(args, vec![PackedValue::Int(42)]);
    }

    #[compio::test]
    async fn shutdown_packet_is_a_terminal_event() {
        let mut h = EventHandler::new(Role::Client, String::new(), factory());
        h.queue_shutdown();
        let queued = h.writer.take_bytes(h.writer.bytes_available()).unwrap();
        h.reader.push(queued);
        let ev = h.advance().await.unwrap();
        assert!(matches!(ev, Event::Shutdown));
        assert!(!h.can_clean_shutdown());
    }

    #[compio::test]
    async fn exception_packet_surfaces_as_remote_exception_error() {
        let mut h = EventHandler::new(Role::Client, String::new(), factory());
        let mut body = BytesMut::new();
        value::encode(&[PackedValue::Str("boom".to_string())], &mut body);
        let mut framed = BytesMut::new();
        framed.put_u64_le(4 + body.len() as u64);
        framed.put_u32_le(Opcode::Exception.as_u32());
        framed.extend_from_slice(&body);
        h.reader.push(framed.freeze());

        let err = h.advance().await.unwrap_err();
        match err {
            RpcError::RemoteException { message, is_timeout } => {
                assert_eq!(message, "boom");
                assert!(!is_timeout);
            }
            other => panic!("expected RemoteException, got {other:?}"),
        }
        assert!(h.can_clean_shutdown());
    }

    #[compio::test]
    async fn timeout_exception_is_classified() {
        let mut h = EventHandler::new(Role::Client, String::new(), factory());
        let msg = format!("{}deadline exceeded", crate::error::TIMEOUT_ERROR_PREFIX);
        let mut body = BytesMut::new();
        value::encode(&[PackedValue::Str(msg.clone())], &mut body);
        let mut framed = BytesMut::new();
        framed.put_u64_le(4 + body.len() as u64);
        framed.put_u32_le(Opcode::Exception.as_u32());
        framed.extend_from_slice(&body);
        h.reader.push(framed.freeze());

        let err = h.advance().await.unwrap_err();
        match err {
            RpcError::RemoteException { message, is_timeout } => {
                assert_eq!(message, msg);
                assert!(is_timeout);
            }
            other => panic!("expected RemoteException, got {other:?}"),
        }
    }

    #[compio::test]
    async fn unknown_opcode_is_fatal_protocol_error() {
        let mut h = EventHandler::new(Role::Client, String::new(), factory());
        let mut framed = BytesMut::new();
        framed.put_u64_le(4);
        framed.put_u32_le(9999);
        h.reader.push(framed.freeze());
        let err = h.advance().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
