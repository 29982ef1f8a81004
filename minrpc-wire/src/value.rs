//! Packed argument codec (§4.3).
//!
//! A packed sequence is the length-prefixed heterogeneous tuple used for
//! both call arguments and return values: `u32 num_args`, then `num_args`
//! `u32` type-code words, then the values themselves in order. All control
//! fields are little-endian; see [`crate::proto`] for opcode framing and
//! [`RpcError`] for what a malformed sequence turns into.
//!
//! The type-code assignments below are this implementation's concrete,
//! documented choice (the spec leaves them open) — see [`TypeCode`].

use crate::error::{Result, RpcError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

/// Concrete type-code assignment for packed values. Two peers must agree
/// on these numbers to interoperate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TypeCode {
    Null = 0,
    Int = 1,
    Float32 = 2,
    Float64 = 3,
    Str = 4,
    Bytes = 5,
    DataType = 6,
    Device = 7,
    Tensor = 8,
    Handle = 9,
}

impl TypeCode {
    const fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Null,
            1 => Self::Int,
            2 => Self::Float32,
            3 => Self::Float64,
            4 => Self::Str,
            5 => Self::Bytes,
            6 => Self::DataType,
            7 => Self::Device,
            8 => Self::Tensor,
            9 => Self::Handle,
            _ => return None,
        })
    }
}

/// The kind of resource a [`PackedValue::Handle`] names. Meaningful only
/// to the handle's owner; the counterpart stores and forwards it opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ObjectKind {
    Function = 0,
    Buffer = 1,
    Stream = 2,
}

impl ObjectKind {
    const fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Function,
            1 => Self::Buffer,
            2 => Self::Stream,
            _ => return None,
        })
    }
}

/// Device kind + device id. The device kind namespace (cpu, cuda, …) is
/// owned by the serving session; the codec just carries the two `i32`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    pub device_kind: i32,
    pub device_id: i32,
}

impl Device {
    pub const CPU_KIND: i32 = 1;

    /// Sentinel `device_kind` marking a device whose backing API is itself
    /// a [`crate::session::ServingSession`] reached over another RPC
    /// endpoint (a proxy hop), as opposed to a device local to the peer.
    /// Such a device is meaningless to send across *this* wire — the
    /// receiving side has no way to dial back into the sender's proxied
    /// session — so it must be rejected client-side before framing the
    /// call (§4.3, §4.5, §7 "Argument validation").
    pub const RPC_SESSION_KIND: i32 = -1;

    #[must_use]
    pub const fn cpu(device_id: i32) -> Self {
        Self {
            device_kind: Self::CPU_KIND,
            device_id,
        }
    }

    #[must_use]
    pub const fn is_host(self) -> bool {
        self.device_kind == Self::CPU_KIND
    }

    /// True for the sentinel marking an RPC-session-backed proxy device
    /// (§4.3): a device a client must never pass through `call_func`.
    #[must_use]
    pub const fn is_rpc_session_device(self) -> bool {
        self.device_kind == Self::RPC_SESSION_KIND
    }
}

/// Element data-type descriptor: code (signed/unsigned/float/bfloat/...),
/// bit width, and lane count (for vector/packed element types).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataType {
    pub code: u8,
    pub bits: u8,
    pub lanes: u16,
}

impl DataType {
    pub const CODE_INT: u8 = 0;
    pub const CODE_UINT: u8 = 1;
    pub const CODE_FLOAT: u8 = 2;

    #[must_use]
    pub const fn f32() -> Self {
        Self {
            code: Self::CODE_FLOAT,
            bits: 32,
            lanes: 1,
        }
    }

    #[must_use]
    pub const fn u8_scalar() -> Self {
        Self {
            code: Self::CODE_UINT,
            bits: 8,
            lanes: 1,
        }
    }

    /// Width of one element in bytes, rounding up for sub-byte types
    /// (§9: such types must be staged, never read in place).
    #[must_use]
    pub const fn element_bytes(self) -> usize {
        ((self.bits as usize) * (self.lanes as usize) + 7) / 8
    }

    /// True when an element is a whole number of bytes wide. Sub-byte
    /// types (e.g. 4-bit) must always be staged rather than read through
    /// the host-resident fast path (§9 open question, resolved here).
    #[must_use]
    pub const fn is_byte_aligned(self) -> bool {
        ((self.bits as usize) * (self.lanes as usize)) % 8 == 0
    }
}

/// Device kind + id, element dtype, shape, byte offset, and an opaque
/// data handle. `data` is meaningful only on the side that owns the
/// backing allocation; the shape is carried inline rather than as a
/// separate handle since it is small and copied on every transfer anyway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    pub device: Device,
    pub data: u64,
    pub shape: SmallVec<[i64; 4]>,
    pub dtype: DataType,
    pub byte_offset: u64,
}

impl TensorDescriptor {
    /// Total element count (product of shape dims).
    #[must_use]
    pub fn numel(&self) -> i64 {
        self.shape.iter().product()
    }

    /// Total byte size of the described region.
    #[must_use]
    pub fn nbytes(&self) -> u64 {
        self.numel() as u64 * self.dtype.element_bytes() as u64
    }

    /// On-wire size of the bare tensor descriptor (device + data + ndim +
    /// shape + dtype + byte_offset), i.e. the fixed-per-shape part of a
    /// `CopyToRemote`/`CopyFromRemote` body before the `nbytes` field and
    /// payload. Used by the chunked-transfer adapter (§4.6) to compute how
    /// much of a negotiated max packet size is left for payload bytes.
    #[must_use]
    pub fn wire_header_len(&self) -> usize {
        8 + 8 + 4 + 8 * self.shape.len() + 4 + 8
    }
}

/// One value in a packed sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum PackedValue {
    Null,
    Int(i64),
    Float32(f32),
    Float64(f64),
    Str(String),
    Bytes(Bytes),
    DataType(DataType),
    Device(Device),
    Tensor(TensorDescriptor),
    /// Raw wire form of a remote object handle: kind tag + the 64-bit id.
    /// The codec does not manage handle lifetime — that is the event
    /// handler's and facade's job (§3, Remote Object Reference).
    Handle(ObjectKind, u64),
}

impl PackedValue {
    const fn type_code(&self) -> TypeCode {
        match self {
            Self::Null => TypeCode::Null,
            Self::Int(_) => TypeCode::Int,
            Self::Float32(_) => TypeCode::Float32,
            Self::Float64(_) => TypeCode::Float64,
            Self::Str(_) => TypeCode::Str,
            Self::Bytes(_) => TypeCode::Bytes,
            Self::DataType(_) => TypeCode::DataType,
            Self::Device(_) => TypeCode::Device,
            Self::Tensor(_) => TypeCode::Tensor,
            Self::Handle(..) => TypeCode::Handle,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::Int(_) => 8,
            Self::Float32(_) => 4,
            Self::Float64(_) => 8,
            Self::Str(s) => 8 + s.len(),
            Self::Bytes(b) => 8 + b.len(),
            Self::DataType(_) => 4,
            Self::Device(_) => 8,
            Self::Tensor(t) => 8 + 8 + 4 + 8 * t.shape.len() + 4 + 8,
            Self::Handle(..) => 4 + 8,
        }
    }
}

/// Reject arguments a client must never send (§4.3, §4.5, §7): an RPC-
/// session-backed proxy [`Device`], or a [`TensorDescriptor`] whose own
/// device carries that sentinel. Every other packed value is already a
/// closed, fully-specified set of wire-representable kinds, so there is
/// no separate "unknown object type" to check for here — that rejection
/// happens structurally, by `PackedValue` simply having no variant to
/// construct such a value in the first place.
///
/// Called by [`crate::handler::EventHandler`]'s client-side call framing
/// before a `CallFunc`/copy/syscall packet is ever queued, so a bad
/// argument fails the call locally instead of reaching the peer.
pub fn reject_unsendable_args(values: &[PackedValue]) -> Result<()> {
    for v in values {
        let offending = match v {
            PackedValue::Device(d) if d.is_rpc_session_device() => Some(*d),
            PackedValue::Tensor(t) if t.device.is_rpc_session_device() => Some(t.device),
            _ => None,
        };
        if let Some(d) = offending {
            return Err(RpcError::invalid_argument(format!(
                "cannot pass an RPC-session-backed device across the wire: {d:?}"
            )));
        }
    }
    Ok(())
}

/// Total on-wire length of an encoded packed sequence: `u32 num_args`
/// plus one `u32` type-code word per value plus each value's payload.
/// The encoder computes this up front (a dry-run traversal) so the outer
/// packet framing can prefix the exact `u64 length` before streaming.
#[must_use]
pub fn encoded_len(values: &[PackedValue]) -> usize {
    4 + values.len() * 4 + values.iter().map(PackedValue::payload_len).sum::<usize>()
}

/// Encode a packed sequence into `out`, appending to whatever is already
/// there.
pub fn encode(values: &[PackedValue], out: &mut BytesMut) {
    out.reserve(encoded_len(values));
    out.put_u32_le(values.len() as u32);
    for v in values {
        out.put_u32_le(v.type_code() as u32);
    }
    for v in values {
        encode_value(v, out);
    }
}

fn encode_value(v: &PackedValue, out: &mut BytesMut) {
    match v {
        PackedValue::Null => {}
        PackedValue::Int(i) => out.put_i64_le(*i),
        PackedValue::Float32(f) => out.put_f32_le(*f),
        PackedValue::Float64(f) => out.put_f64_le(*f),
        PackedValue::Str(s) => {
            out.put_u64_le(s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        PackedValue::Bytes(b) => {
            out.put_u64_le(b.len() as u64);
            out.extend_from_slice(b);
        }
        PackedValue::DataType(dt) => {
            out.put_u8(dt.code);
            out.put_u8(dt.bits);
            out.put_u16_le(dt.lanes);
        }
        PackedValue::Device(d) => {
            out.put_i32_le(d.device_kind);
            out.put_i32_le(d.device_id);
        }
        PackedValue::Tensor(t) => {
            out.put_i32_le(t.device.device_kind);
            out.put_i32_le(t.device.device_id);
            out.put_u64_le(t.data);
            out.put_u32_le(t.shape.len() as u32);
            for dim in &t.shape {
                out.put_i64_le(*dim);
            }
            out.put_u8(t.dtype.code);
            out.put_u8(t.dtype.bits);
            out.put_u16_le(t.dtype.lanes);
            out.put_u64_le(t.byte_offset);
        }
        PackedValue::Handle(kind, handle) => {
            out.put_u32_le(*kind as u32);
            out.put_u64_le(*handle);
        }
    }
}

/// Decode a packed sequence from `buf`, consuming exactly as many bytes
/// as [`encoded_len`] of the result would report. Any malformation
/// (truncated payload, unknown type code, negative ndim) is a framing
/// violation per §7 — fatal to the connection, not just the call.
pub fn decode(buf: &[u8]) -> Result<Vec<PackedValue>> {
    let mut cur = buf;
    let num_args = get_u32(&mut cur)? as usize;
    let mut codes = Vec::with_capacity(num_args);
    for _ in 0..num_args {
        let raw = get_u32(&mut cur)?;
        let code = TypeCode::from_u32(raw)
            .ok_or_else(|| RpcError::protocol(format!("unknown packed value type code {raw}")))?;
        codes.push(code);
    }

    let mut values = Vec::with_capacity(num_args);
    for code in codes {
        values.push(decode_value(code, &mut cur)?);
    }
    Ok(values)
}

fn decode_value(code: TypeCode, cur: &mut &[u8]) -> Result<PackedValue> {
    Ok(match code {
        TypeCode::Null => PackedValue::Null,
        TypeCode::Int => PackedValue::Int(get_i64(cur)?),
        TypeCode::Float32 => PackedValue::Float32(get_f32(cur)?),
        TypeCode::Float64 => PackedValue::Float64(get_f64(cur)?),
        TypeCode::Str => {
            let len = get_u64(cur)? as usize;
            let bytes = get_bytes(cur, len)?;
            PackedValue::Str(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| RpcError::protocol(format!("non-utf8 string argument: {e}")))?,
            )
        }
        TypeCode::Bytes => {
            let len = get_u64(cur)? as usize;
            PackedValue::Bytes(Bytes::copy_from_slice(get_bytes(cur, len)?))
        }
        TypeCode::DataType => {
            let code = get_u8(cur)?;
            let bits = get_u8(cur)?;
            let lanes = get_u16(cur)?;
            PackedValue::DataType(DataType { code, bits, lanes })
        }
        TypeCode::Device => {
            let device_kind = get_i32(cur)?;
            let device_id = get_i32(cur)?;
            PackedValue::Device(Device {
                device_kind,
                device_id,
            })
        }
        TypeCode::Tensor => {
            let device_kind = get_i32(cur)?;
            let device_id = get_i32(cur)?;
            let data = get_u64(cur)?;
            let ndim = get_u32(cur)? as i64;
            if ndim < 0 || ndim > 64 {
                return Err(RpcError::protocol(format!(
                    "tensor descriptor has invalid ndim {ndim}"
                )));
            }
            let mut shape = SmallVec::with_capacity(ndim as usize);
            for _ in 0..ndim {
                shape.push(get_i64(cur)?);
            }
            let dtype_code = get_u8(cur)?;
            let bits = get_u8(cur)?;
            let lanes = get_u16(cur)?;
            let byte_offset = get_u64(cur)?;
            PackedValue::Tensor(TensorDescriptor {
                device: Device {
                    device_kind,
                    device_id,
                },
                data,
                shape,
                dtype: DataType {
                    code: dtype_code,
                    bits,
                    lanes,
                },
                byte_offset,
            })
        }
        TypeCode::Handle => {
            let raw_kind = get_u32(cur)?;
            let kind = ObjectKind::from_u32(raw_kind)
                .ok_or_else(|| RpcError::protocol(format!("unknown object kind {raw_kind}")))?;
            let handle = get_u64(cur)?;
            PackedValue::Handle(kind, handle)
        }
    })
}

pub(crate) fn need(cur: &&[u8], n: usize) -> Result<()> {
    if cur.len() < n {
        return Err(RpcError::protocol(format!(
            "truncated packed value: needed {n} bytes, had {}",
            cur.len()
        )));
    }
    Ok(())
}

fn get_bytes<'a>(cur: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    need(cur, n)?;
    let (head, tail) = cur.split_at(n);
    *cur = tail;
    Ok(head)
}

pub(crate) fn get_u8(cur: &mut &[u8]) -> Result<u8> {
    need(cur, 1)?;
    Ok(cur.get_u8())
}
pub(crate) fn get_u16(cur: &mut &[u8]) -> Result<u16> {
    need(cur, 2)?;
    Ok(cur.get_u16_le())
}
pub(crate) fn get_i32(cur: &mut &[u8]) -> Result<i32> {
    need(cur, 4)?;
    Ok(cur.get_i32_le())
}
pub(crate) fn get_u32(cur: &mut &[u8]) -> Result<u32> {
    need(cur, 4)?;
    Ok(cur.get_u32_le())
}
pub(crate) fn get_i64(cur: &mut &[u8]) -> Result<i64> {
    need(cur, 8)?;
    Ok(cur.get_i64_le())
}
pub(crate) fn get_u64(cur: &mut &[u8]) -> Result<u64> {
    need(cur, 8)?;
    Ok(cur.get_u64_le())
}
pub(crate) fn get_f32(cur: &mut &[u8]) -> Result<f32> {
    need(cur, 4)?;
    Ok(cur.get_f32_le())
}
pub(crate) fn get_f64(cur: &mut &[u8]) -> Result<f64> {
    need(cur, 8)?;
    Ok(cur.get_f64_le())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(values: Vec<PackedValue>) {
        let expected_len = encoded_len(&values);
        let mut buf = BytesMut::new();
        encode(&values, &mut buf);
        assert_eq!(buf.len(), expected_len);
        let decoded = decode(&buf).expect("decode");
        assert_eq!(decoded, values);
    }

    #[test]
    fn scalar_kinds_roundtrip() {
        roundtrip(vec![
            PackedValue::Null,
            PackedValue::Int(-42),
            PackedValue::Int(i64::MIN),
            PackedValue::Float32(1.5),
            PackedValue::Float64(-2.25),
        ]);
    }

    #[test]
    fn strings_and_blobs_roundtrip_including_empty() {
        roundtrip(vec![
            PackedValue::Str("abc".to_string()),
            PackedValue::Str(String::new()),
            PackedValue::Bytes(Bytes::from_static(b"\x00\x01\x02")),
            PackedValue::Bytes(Bytes::new()),
        ]);
    }

    #[test]
    fn device_and_dtype_roundtrip() {
        roundtrip(vec![
            PackedValue::Device(Device::cpu(0)),
            PackedValue::DataType(DataType::f32()),
        ]);
    }

    #[test]
    fn tensor_descriptor_roundtrips_with_shape() {
        roundtrip(vec![PackedValue::Tensor(TensorDescriptor {
            device: Device::cpu(0),
            data: 0xdead_beef,
            shape: SmallVec::from_slice(&[4, 8, 16]),
            dtype: DataType::f32(),
            byte_offset: 128,
        })]);
    }

    #[test]
    fn scalar_tensor_with_empty_shape_roundtrips() {
        roundtrip(vec![PackedValue::Tensor(TensorDescriptor {
            device: Device::cpu(0),
            data: 1,
            shape: SmallVec::new(),
            dtype: DataType::u8_scalar(),
            byte_offset: 0,
        })]);
    }

    #[test]
    fn handle_roundtrips_for_each_object_kind() {
        roundtrip(vec![
            PackedValue::Handle(ObjectKind::Function, 7),
            PackedValue::Handle(ObjectKind::Buffer, 8),
            PackedValue::Handle(ObjectKind::Stream, 9),
        ]);
    }

    #[test]
    fn empty_sequence_roundtrips() {
        roundtrip(vec![]);
    }

    #[test]
    fn unknown_type_code_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        buf.put_u32_le(999);
        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[test]
    fn truncated_payload_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        buf.put_u32_le(TypeCode::Int as u32);
        buf.put_u8(0); // only 1 of 8 bytes
        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[test]
    fn negative_ndim_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        buf.put_u32_le(TypeCode::Tensor as u32);
        buf.put_i32_le(Device::CPU_KIND);
        buf.put_i32_le(0);
        buf.put_u64_le(0);
        buf.put_i32_le(-1); // ndim, read as u32 -> huge, rejected by range check
        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }
}
