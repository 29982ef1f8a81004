//! The client session adapter (§4.6): wraps an [`Endpoint`] to present a
//! uniform session + device API to local callers, and is the only place in
//! this crate that loops over the wire for a single logical transfer.
//!
//! Two responsibilities beyond plain delegation to [`Endpoint`]:
//!
//! 1. **Chunked transfer.** `CopyToRemote`/`CopyFromRemote` each carry one
//!    packet's worth of payload. A caller copying a multi-megabyte tensor
//!    needs that split into packets no larger than the peer is willing to
//!    buffer. [`ClientSession::copy_to_remote`]/[`ClientSession::copy_from_remote`]
//!    negotiate the peer's limit once (`tvm.rpc.server.GetCRTMaxPacketSize`,
//!    falling back to [`DEFAULT_MAX_PACKET_SIZE`] when the peer doesn't
//!    export that function) and issue as many single-packet transfers as
//!    the payload needs, each with an incrementing `byte_offset`.
//! 2. **Device API identity.** This adapter answers for every device as if
//!    it were that device's backing API; `exists` on a host device
//!    short-circuits to `true` without a round trip, matching the
//!    session-side `DevGetAttr` fallback in [`minrpc_wire::handler`].

use crate::endpoint::Endpoint;
use bytes::{Bytes, BytesMut};
use minrpc_core::transport::Transport;
use minrpc_wire::config::DEFAULT_MAX_PACKET_SIZE;
use minrpc_wire::error::{Result, RpcError};
use minrpc_wire::proto::Opcode;
use minrpc_wire::session::DEV_ATTR_EXISTS;
use minrpc_wire::value::{Device, ObjectKind, PackedValue, TensorDescriptor};
use tracing::trace;

/// Well-known function name a serving session may export to report the
/// largest packet body it is willing to accept in one `CopyToRemote` or
/// hand back in one `CopyAck`. Absent this, [`DEFAULT_MAX_PACKET_SIZE`]
/// governs (§4.6).
pub const GET_CRT_MAX_PACKET_SIZE_FN: &str = "tvm.rpc.server.GetCRTMaxPacketSize";

/// Per-packet framing overhead that isn't payload: the 4-byte opcode plus
/// the `u64 nbytes` field that precedes the payload in a
/// `CopyToRemote`/`CopyAck` body. The tensor descriptor's own (shape
/// dependent) size is added on top of this per call.
const FIXED_COPY_OVERHEAD: usize = 4 + 8;

/// Wraps an [`Endpoint`] with the chunked-copy and device-API-identity
/// behavior a local caller expects from a session object, per §4.6.
pub struct ClientSession<T> {
    endpoint: Endpoint<T>,
    negotiated_max_packet_size: Option<usize>,
}

impl<T: Transport> ClientSession<T> {
    #[must_use]
    pub const fn new(endpoint: Endpoint<T>) -> Self {
        Self {
            endpoint,
            negotiated_max_packet_size: None,
        }
    }

    #[must_use]
    pub const fn get_ref(&self) -> &Endpoint<T> {
        &self.endpoint
    }

    #[must_use]
    pub fn get_mut(&mut self) -> &mut Endpoint<T> {
        &mut self.endpoint
    }

    #[must_use]
    pub fn into_inner(self) -> Endpoint<T> {
        self.endpoint
    }

    /// The max packet size to chunk transfers against: negotiated with the
    /// peer on first use, cached thereafter. Falls back to
    /// [`DEFAULT_MAX_PACKET_SIZE`] (clamped to this side's own configured
    /// ceiling) if the peer does not export
    /// [`GET_CRT_MAX_PACKET_SIZE_FN`].
    async fn max_packet_size(&mut self) -> Result<usize> {
        if let Some(n) = self.negotiated_max_packet_size {
            return Ok(n);
        }

        let local_ceiling = self.endpoint.max_packet_size();
        let negotiated = match self.query_peer_max_packet_size().await {
            Ok(n) => n.min(local_ceiling),
            Err(RpcError::RemoteException { .. }) => {
                trace!(
                    default = DEFAULT_MAX_PACKET_SIZE,
                    "peer does not export {GET_CRT_MAX_PACKET_SIZE_FN}, using default"
                );
                DEFAULT_MAX_PACKET_SIZE.min(local_ceiling)
            }
            Err(e) => return Err(e),
        };
        self.negotiated_max_packet_size = Some(negotiated);
        Ok(negotiated)
    }

    async fn query_peer_max_packet_size(&mut self) -> Result<usize> {
        let handle_val = self
            .endpoint
            .syscall(
                Opcode::GetGlobalFunc,
                &[PackedValue::Str(GET_CRT_MAX_PACKET_SIZE_FN.to_string())],
            )
            .await?;
        let PackedValue::Handle(ObjectKind::Function, handle) = handle_val else {
            return Err(RpcError::protocol(
                "GetGlobalFunc did not return a function handle",
            ));
        };
        let result = self.endpoint.call_func(handle, &[]).await?;
        match result.first() {
            Some(PackedValue::Int(n)) if *n > 0 => Ok(*n as usize),
            _ => Err(RpcError::protocol(format!(
                "{GET_CRT_MAX_PACKET_SIZE_FN} did not return a positive int"
            ))),
        }
    }

    /// Copy `data` into `tensor` on the peer, splitting it into as many
    /// single-packet `CopyToRemote` transfers as the negotiated max packet
    /// size requires. Each chunk carries its own `byte_offset`, advancing
    /// from `tensor.byte_offset`.
    pub async fn copy_to_remote(&mut self, tensor: &TensorDescriptor, data: &[u8]) -> Result<()> {
        let chunk_cap = self.chunk_capacity(tensor).await?;

        if data.is_empty() {
            return self.endpoint.copy_to_remote(tensor, &[]).await;
        }

        let mut offset = 0usize;
        while offset < data.len() {
            let take = chunk_cap.min(data.len() - offset);
            let mut chunk = tensor.clone();
            chunk.byte_offset = tensor.byte_offset + offset as u64;
            self.endpoint
                .copy_to_remote(&chunk, &data[offset..offset + take])
                .await?;
            offset += take;
        }
        Ok(())
    }

    /// Copy `nbytes` out of `tensor` on the peer, issuing as many
    /// single-packet `CopyFromRemote`/`CopyAck` round trips as the
    /// negotiated max packet size requires, and concatenating the results
    /// in order.
    pub async fn copy_from_remote(&mut self, tensor: &TensorDescriptor, nbytes: u64) -> Result<Bytes> {
        let chunk_cap = self.chunk_capacity(tensor).await? as u64;

        if nbytes == 0 {
            return self.endpoint.copy_from_remote(tensor, 0).await;
        }

        let mut out = BytesMut::with_capacity(nbytes as usize);
        let mut offset = 0u64;
        while offset < nbytes {
            let take = chunk_cap.min(nbytes - offset);
            let mut chunk = tensor.clone();
            chunk.byte_offset = tensor.byte_offset + offset;
            let piece = self.endpoint.copy_from_remote(&chunk, take).await?;
            out.extend_from_slice(&piece);
            offset += take;
        }
        Ok(out.freeze())
    }

    async fn chunk_capacity(&mut self, tensor: &TensorDescriptor) -> Result<usize> {
        let max = self.max_packet_size().await?;
        let overhead = FIXED_COPY_OVERHEAD + tensor.wire_header_len();
        Ok(max.saturating_sub(overhead).max(1))
    }

    /// Answer `DevGetAttr(dev, exists)` the way a device API identity would:
    /// `true` immediately for a host device, otherwise a real round trip
    /// to the peer's `DevGetAttr` syscall (§4.6 rule 2).
    pub async fn device_exists(&mut self, dev: Device) -> Result<bool> {
        if dev.is_host() {
            return Ok(true);
        }
        let v = self
            .endpoint
            .syscall(
                Opcode::DevGetAttr,
                &[PackedValue::Device(dev), PackedValue::Int(i64::from(DEV_ATTR_EXISTS))],
            )
            .await?;
        match v {
            PackedValue::Int(n) => Ok(n != 0),
            _ => Err(RpcError::protocol("DevGetAttr(exists) returned a non-int value")),
        }
    }

    /// Forward to [`Endpoint::init_remote_session`].
    pub async fn init_remote_session(
        &mut self,
        ctor_name: &str,
        ctor_args: Vec<PackedValue>,
    ) -> Result<()> {
        self.endpoint.init_remote_session(ctor_name, ctor_args).await
    }

    /// Forward to [`Endpoint::call_func`].
    pub async fn call_func(&mut self, handle: u64, args: &[PackedValue]) -> Result<Vec<PackedValue>> {
        self.endpoint.call_func(handle, args).await
    }

    /// Forward to [`Endpoint::syscall`].
    pub async fn syscall(&mut self, opcode: Opcode, args: &[PackedValue]) -> Result<PackedValue> {
        self.endpoint.syscall(opcode, args).await
    }

    /// Forward to [`Endpoint::shutdown`].
    pub async fn shutdown(&mut self) -> Result<()> {
        self.endpoint.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_session::LocalSession;
    use minrpc_wire::config::EndpointConfig;
    use minrpc_wire::value::DataType;
    use std::sync::Arc;

    async fn connected_pair() -> (ClientSession<minrpc_core::transport::DuplexPipe>, u64) {
        let (client_io, server_io) = minrpc_core::transport::DuplexPipe::pair();
        let client_ep = Endpoint::client(client_io, EndpointConfig::default());
        let mut client = ClientSession::new(client_ep);

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
                    PackedValue::Int(1 << 20),
                    PackedValue::Int(1),
                    PackedValue::DataType(DataType::u8_scalar()),
                ],
            )
            .await
            .unwrap();
        let PackedValue::Handle(ObjectKind::Buffer, data) = handle else {
            panic!("expected a buffer handle");
        };
        (client, data)
    }

    #[compio::test]
    async fn falls_back_to_default_when_peer_has_no_size_negotiation_function() {
        let (mut client, _data) = connected_pair().await;
        let n = client.max_packet_size().await.unwrap();
        assert_eq!(n, DEFAULT_MAX_PACKET_SIZE.min(client.endpoint.max_packet_size()));
    }

    #[compio::test]
    async fn large_copy_splits_into_many_packets_and_round_trips() {
        let (mut client, data) = connected_pair().await;
        client.negotiated_max_packet_size = Some(32 * 1024);

        let tensor = TensorDescriptor {
            device: Device::cpu(0),
            data,
            shape: smallvec::SmallVec::from_slice(&[1 << 20]),
            dtype: DataType::u8_scalar(),
            byte_offset: 0,
        };
        let payload: Vec<u8> = (0..1usize << 20).map(|i| (i % 251) as u8).collect();

        client.copy_to_remote(&tensor, &payload).await.unwrap();
        let back = client
            .copy_from_remote(&tensor, payload.len() as u64)
            .await
            .unwrap();
        assert_eq!(&back[..], &payload[..]);
    }

    #[compio::test]
    async fn zero_length_copy_round_trips_without_chunking() {
        let (mut client, data) = connected_pair().await;
        let tensor = TensorDescriptor {
            device: Device::cpu(0),
            data,
            shape: smallvec::SmallVec::new(),
            dtype: DataType::u8_scalar(),
            byte_offset: 0,
        };
        client.copy_to_remote(&tensor, &[]).await.unwrap();
        let back = client.copy_from_remote(&tensor, 0).await.unwrap();
        assert!(back.is_empty());
    }

    #[compio::test]
    async fn device_exists_short_circuits_for_host_device() {
        let (mut client, _data) = connected_pair().await;
        assert!(client.device_exists(Device::cpu(0)).await.unwrap());
    }
}
