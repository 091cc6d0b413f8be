//! Bearer transports and the links built on them.
//!
//! A [`Transport`] only moves bytes out and tears the connection down. Bytes
//! coming in are pushed by the bearer into the link's [`ReassemblyBuffer`],
//! from which whole frames are decoded.

use crate::error::{HandshakeError, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use mesh_crypto::HashOutput;
use mesh_wire::{
    Capability, FrameCodec, Packet, ReassemblyBuffer, WireError, FRAME_OVERHEAD,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, trace, warn};

/// Packets buffered between the reader task and the state machine
const INBOX_DEPTH: usize = 32;

/// Outbound half of a bearer connection
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send one encoded frame
    async fn send(&self, bytes: Bytes) -> Result<(), TransportError>;

    /// Tear the connection down; the peer's inbound stream completes
    async fn disconnect(&self);

    /// Bearer this transport runs on
    fn bearer(&self) -> Capability;

    /// Human-readable endpoint description for logs
    fn describe(&self) -> String;
}

/// A connection to one remote: outbound transport plus inbound reassembly
#[derive(Clone)]
pub struct Link {
    /// Outbound half
    pub transport: Arc<dyn Transport>,
    /// Inbound bytes, pushed by the bearer
    pub inbound: Arc<ReassemblyBuffer>,
    /// LUID commitment seen at discovery time, if the bearer carries one
    pub advertised_luid: Option<HashOutput>,
    codec: FrameCodec,
}

impl Link {
    /// Assemble a link
    pub fn new(transport: Arc<dyn Transport>, inbound: Arc<ReassemblyBuffer>) -> Self {
        Self {
            transport,
            inbound,
            advertised_luid: None,
            codec: FrameCodec::new(),
        }
    }

    /// Attach the LUID commitment advertised during discovery
    pub fn with_advertised_luid(mut self, commitment: HashOutput) -> Self {
        self.advertised_luid = Some(commitment);
        self
    }

    /// Use a codec with a different frame cap
    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Bearer of the underlying transport
    pub fn bearer(&self) -> Capability {
        self.transport.bearer()
    }

    /// Endpoint description
    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Encode, frame and send a packet; returns the bytes written
    pub async fn send_packet(&self, packet: &Packet) -> Result<usize, HandshakeError> {
        let payload = packet.encode()?;
        let frame = self.codec.encode(&payload)?;
        let len = frame.len();
        trace!("Sending {:?} ({} bytes) on {}", packet.packet_type(), len, self.describe());
        self.transport.send(frame).await?;
        Ok(len)
    }

    /// Read one whole frame payload
    pub async fn recv_frame(&self) -> Result<Bytes, WireError> {
        self.codec.decode(self.inbound.as_ref()).await
    }

    /// Read and decode one packet.
    ///
    /// Not cancel-safe: dropping the future mid-frame loses stream position.
    /// The state machine reads through an [`Inbox`] instead.
    pub async fn recv_packet(&self) -> Result<Packet, HandshakeError> {
        let frame = self.recv_frame().await?;
        Ok(Packet::decode(&frame)?)
    }

    /// Disconnect the transport
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("transport", &self.describe())
            .field("bearer", &self.bearer())
            .finish()
    }
}

/// Cancel-safe packet reader: a task decodes frames off the link and queues them
pub struct Inbox {
    rx: mpsc::Receiver<Result<(Packet, usize), HandshakeError>>,
    reader: JoinHandle<()>,
}

impl Inbox {
    /// Start reading `link`
    pub fn spawn(link: &Link) -> Self {
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        let link = link.clone();
        let reader = tokio::spawn(async move {
            loop {
                let frame = match link.recv_frame().await {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("Reader on {} stopped: {}", link.describe(), e);
                        let _ = tx.send(Err(e.into())).await;
                        break;
                    }
                };
                let size = frame.len() + FRAME_OVERHEAD;
                // A bad packet inside a good frame leaves the stream in sync.
                let item = Packet::decode(&frame)
                    .map(|packet| (packet, size))
                    .map_err(HandshakeError::from);
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        Self { rx, reader }
    }

    /// Next packet and its frame size
    pub async fn recv(&mut self) -> Result<(Packet, usize), HandshakeError> {
        match self.rx.recv().await {
            Some(item) => item,
            None => Err(TransportError::Closed.into()),
        }
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// In-process transport delivering MTU-sized pieces into the peer's buffer
pub struct MemoryTransport {
    name: String,
    bearer: Capability,
    mtu: usize,
    peer_inbound: Arc<ReassemblyBuffer>,
    own_inbound: Arc<ReassemblyBuffer>,
    closed: AtomicBool,
    send_lock: Mutex<()>,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("name", &self.name)
            .field("bearer", &self.bearer)
            .field("mtu", &self.mtu)
            .finish()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, bytes: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let _guard = self.send_lock.lock().await;
        for piece in bytes.chunks(self.mtu) {
            self.peer_inbound
                .put_when_free(piece)
                .await
                .map_err(|e| match e {
                    WireError::Closed => TransportError::Closed,
                    other => other.into(),
                })?;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Disconnecting {}", self.name);
        }
        self.peer_inbound.complete();
        self.own_inbound.complete();
    }

    fn bearer(&self) -> Capability {
        self.bearer
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Build two connected in-process links.
///
/// `capacity` sizes each side's reassembly buffer; `mtu` bounds every piece
/// pushed into it and is clamped to the capacity.
pub fn memory_link_pair(bearer: Capability, capacity: usize, mtu: usize) -> (Link, Link) {
    let capacity = capacity.max(1);
    let mtu = mtu.clamp(1, capacity);
    let a_in = Arc::new(ReassemblyBuffer::new(capacity));
    let b_in = Arc::new(ReassemblyBuffer::new(capacity));

    let a = MemoryTransport {
        name: format!("mem-{bearer}:a"),
        bearer,
        mtu,
        peer_inbound: b_in.clone(),
        own_inbound: a_in.clone(),
        closed: AtomicBool::new(false),
        send_lock: Mutex::new(()),
    };
    let b = MemoryTransport {
        name: format!("mem-{bearer}:b"),
        bearer,
        mtu,
        peer_inbound: a_in.clone(),
        own_inbound: b_in.clone(),
        closed: AtomicBool::new(false),
        send_lock: Mutex::new(()),
    };

    (
        Link::new(Arc::new(a), a_in),
        Link::new(Arc::new(b), b_in),
    )
}

/// TCP transport; a pump task feeds the socket's read half into the link buffer
pub struct TcpTransport {
    peer: SocketAddr,
    bearer: Capability,
    writer: Mutex<Option<OwnedWriteHalf>>,
    pump: AbortHandle,
    inbound: Arc<ReassemblyBuffer>,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer", &self.peer)
            .field("bearer", &self.bearer)
            .finish()
    }
}

impl TcpTransport {
    /// Wrap a connected stream into a link
    pub fn link(stream: TcpStream, bearer: Capability, capacity: usize) -> std::io::Result<Link> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (mut reader, writer) = stream.into_split();
        let inbound = Arc::new(ReassemblyBuffer::new(capacity.max(1)));

        let sink = inbound.clone();
        let pump = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096.min(sink.capacity())];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        trace!("TCP peer {} closed", peer);
                        sink.complete();
                        break;
                    }
                    Ok(n) => {
                        if let Err(e) = sink.put_when_free(&buf[..n]).await {
                            debug!("TCP pump for {} stopped: {}", peer, e);
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("TCP read from {} failed: {}", peer, e);
                        sink.fail(e.to_string());
                        break;
                    }
                }
            }
        })
        .abort_handle();

        let transport = TcpTransport {
            peer,
            bearer,
            writer: Mutex::new(Some(writer)),
            pump,
            inbound: inbound.clone(),
        };
        Ok(Link::new(Arc::new(transport), inbound))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, bytes: Bytes) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(TransportError::Closed)?;
        writer.write_all(&bytes).await?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            debug!("Disconnecting TCP peer {}", self.peer);
            let _ = writer.shutdown().await;
        }
        self.pump.abort();
        self.inbound.complete();
    }

    fn bearer(&self) -> Capability {
        self.bearer
    }

    fn describe(&self) -> String {
        format!("tcp:{}", self.peer)
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::{AckPacket, AdvertisePacket};

    #[tokio::test]
    async fn test_memory_pair_roundtrip() {
        let (a, b) = memory_link_pair(Capability::Ble, 256, 20);
        let packet = Packet::Advertise(AdvertisePacket::new(vec![
            Capability::WifiDirect,
            Capability::Ble,
        ]));

        let sent = a.send_packet(&packet).await.unwrap();
        assert!(sent > FRAME_OVERHEAD);
        assert_eq!(b.recv_packet().await.unwrap(), packet);
        assert_eq!(a.bearer(), Capability::Ble);
    }

    #[tokio::test]
    async fn test_frames_larger_than_buffer() {
        // The reader drains while the sender waits for space.
        let (a, b) = memory_link_pair(Capability::Ble, 64, 20);
        let mut inbox = Inbox::spawn(&b);
        let packet = Packet::Ack(AckPacket::failure(
            mesh_wire::AckStatus::Fatal,
            "x".repeat(500),
        ));
        a.send_packet(&packet).await.unwrap();
        let (got, size) = inbox.recv().await.unwrap();
        assert_eq!(got, packet);
        assert!(size > 500);
    }

    #[tokio::test]
    async fn test_disconnect_closes_both_sides() {
        let (a, b) = memory_link_pair(Capability::Ble, 256, 20);
        let mut inbox = Inbox::spawn(&b);
        a.disconnect().await;

        assert!(matches!(
            inbox.recv().await,
            Err(HandshakeError::Wire(WireError::Closed))
        ));
        let result = b.send_packet(&Packet::Ack(AckPacket::ok())).await;
        assert_eq!(
            result,
            Err(HandshakeError::Transport(TransportError::Closed))
        );
        assert!(a.send_packet(&Packet::Ack(AckPacket::ok())).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_packet_keeps_stream() {
        let (a, b) = memory_link_pair(Capability::Ble, 256, 20);
        let mut inbox = Inbox::spawn(&b);

        let codec = FrameCodec::new();
        a.transport
            .send(codec.encode(&[0x7F, 0x00]).unwrap())
            .await
            .unwrap();
        a.send_packet(&Packet::Ack(AckPacket::ok())).await.unwrap();

        assert!(matches!(
            inbox.recv().await,
            Err(HandshakeError::Wire(WireError::UnknownPacket(0x7F)))
        ));
        assert_eq!(inbox.recv().await.unwrap().0, Packet::Ack(AckPacket::ok()));
    }

    #[tokio::test]
    async fn test_tcp_link() {
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpTransport::link(stream, Capability::Lan, 4096).unwrap()
        });
        let client = TcpTransport::link(connect_tcp(addr).await.unwrap(), Capability::Lan, 4096).unwrap();
        let server = accept.await.unwrap();

        client.send_packet(&Packet::Ack(AckPacket::ok())).await.unwrap();
        assert_eq!(server.recv_packet().await.unwrap(), Packet::Ack(AckPacket::ok()));
        assert!(server.describe().starts_with("tcp:"));

        client.disconnect().await;
        assert!(server.recv_packet().await.is_err());
    }
}
