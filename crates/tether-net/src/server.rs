//! Server side of the transport.
//!
//! [`ServerTransport::bind`] opens a TCP listener and a datagram socket on the
//! same address and spawns three kinds of tasks:
//!
//! - one accept loop that assigns [`ClientId`]s starting at 1,
//! - one read loop per connection that turns frames into [`ServerEvent`]s,
//! - one writer per connection that drains its bounded outbound queue,
//! - one datagram loop that maps source addresses back to clients.
//!
//! Everything received is funneled through a single event channel, so the
//! replication layer can own its state without locks and drain events once per
//! tick. Sending never waits on a socket: a peer whose outbound queue fills up
//! is disconnected instead of holding back everyone else.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::crypto::{KeyPair, PublicKey};
use crate::diagnostics::{TransportSnapshot, TransportStats};
use crate::framing::{FrameConfig, FrameError, read_frame};
use crate::ids::ClientId;
use crate::packet::Packet;
use crate::peer::{
    Channel, FrameSink, Outbound, Peer, PeerHello, TransportError, decode_inbound,
    encode_outbound,
};
use crate::platform::{SocketConfig, configure_stream, create_datagram_socket, create_listener};
use crate::registry::PacketRegistry;

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 65_535;

/// Configuration for [`ServerTransport`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address for both the listener and the datagram socket. Default: `0.0.0.0:7777`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections. Default: 32.
    pub max_connections: usize,
    /// How long a new connection may take to send `connect`. Default: 5s.
    pub handshake_timeout: Duration,
    /// Frames a connection may queue before its handshake completes. Default: 1024.
    pub pending_queue_cap: usize,
    /// Frames waiting for a connection's writer task. A peer that lets this
    /// fill up is disconnected. Default: 1024.
    pub outbound_queue_cap: usize,
    /// Seal reliable packets to each client's public key. Default: false.
    pub encrypt_reliable: bool,
    /// Capacity of the event channel. Default: 4096.
    pub event_capacity: usize,
    pub frame: FrameConfig,
    pub socket: SocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7777)),
            max_connections: 32,
            handshake_timeout: Duration::from_secs(5),
            pending_queue_cap: 1024,
            outbound_queue_cap: 1024,
            encrypt_reliable: false,
            event_capacity: 4096,
            frame: FrameConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its stream on a frame boundary.
    Closed,
    /// No `connect` arrived within the handshake timeout.
    HandshakeTimeout,
    /// Short read or oversized frame.
    Framing,
    /// A frame did not decode into a packet.
    Malformed,
    /// Closed locally through [`ServerTransport::disconnect`], a failed write or
    /// an overflowing queue.
    Kicked,
    /// The transport is shutting down.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Closed => "closed by peer",
            DisconnectReason::HandshakeTimeout => "handshake timed out",
            DisconnectReason::Framing => "framing error",
            DisconnectReason::Malformed => "malformed packet",
            DisconnectReason::Kicked => "disconnected by server",
            DisconnectReason::Shutdown => "server shutdown",
        };
        f.write_str(text)
    }
}

/// Something that happened on the network, in arrival order per connection.
#[derive(Debug)]
pub enum ServerEvent {
    Connected {
        client_id: ClientId,
        addr: SocketAddr,
    },
    Packet {
        client_id: ClientId,
        channel: Channel,
        packet: Packet,
    },
    Disconnected {
        client_id: ClientId,
        reason: DisconnectReason,
    },
}

/// Atomic generator for sequential [`ClientId`]s.
struct IdGenerator {
    next: AtomicU32,
}

impl IdGenerator {
    fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    fn next_id(&self) -> ClientId {
        ClientId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Live connections, indexed by client id and by announced datagram address.
#[derive(Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<ClientId, Arc<Peer>>>,
    by_datagram: RwLock<HashMap<SocketAddr, ClientId>>,
}

impl PeerTable {
    async fn insert(&self, peer: Arc<Peer>) {
        self.peers.write().await.insert(peer.client_id(), peer);
    }

    async fn remove(&self, client_id: ClientId) -> Option<Arc<Peer>> {
        let removed = self.peers.write().await.remove(&client_id);
        if let Some(addr) = removed.as_ref().and_then(|peer| peer.datagram_addr()) {
            let mut by_datagram = self.by_datagram.write().await;
            if by_datagram.get(&addr) == Some(&client_id) {
                by_datagram.remove(&addr);
            }
        }
        removed
    }

    /// Map `addr` to `client_id`. Fails if another client already owns it.
    async fn bind_datagram(&self, addr: SocketAddr, client_id: ClientId) -> bool {
        let mut by_datagram = self.by_datagram.write().await;
        match by_datagram.get(&addr) {
            Some(owner) if *owner != client_id => false,
            _ => {
                by_datagram.insert(addr, client_id);
                true
            }
        }
    }

    pub async fn get(&self, client_id: ClientId) -> Option<Arc<Peer>> {
        self.peers.read().await.get(&client_id).cloned()
    }

    pub async fn client_for_datagram(&self, addr: &SocketAddr) -> Option<ClientId> {
        self.by_datagram.read().await.get(addr).copied()
    }

    pub async fn all(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

struct Shared {
    config: ServerConfig,
    registry: Arc<PacketRegistry>,
    keys: KeyPair,
    peers: PeerTable,
    datagram: UdpSocket,
    events: mpsc::Sender<ServerEvent>,
    stats: TransportStats,
}

/// Listening endpoint for one server session.
pub struct ServerTransport {
    shared: Arc<Shared>,
    events: mpsc::Receiver<ServerEvent>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl ServerTransport {
    /// Bind the listener and datagram socket and start the background tasks.
    pub async fn bind(
        config: ServerConfig,
        registry: Arc<PacketRegistry>,
    ) -> Result<Self, TransportError> {
        let listener = create_listener(config.bind_addr, &config.socket)?;
        let local_addr = listener.local_addr()?;
        let datagram = create_datagram_socket(local_addr, &config.socket)?;
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(%local_addr, "Server listening");

        let shared = Arc::new(Shared {
            config,
            registry,
            keys: KeyPair::generate(),
            peers: PeerTable::default(),
            datagram,
            events: events_tx,
            stats: TransportStats::default(),
        });

        tokio::spawn(accept_loop(
            Arc::clone(&shared),
            listener,
            shutdown_rx.clone(),
        ));
        tokio::spawn(datagram_loop(Arc::clone(&shared), shutdown_rx));

        Ok(Self {
            shared,
            events: events_rx,
            local_addr,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn public_key(&self) -> PublicKey {
        self.shared.keys.public_key()
    }

    pub fn registry(&self) -> &PacketRegistry {
        &self.shared.registry
    }

    pub fn peers(&self) -> &PeerTable {
        &self.shared.peers
    }

    pub fn stats(&self) -> TransportSnapshot {
        self.shared.stats.snapshot()
    }

    /// Next queued event without waiting.
    pub fn try_next_event(&mut self) -> Option<ServerEvent> {
        self.events.try_recv().ok()
    }

    /// Wait for the next event. Returns `None` once every task has stopped.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Finish a client's handshake: send `preamble` first, then anything queued.
    ///
    /// The frames are written by the peer's writer task; this only queues them.
    pub async fn accept_handshake(
        &self,
        client_id: ClientId,
        preamble: &[Packet],
    ) -> Result<(), TransportError> {
        let peer = self.peer(client_id).await?;
        let mut frames = Vec::with_capacity(preamble.len());
        for packet in preamble {
            frames.push(self.encode_for(&peer, packet)?);
        }
        let result = peer.enqueue(Outbound::Open(frames));
        if result.is_ok() {
            peer.mark_ready();
        }
        self.reject_on_error(&peer, &result);
        result
    }

    /// Queue `packet` for one client on the reliable channel.
    pub async fn send(&self, client_id: ClientId, packet: &Packet) -> Result<(), TransportError> {
        let peer = self.peer(client_id).await?;
        let frame = self.encode_for(&peer, packet)?;
        let result = peer.enqueue(Outbound::Frame(frame));
        self.reject_on_error(&peer, &result);
        result
    }

    /// Send `packet` reliably to every connection except `except`.
    ///
    /// Connections still handshaking queue the frame, unless encryption is on
    /// and their key is unknown; those receive the state in their handshake.
    pub async fn broadcast(&self, packet: &Packet, except: Option<ClientId>) {
        let plain = if self.shared.config.encrypt_reliable {
            None
        } else {
            match self.shared.registry.serialize(packet) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    error!(error = %e, "Failed to serialize broadcast packet");
                    return;
                }
            }
        };

        for peer in self.shared.peers.all().await {
            if Some(peer.client_id()) == except {
                continue;
            }
            let frame = match &plain {
                Some(bytes) => bytes.clone(),
                None if peer.public_key().is_none() => continue,
                None => match self.encode_for(&peer, packet) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(client_id = %peer.client_id(), error = %e, "Failed to encode broadcast");
                        continue;
                    }
                },
            };
            let result = peer.enqueue(Outbound::Frame(frame));
            self.reject_on_error(&peer, &result);
        }
    }

    /// Send `packet` as one datagram to one client, if its address is known.
    pub async fn send_unreliable(
        &self,
        client_id: ClientId,
        packet: &Packet,
    ) -> Result<(), TransportError> {
        let peer = self.peer(client_id).await?;
        let Some(addr) = peer.datagram_addr() else {
            trace!(%client_id, "No datagram address yet, dropping");
            return Ok(());
        };
        let bytes = self.shared.registry.serialize(packet)?;
        self.shared.datagram.send_to(&bytes, addr).await?;
        self.shared.stats.datagram_sent();
        Ok(())
    }

    /// Send `packet` as a datagram to every handshaken client with a known address.
    pub async fn broadcast_unreliable(&self, packet: &Packet, except: Option<ClientId>) {
        let bytes = match self.shared.registry.serialize(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to serialize datagram");
                return;
            }
        };
        for peer in self.shared.peers.all().await {
            if Some(peer.client_id()) == except || !peer.is_ready() {
                continue;
            }
            let Some(addr) = peer.datagram_addr() else {
                continue;
            };
            match self.shared.datagram.send_to(&bytes, addr).await {
                Ok(_) => self.shared.stats.datagram_sent(),
                Err(e) => debug!(client_id = %peer.client_id(), error = %e, "Datagram send failed"),
            }
        }
    }

    /// Close one connection. Its read loop reports [`DisconnectReason::Kicked`].
    pub async fn disconnect(&self, client_id: ClientId) {
        if let Some(peer) = self.shared.peers.get(client_id).await {
            peer.kill();
        }
    }

    /// Stop accepting, close every connection and stop the datagram loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn peer(&self, client_id: ClientId) -> Result<Arc<Peer>, TransportError> {
        self.shared
            .peers
            .get(client_id)
            .await
            .ok_or(TransportError::PeerNotFound(client_id))
    }

    fn encode_for(&self, peer: &Peer, packet: &Packet) -> Result<Vec<u8>, TransportError> {
        let seal = self.shared.config.encrypt_reliable && !matches!(packet, Packet::ServerInfo(_));
        if !seal {
            return encode_outbound(&self.shared.registry, packet, None);
        }
        let key = peer.public_key().ok_or(TransportError::MissingPeerKey)?;
        encode_outbound(&self.shared.registry, packet, Some(&key))
    }

    fn reject_on_error(&self, peer: &Peer, result: &Result<(), TransportError>) {
        match result {
            Ok(()) | Err(TransportError::Closed) => {}
            Err(TransportError::QueueFull { cap }) => {
                warn!(client_id = %peer.client_id(), cap, "Outbound queue full, disconnecting slow peer");
                peer.kill();
            }
            Err(e) => {
                debug!(client_id = %peer.client_id(), error = %e, "Reliable send failed, disconnecting");
                peer.kill();
            }
        }
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let ids = IdGenerator::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };

                if shared.peers.len().await >= shared.config.max_connections {
                    warn!(%addr, "Connection limit reached, rejecting");
                    continue;
                }
                if let Err(e) = configure_stream(&stream, &shared.config.socket) {
                    warn!(%addr, error = %e, "Failed to apply socket options");
                }

                let client_id = ids.next_id();
                let (reader, writer) = stream.into_split();
                let sink = FrameSink::new(
                    writer,
                    shared.config.frame.clone(),
                    shared.config.pending_queue_cap,
                );
                let (peer, outbound_rx) =
                    Peer::new(client_id, addr, sink, shared.config.outbound_queue_cap);
                let peer = Arc::new(peer);
                shared.peers.insert(Arc::clone(&peer)).await;
                tokio::spawn(writer_loop(Arc::clone(&shared), Arc::clone(&peer), outbound_rx));

                info!(%client_id, %addr, "Accepted connection");
                if shared.events.send(ServerEvent::Connected { client_id, addr }).await.is_err() {
                    break;
                }

                tokio::spawn(connection_loop(
                    Arc::clone(&shared),
                    peer,
                    reader,
                    shutdown_rx.clone(),
                ));
            }
            _ = shutdown_rx.changed() => {
                info!("Server shutting down");
                break;
            }
        }
    }
}

async fn connection_loop(
    shared: Arc<Shared>,
    peer: Arc<Peer>,
    mut reader: OwnedReadHalf,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let client_id = peer.client_id();
    let mut kill_rx = peer.kill_signal();
    let deadline = Instant::now() + shared.config.handshake_timeout;

    let reason = loop {
        let frame = tokio::select! {
            result = read_frame(&mut reader, &shared.config.frame) => result,
            _ = tokio::time::sleep_until(deadline), if peer.hello().is_none() => {
                warn!(%client_id, "No connect packet before the handshake timeout");
                break DisconnectReason::HandshakeTimeout;
            }
            _ = kill_rx.wait_for(|killed| *killed) => break DisconnectReason::Kicked,
            _ = shutdown_rx.changed() => break DisconnectReason::Shutdown,
        };

        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(FrameError::ConnectionClosed) => break DisconnectReason::Closed,
            Err(e) => {
                warn!(%client_id, error = %e, "Framing error, closing connection");
                break DisconnectReason::Framing;
            }
        };
        shared.stats.frame_received();

        let packet = match decode_inbound(&shared.registry, &bytes, &shared.keys) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(%client_id, error = %e, "Malformed packet on reliable channel, closing connection");
                break DisconnectReason::Malformed;
            }
        };

        if let Packet::Connect(connect) = &packet {
            if peer.hello().is_some() {
                debug!(%client_id, "Duplicate connect ignored");
                continue;
            }
            let mut hello = PeerHello {
                datagram_addr: connect.udp_endpoint,
                public_key: connect.public_key.is_set().then_some(connect.public_key),
            };
            if let Some(addr) = hello.datagram_addr
                && !shared.peers.bind_datagram(addr, client_id).await
            {
                warn!(%client_id, %addr, "Datagram endpoint belongs to another client, ignoring it");
                hello.datagram_addr = None;
            }
            if !peer.record_hello(hello) {
                debug!(%client_id, "Duplicate connect ignored");
                continue;
            }
            debug!(%client_id, datagram_addr = ?hello.datagram_addr, "Received connect");
        } else if peer.hello().is_none() {
            debug!(%client_id, kind = ?packet.kind(), "Dropping packet received before connect");
            continue;
        }

        let event = ServerEvent::Packet {
            client_id,
            channel: Channel::Reliable,
            packet,
        };
        if shared.events.send(event).await.is_err() {
            break DisconnectReason::Shutdown;
        }
    };

    // Stops the writer task, which releases the sink if it is stuck on a write.
    peer.kill();
    peer.sink().close().await;
    shared.peers.remove(client_id).await;
    if !matches!(reason, DisconnectReason::Closed | DisconnectReason::Shutdown) {
        shared.stats.connection_dropped();
    }
    info!(%client_id, %reason, "Connection closed");
    let _ = shared
        .events
        .send(ServerEvent::Disconnected { client_id, reason })
        .await;
}

/// Drain one peer's outbound queue into its stream.
async fn writer_loop(
    shared: Arc<Shared>,
    peer: Arc<Peer>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
) {
    let client_id = peer.client_id();
    let mut kill_rx = peer.kill_signal();

    loop {
        let item = tokio::select! {
            item = outbound_rx.recv() => item,
            _ = kill_rx.wait_for(|killed| *killed) => break,
        };
        let Some(item) = item else {
            break;
        };

        let frames = match &item {
            Outbound::Frame(_) => 1,
            Outbound::Open(preamble) => preamble.len(),
        };
        let write = async {
            match item {
                Outbound::Frame(frame) => peer.sink().send(frame).await,
                Outbound::Open(preamble) => peer.sink().open(&preamble).await,
            }
        };
        let result = tokio::select! {
            result = write => result,
            _ = kill_rx.wait_for(|killed| *killed) => break,
        };

        match result {
            Ok(()) => {
                for _ in 0..frames {
                    shared.stats.frame_sent();
                }
            }
            Err(TransportError::Closed) => break,
            Err(TransportError::QueueFull { cap }) => {
                warn!(%client_id, cap, "Handshake queue overflow, disconnecting");
                peer.kill();
                break;
            }
            Err(e) => {
                debug!(%client_id, error = %e, "Reliable write failed, disconnecting");
                peer.kill();
                break;
            }
        }
    }
    trace!(%client_id, "Writer stopped");
}

async fn datagram_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, from) = tokio::select! {
            result = shared.datagram.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    debug!(error = %e, "Datagram receive failed");
                    continue;
                }
            },
            _ = shutdown_rx.changed() => break,
        };
        shared.stats.datagram_received();

        let Some(client_id) = shared.peers.client_for_datagram(&from).await else {
            shared.stats.unknown_datagram_source();
            trace!(%from, "Datagram from unknown source dropped");
            continue;
        };

        match decode_inbound(&shared.registry, &buf[..len], &shared.keys) {
            Ok(Packet::Connect(_)) => {
                debug!(%client_id, "Ignoring connect sent as a datagram");
            }
            Ok(packet) => {
                let event = ServerEvent::Packet {
                    client_id,
                    channel: Channel::Unreliable,
                    packet,
                };
                if shared.events.try_send(event).is_err() {
                    trace!(%client_id, "Event queue full, datagram dropped");
                }
            }
            Err(e) => {
                shared.stats.malformed_datagram();
                warn!(%client_id, error = %e, "Malformed datagram dropped");
            }
        }
    }
}
