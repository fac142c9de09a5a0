//! Client side of the transport.
//!
//! [`ClientTransport::connect`] opens the reliable stream and a datagram socket
//! aimed at the server, sends `connect`, and spawns one read loop per channel.
//! Reliable sends are held back until `server_info` arrives. State changes are
//! published through a [`watch`] channel so any number of consumers can react
//! without polling.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::crypto::{KeyPair, PublicKey};
use crate::diagnostics::{TransportSnapshot, TransportStats};
use crate::framing::{FrameConfig, FrameError, read_frame};
use crate::packet::{Connect, Packet};
use crate::peer::{Channel, FrameSink, TransportError, decode_inbound, encode_outbound};
use crate::platform::{
    SocketConfig, advertised_endpoint, configure_stream, create_datagram_socket, unspecified_for,
};
use crate::registry::PacketRegistry;
use crate::server::DisconnectReason;

const MAX_DATAGRAM: usize = 65_535;

/// Configuration for [`ClientTransport`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address for both channels. Default: `127.0.0.1:7777`.
    pub server_addr: SocketAddr,
    /// Frames held back before `server_info` arrives. Default: 1024.
    pub pending_queue_cap: usize,
    /// Seal reliable packets to the server's public key. Default: false.
    pub encrypt_reliable: bool,
    /// Capacity of the event channel. Default: 4096.
    pub event_capacity: usize,
    pub frame: FrameConfig,
    pub socket: SocketConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 7777)),
            pending_queue_cap: 1024,
            encrypt_reliable: false,
            event_capacity: 4096,
            frame: FrameConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Opening the reliable stream.
    Connecting,
    /// Stream open, `connect` sent, waiting for `server_info`.
    Handshaking,
    /// Handshake complete; all traffic flows.
    Connected,
    /// Connection lost or intentionally closed.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Something the server sent, or the end of the connection.
#[derive(Debug)]
pub enum ClientEvent {
    Packet { channel: Channel, packet: Packet },
    Disconnected { reason: DisconnectReason },
}

struct Shared {
    config: ClientConfig,
    registry: Arc<PacketRegistry>,
    keys: KeyPair,
    sink: FrameSink,
    datagram: UdpSocket,
    server_key: OnceLock<PublicKey>,
    state: ConnectionStateWatch,
    events: mpsc::Sender<ClientEvent>,
    stats: TransportStats,
}

/// Handle to one connection with a server.
pub struct ClientTransport {
    shared: Arc<Shared>,
    events: mpsc::Receiver<ClientEvent>,
    local_datagram_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl ClientTransport {
    /// Connect to `config.server_addr` and send `connect`.
    ///
    /// Returns once the stream is open; the handshake completes in the
    /// background and shows up as a `server_info` packet event.
    pub async fn connect(
        config: ClientConfig,
        registry: Arc<PacketRegistry>,
    ) -> Result<Self, TransportError> {
        let state = ConnectionStateWatch::new();
        state.set(ConnectionState::Connecting);

        let stream = TcpStream::connect(config.server_addr)
            .await
            .map_err(TransportError::Handshake)?;
        if let Err(e) = configure_stream(&stream, &config.socket) {
            warn!(error = %e, "Failed to apply socket options");
        }
        let stream_local = stream.local_addr()?;

        let datagram =
            create_datagram_socket(unspecified_for(&config.server_addr), &config.socket)?;
        datagram.connect(config.server_addr).await?;
        let local_datagram_addr = advertised_endpoint(datagram.local_addr()?, stream_local);

        let (reader, writer) = stream.into_split();
        let sink = FrameSink::new(writer, config.frame.clone(), config.pending_queue_cap);
        let keys = KeyPair::generate();

        let connect = Packet::Connect(Connect {
            udp_endpoint: Some(local_datagram_addr),
            public_key: keys.public_key(),
        });
        sink.send_now(&registry.serialize(&connect)?).await?;
        state.set(ConnectionState::Handshaking);
        info!(server = %config.server_addr, %local_datagram_addr, "Connected, handshake sent");

        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            config,
            registry,
            keys,
            sink,
            datagram,
            server_key: OnceLock::new(),
            state,
            events: events_tx,
            stats: TransportStats::default(),
        });
        shared.stats.frame_sent();

        tokio::spawn(read_loop(Arc::clone(&shared), reader, shutdown_rx.clone()));
        tokio::spawn(datagram_loop(Arc::clone(&shared), shutdown_rx));

        Ok(Self {
            shared,
            events: events_rx,
            local_datagram_addr,
            shutdown_tx,
        })
    }

    pub fn state(&self) -> &ConnectionStateWatch {
        &self.shared.state
    }

    pub fn public_key(&self) -> PublicKey {
        self.shared.keys.public_key()
    }

    /// The server's key, once `server_info` has arrived.
    pub fn server_key(&self) -> Option<PublicKey> {
        self.shared.server_key.get().copied()
    }

    /// Datagram address announced to the server.
    pub fn local_datagram_addr(&self) -> SocketAddr {
        self.local_datagram_addr
    }

    pub fn stats(&self) -> TransportSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn try_next_event(&mut self) -> Option<ClientEvent> {
        self.events.try_recv().ok()
    }

    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Send `packet` on the reliable channel, queued until the handshake completes.
    pub async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        let recipient = if self.shared.config.encrypt_reliable {
            Some(self.server_key().ok_or(TransportError::MissingPeerKey)?)
        } else {
            None
        };
        let frame = encode_outbound(&self.shared.registry, packet, recipient.as_ref())?;
        self.shared.sink.send(frame).await?;
        self.shared.stats.frame_sent();
        Ok(())
    }

    /// Send `packet` as a single datagram.
    pub async fn send_unreliable(&self, packet: &Packet) -> Result<(), TransportError> {
        let bytes = self.shared.registry.serialize(packet)?;
        self.shared.datagram.send(&bytes).await?;
        self.shared.stats.datagram_sent();
        Ok(())
    }

    /// Close both channels. The read loop reports [`DisconnectReason::Shutdown`].
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        self.shared.sink.close().await;
        self.shared.state.set(ConnectionState::Disconnected);
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let reason = loop {
        let frame = tokio::select! {
            result = read_frame(&mut reader, &shared.config.frame) => result,
            _ = shutdown_rx.changed() => break DisconnectReason::Shutdown,
        };

        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(FrameError::ConnectionClosed) => break DisconnectReason::Closed,
            Err(e) => {
                warn!(error = %e, "Framing error, closing connection");
                break DisconnectReason::Framing;
            }
        };
        shared.stats.frame_received();

        let packet = match decode_inbound(&shared.registry, &bytes, &shared.keys) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "Malformed packet on reliable channel, closing connection");
                break DisconnectReason::Malformed;
            }
        };

        if let Packet::ServerInfo(info) = &packet {
            if info.server_public_key.is_set() {
                let _ = shared.server_key.set(info.server_public_key);
            }
            if let Err(e) = shared.sink.open(&[]).await {
                warn!(error = %e, "Failed to flush queued frames");
                break DisconnectReason::Framing;
            }
            shared.state.set(ConnectionState::Connected);
            info!(client_id = %info.client_id, "Handshake complete");
        }

        let event = ClientEvent::Packet {
            channel: Channel::Reliable,
            packet,
        };
        if shared.events.send(event).await.is_err() {
            break DisconnectReason::Shutdown;
        }
    };

    shared.sink.close().await;
    shared.state.set(ConnectionState::Disconnected);
    info!(%reason, "Disconnected from server");
    let _ = shared
        .events
        .send(ClientEvent::Disconnected { reason })
        .await;
}

async fn datagram_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let len = tokio::select! {
            result = shared.datagram.recv(&mut buf) => match result {
                Ok(len) => len,
                Err(e) => {
                    debug!(error = %e, "Datagram receive failed");
                    continue;
                }
            },
            _ = shutdown_rx.changed() => break,
        };
        shared.stats.datagram_received();

        match decode_inbound(&shared.registry, &buf[..len], &shared.keys) {
            Ok(packet) => {
                let event = ClientEvent::Packet {
                    channel: Channel::Unreliable,
                    packet,
                };
                if shared.events.try_send(event).is_err() {
                    trace!("Event queue full, datagram dropped");
                }
            }
            Err(e) => {
                shared.stats.malformed_datagram();
                warn!(error = %e, "Malformed datagram dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ClientId, NetworkId, Timestamp};
    use crate::packet::{Despawn, Ping, Pong, ServerInfo};
    use crate::server::{ServerConfig, ServerEvent, ServerTransport};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn start_server(encrypt: bool) -> ServerTransport {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            encrypt_reliable: encrypt,
            ..Default::default()
        };
        ServerTransport::bind(config, Arc::new(PacketRegistry::standard()))
            .await
            .unwrap()
    }

    async fn connect_client(server: &ServerTransport, encrypt: bool) -> ClientTransport {
        let config = ClientConfig {
            server_addr: server.local_addr(),
            encrypt_reliable: encrypt,
            ..Default::default()
        };
        ClientTransport::connect(config, Arc::new(PacketRegistry::standard()))
            .await
            .unwrap()
    }

    async fn server_packet(server: &mut ServerTransport) -> (ClientId, Channel, Packet) {
        loop {
            match timeout(WAIT, server.next_event()).await.unwrap().unwrap() {
                ServerEvent::Packet {
                    client_id,
                    channel,
                    packet,
                } => return (client_id, channel, packet),
                ServerEvent::Connected { .. } => continue,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    async fn client_event(client: &mut ClientTransport) -> ClientEvent {
        timeout(WAIT, client.next_event()).await.unwrap().unwrap()
    }

    async fn handshake(server: &mut ServerTransport, client: &mut ClientTransport) -> ClientId {
        let (client_id, _, packet) = server_packet(server).await;
        assert!(matches!(packet, Packet::Connect(_)));
        let info = Packet::ServerInfo(ServerInfo {
            client_id,
            server_public_key: server.public_key(),
        });
        server.accept_handshake(client_id, &[info]).await.unwrap();
        match client_event(client).await {
            ClientEvent::Packet {
                packet: Packet::ServerInfo(info),
                ..
            } => assert_eq!(info.client_id, client_id),
            other => panic!("expected server_info, got {other:?}"),
        }
        client_id
    }

    #[tokio::test]
    async fn test_connect_refused_is_handshake_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClientConfig {
            server_addr: addr,
            ..Default::default()
        };
        let result = ClientTransport::connect(config, Arc::new(PacketRegistry::standard())).await;
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_connect_announces_datagram_endpoint_and_key() {
        let mut server = start_server(false).await;
        let client = connect_client(&server, false).await;
        assert_eq!(client.state().current(), ConnectionState::Handshaking);

        let (_, channel, packet) = server_packet(&mut server).await;
        assert_eq!(channel, Channel::Reliable);
        match packet {
            Packet::Connect(connect) => {
                assert_eq!(connect.udp_endpoint, Some(client.local_datagram_addr()));
                assert_eq!(connect.public_key, client.public_key());
            }
            other => panic!("expected connect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sends_held_until_server_info() {
        let mut server = start_server(false).await;
        let mut client = connect_client(&server, false).await;

        let ping = Packet::Ping(Ping {
            sequence: 7,
            sent_at: Timestamp(1),
        });
        client.send(&ping).await.unwrap();

        let client_id = handshake(&mut server, &mut client).await;
        assert_eq!(client.state().current(), ConnectionState::Connected);
        assert_eq!(client.server_key(), Some(server.public_key()));

        let (from, _, packet) = server_packet(&mut server).await;
        assert_eq!(from, client_id);
        assert_eq!(packet, ping);
    }

    #[tokio::test]
    async fn test_datagrams_flow_both_ways() {
        let mut server = start_server(false).await;
        let mut client = connect_client(&server, false).await;
        let client_id = handshake(&mut server, &mut client).await;

        let ping = Packet::Ping(Ping {
            sequence: 1,
            sent_at: Timestamp(5),
        });
        client.send_unreliable(&ping).await.unwrap();
        let (from, channel, packet) = server_packet(&mut server).await;
        assert_eq!((from, channel), (client_id, Channel::Unreliable));
        assert_eq!(packet, ping);

        let pong = Packet::Pong(Pong {
            sequence: 1,
            sent_at: Timestamp(5),
        });
        server.send_unreliable(client_id, &pong).await.unwrap();
        match client_event(&mut client).await {
            ClientEvent::Packet { channel, packet } => {
                assert_eq!(channel, Channel::Unreliable);
                assert_eq!(packet, pong);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_encrypted_reliable_channel() {
        let mut server = start_server(true).await;
        let mut client = connect_client(&server, true).await;
        let client_id = handshake(&mut server, &mut client).await;

        let despawn = Packet::Despawn(Despawn {
            network_id: NetworkId(4),
        });
        server.send(client_id, &despawn).await.unwrap();
        match client_event(&mut client).await {
            ClientEvent::Packet { packet, .. } => assert_eq!(packet, despawn),
            other => panic!("unexpected event {other:?}"),
        }

        let ping = Packet::Ping(Ping {
            sequence: 2,
            sent_at: Timestamp(9),
        });
        client.send(&ping).await.unwrap();
        let (_, _, packet) = server_packet(&mut server).await;
        assert_eq!(packet, ping);
    }

    #[tokio::test]
    async fn test_server_kick_reaches_client() {
        let mut server = start_server(false).await;
        let mut client = connect_client(&server, false).await;
        let client_id = handshake(&mut server, &mut client).await;

        server.disconnect(client_id).await;
        match client_event(&mut client).await {
            ClientEvent::Disconnected { reason } => assert_eq!(reason, DisconnectReason::Closed),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(client.state().current(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connection_state_transitions() {
        let watch = ConnectionStateWatch::new();
        assert_eq!(watch.current(), ConnectionState::Disconnected);

        let mut rx = watch.subscribe();
        watch.set(ConnectionState::Connecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
    }
}
