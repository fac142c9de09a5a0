//! Per-connection write state shared by the server and client transports.
//!
//! A [`FrameSink`] owns the write half of a reliable stream behind a single
//! async mutex, so concurrent senders queue instead of interleaving frames. It
//! also gates traffic on the handshake: frames sent before [`FrameSink::open`]
//! are held in a bounded queue and flushed, in order, right after the handshake
//! preamble.
//!
//! On the server every [`Peer`] also owns a bounded outbound queue drained by
//! its own writer task, so a peer that stops reading only ever stalls itself.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};

use crate::codec::CodecError;
use crate::crypto::{self, CryptoError, KeyPair, PublicKey};
use crate::framing::{FrameConfig, FrameError, write_frame};
use crate::ids::ClientId;
use crate::packet::{Encrypted, Packet};
use crate::registry::PacketRegistry;

/// Which channel a packet travelled on, or should travel on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Ordered, length-framed stream.
    Reliable,
    /// Best-effort datagrams, one packet per datagram.
    Unreliable,
}

/// Errors surfaced by the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The reliable stream could not be established.
    #[error("handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Too many frames queued for a peer that is not keeping up.
    #[error("outbound queue exceeded {cap} frames")]
    QueueFull { cap: usize },

    #[error("no connection with client id {0}")]
    PeerNotFound(ClientId),

    /// Encryption was requested but the recipient's key is not known yet.
    #[error("recipient public key is not known")]
    MissingPeerKey,

    #[error("connection is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

struct SinkState<W> {
    writer: W,
    open: bool,
    closed: bool,
    pending: VecDeque<Vec<u8>>,
}

/// Serialized, handshake-gated writer for one reliable stream.
pub struct FrameSink<W = OwnedWriteHalf> {
    state: Mutex<SinkState<W>>,
    config: FrameConfig,
    pending_cap: usize,
}

impl<W: AsyncWrite + Unpin + Send> FrameSink<W> {
    pub fn new(writer: W, config: FrameConfig, pending_cap: usize) -> Self {
        Self {
            state: Mutex::new(SinkState {
                writer,
                open: false,
                closed: false,
                pending: VecDeque::new(),
            }),
            config,
            pending_cap,
        }
    }

    /// Write `frame`, or queue it if the handshake has not completed.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TransportError::Closed);
        }
        if !state.open {
            if state.pending.len() >= self.pending_cap {
                return Err(TransportError::QueueFull {
                    cap: self.pending_cap,
                });
            }
            state.pending.push_back(frame);
            return Ok(());
        }
        write_frame(&mut state.writer, &frame, &self.config).await?;
        Ok(())
    }

    /// Write `frame` immediately, ignoring the handshake gate.
    pub async fn send_now(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TransportError::Closed);
        }
        write_frame(&mut state.writer, frame, &self.config).await?;
        Ok(())
    }

    /// Complete the handshake: write `preamble`, then flush queued frames.
    pub async fn open(&self, preamble: &[Vec<u8>]) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TransportError::Closed);
        }
        for frame in preamble {
            write_frame(&mut state.writer, frame, &self.config).await?;
        }
        while let Some(frame) = state.pending.pop_front() {
            write_frame(&mut state.writer, &frame, &self.config).await?;
        }
        state.open = true;
        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.open
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Shut the write half down. Later sends fail with [`TransportError::Closed`].
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if !state.closed {
            state.closed = true;
            state.pending.clear();
            let _ = state.writer.shutdown().await;
        }
    }
}

/// What a client announced in its `connect` packet.
#[derive(Debug, Clone, Copy)]
pub struct PeerHello {
    pub datagram_addr: Option<SocketAddr>,
    pub public_key: Option<PublicKey>,
}

/// Work item for a peer's writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// One encoded frame, held by the sink until the handshake completes.
    Frame(Vec<u8>),
    /// Handshake preamble. Opens the sink and flushes what it held.
    Open(Vec<Vec<u8>>),
}

/// Server-side record of one accepted connection.
pub struct Peer {
    client_id: ClientId,
    stream_addr: SocketAddr,
    sink: FrameSink,
    hello: OnceLock<PeerHello>,
    outbound: mpsc::Sender<Outbound>,
    outbound_cap: usize,
    ready: AtomicBool,
    kill_tx: watch::Sender<bool>,
}

impl Peer {
    /// Build the record plus the receiving end of its outbound queue.
    pub(crate) fn new(
        client_id: ClientId,
        stream_addr: SocketAddr,
        sink: FrameSink,
        outbound_cap: usize,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let outbound_cap = outbound_cap.max(1);
        let (outbound, outbound_rx) = mpsc::channel(outbound_cap);
        let (kill_tx, _) = watch::channel(false);
        let peer = Self {
            client_id,
            stream_addr,
            sink,
            hello: OnceLock::new(),
            outbound,
            outbound_cap,
            ready: AtomicBool::new(false),
            kill_tx,
        };
        (peer, outbound_rx)
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn stream_addr(&self) -> SocketAddr {
        self.stream_addr
    }

    pub fn hello(&self) -> Option<&PeerHello> {
        self.hello.get()
    }

    pub fn datagram_addr(&self) -> Option<SocketAddr> {
        self.hello().and_then(|hello| hello.datagram_addr)
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        self.hello().and_then(|hello| hello.public_key)
    }

    pub fn sink(&self) -> &FrameSink {
        &self.sink
    }

    /// The server accepted this peer's handshake.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Hand `item` to the writer task without waiting on the socket.
    pub(crate) fn enqueue(&self, item: Outbound) -> Result<(), TransportError> {
        self.outbound.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::QueueFull {
                cap: self.outbound_cap,
            },
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Record the `connect` contents. Returns false if the peer already said hello.
    pub(crate) fn record_hello(&self, hello: PeerHello) -> bool {
        self.hello.set(hello).is_ok()
    }

    /// Ask this connection's read loop to stop.
    pub(crate) fn kill(&self) {
        self.kill_tx.send_replace(true);
    }

    pub(crate) fn kill_signal(&self) -> watch::Receiver<bool> {
        self.kill_tx.subscribe()
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("client_id", &self.client_id)
            .field("stream_addr", &self.stream_addr)
            .field("hello", &self.hello.get())
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Serialize `packet`, sealing it to `recipient` when one is given.
pub fn encode_outbound(
    registry: &PacketRegistry,
    packet: &Packet,
    recipient: Option<&PublicKey>,
) -> Result<Vec<u8>, TransportError> {
    let plain = registry.serialize(packet)?;
    match recipient {
        None => Ok(plain),
        Some(key) => {
            let sealed = crypto::seal(key, &plain)?;
            Ok(registry.serialize(&Packet::Encrypted(Encrypted { sealed }))?)
        }
    }
}

/// Deserialize a received payload, unwrapping one layer of encryption.
pub fn decode_inbound(
    registry: &PacketRegistry,
    bytes: &[u8],
    keys: &KeyPair,
) -> Result<Packet, TransportError> {
    match registry.deserialize(bytes)? {
        Packet::Encrypted(wrapper) => {
            let plain = keys.open(&wrapper.sealed)?;
            match registry.deserialize(&plain)? {
                Packet::Encrypted(_) => Err(CodecError::InvalidValue("nested encrypted packet").into()),
                inner => Ok(inner),
            }
        }
        packet => Ok(packet),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::read_frame;
    use crate::ids::{NetworkId, Timestamp};
    use crate::packet::{Despawn, Ping};
    use std::sync::Arc;
    use tokio::io::duplex;

    fn sink_pair(cap: usize) -> (FrameSink<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (writer, reader) = duplex(64 * 1024);
        (FrameSink::new(writer, FrameConfig::default(), cap), reader)
    }

    #[tokio::test]
    async fn test_frames_queue_until_open() {
        let (sink, mut reader) = sink_pair(8);
        let config = FrameConfig::default();

        sink.send(b"early".to_vec()).await.unwrap();
        assert_eq!(sink.pending_len().await, 1);

        sink.open(&[b"hello".to_vec()]).await.unwrap();
        sink.send(b"late".to_vec()).await.unwrap();

        assert_eq!(read_frame(&mut reader, &config).await.unwrap(), b"hello");
        assert_eq!(read_frame(&mut reader, &config).await.unwrap(), b"early");
        assert_eq!(read_frame(&mut reader, &config).await.unwrap(), b"late");
    }

    #[tokio::test]
    async fn test_queue_cap_enforced() {
        let (sink, _reader) = sink_pair(2);
        sink.send(vec![1]).await.unwrap();
        sink.send(vec![2]).await.unwrap();
        assert!(matches!(
            sink.send(vec![3]).await,
            Err(TransportError::QueueFull { cap: 2 })
        ));
    }

    #[tokio::test]
    async fn test_send_now_bypasses_gate() {
        let (sink, mut reader) = sink_pair(2);
        sink.send_now(b"connect").await.unwrap();
        let frame = read_frame(&mut reader, &FrameConfig::default()).await.unwrap();
        assert_eq!(frame, b"connect");
        assert!(!sink.is_open().await);
    }

    #[tokio::test]
    async fn test_concurrent_senders_never_interleave() {
        let (sink, mut reader) = sink_pair(0);
        sink.open(&[]).await.unwrap();
        let sink = Arc::new(sink);

        let mut handles = Vec::new();
        for task in 0u8..8 {
            let sink = Arc::clone(&sink);
            handles.push(tokio::spawn(async move {
                for _ in 0..20 {
                    sink.send(vec![task; 300]).await.unwrap();
                }
            }));
        }

        let config = FrameConfig::default();
        for _ in 0..160 {
            let frame = read_frame(&mut reader, &config).await.unwrap();
            assert_eq!(frame.len(), 300);
            assert!(frame.iter().all(|b| *b == frame[0]), "frame was interleaved");
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_closed_sink_rejects_sends() {
        let (sink, _reader) = sink_pair(4);
        sink.close().await;
        assert!(matches!(sink.send(vec![1]).await, Err(TransportError::Closed)));
        assert!(matches!(sink.send_now(&[1]).await, Err(TransportError::Closed)));
    }

    #[test]
    fn test_encrypted_roundtrip_through_registry() {
        let registry = PacketRegistry::standard();
        let recipient = KeyPair::generate();
        let packet = Packet::Despawn(Despawn {
            network_id: NetworkId(12),
        });

        let wire = encode_outbound(&registry, &packet, Some(&recipient.public_key())).unwrap();
        assert!(matches!(
            registry.deserialize(&wire).unwrap(),
            Packet::Encrypted(_)
        ));
        assert_eq!(decode_inbound(&registry, &wire, &recipient).unwrap(), packet);
    }

    #[test]
    fn test_plain_packets_pass_through() {
        let registry = PacketRegistry::standard();
        let keys = KeyPair::generate();
        let packet = Packet::Ping(Ping {
            sequence: 3,
            sent_at: Timestamp(99),
        });
        let wire = encode_outbound(&registry, &packet, None).unwrap();
        assert_eq!(decode_inbound(&registry, &wire, &keys).unwrap(), packet);
    }

    #[test]
    fn test_nested_encryption_rejected() {
        let registry = PacketRegistry::standard();
        let keys = KeyPair::generate();
        let inner = encode_outbound(
            &registry,
            &Packet::Encrypted(Encrypted { sealed: vec![1, 2] }),
            Some(&keys.public_key()),
        )
        .unwrap();
        assert!(matches!(
            decode_inbound(&registry, &inner, &keys),
            Err(TransportError::Codec(CodecError::InvalidValue(_)))
        ));
    }
}
