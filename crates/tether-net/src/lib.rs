//! Networking for object replication: the wire codec, the packet registry, and a
//! transport with a reliable framed stream plus an unreliable datagram channel.

pub mod client;
pub mod codec;
pub mod crypto;
pub mod diagnostics;
pub mod framing;
pub mod ids;
pub mod packet;
pub mod peer;
pub mod platform;
pub mod registry;
pub mod server;

pub use client::{ClientConfig, ClientEvent, ClientTransport, ConnectionState, ConnectionStateWatch};
pub use codec::{ByteReader, ByteWriter, CodecError, Decode, Encode, Nullable, PresenceMask};
pub use crypto::{CryptoError, KeyPair, PublicKey};
pub use diagnostics::{DiagnosticsConfig, DiagnosticsTracker, TransportSnapshot};
pub use framing::{FrameConfig, FrameError, read_frame, write_frame};
pub use ids::{BehaviourId, ClientId, MethodId, NetworkId, PrefabId, Timestamp};
pub use packet::{Packet, PacketKind};
pub use peer::{Channel, TransportError};
pub use platform::SocketConfig;
pub use registry::PacketRegistry;
pub use server::{DisconnectReason, PeerTable, ServerConfig, ServerEvent, ServerTransport};
