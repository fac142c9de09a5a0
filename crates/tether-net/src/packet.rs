//! Packet kinds and the presence-bitmask body codec.
//!
//! A packet body is a presence mask followed by the bytes of every present field
//! in declaration order:
//!
//! ```text
//! +------------------------------+---------------------------------+
//! | mask: ceil(fields / 8) bytes | present fields, declared order  |
//! +------------------------------+---------------------------------+
//! ```
//!
//! A field whose value equals its type default is left out and its bit cleared.
//! Decoding starts from `Default::default()` and only overwrites fields whose bit
//! is set.

use std::net::SocketAddr;

use glam::{Quat, Vec3};

use crate::codec::{ByteReader, ByteWriter, CodecError, Decode, Encode, PresenceMask};
use crate::crypto::PublicKey;
use crate::ids::{BehaviourId, ClientId, MethodId, NetworkId, PrefabId, Timestamp};

/// A packet body with a statically known, ordered field list.
pub trait PacketBody: Default {
    const FIELD_COUNT: usize;

    fn write_fields(&self, fields: &mut FieldEncoder);

    fn read_fields(&mut self, fields: &mut FieldDecoder<'_, '_>) -> Result<(), CodecError>;
}

/// Writes fields behind a presence mask.
pub struct FieldEncoder {
    mask: PresenceMask,
    data: ByteWriter,
    index: usize,
}

impl FieldEncoder {
    fn new(field_count: usize) -> Self {
        Self {
            mask: PresenceMask::new(field_count),
            data: ByteWriter::new(),
            index: 0,
        }
    }

    /// Write the next field unless it holds its default value.
    pub fn field<T: Encode + Default + PartialEq>(&mut self, value: &T) {
        if *value != T::default() {
            self.mask.set(self.index);
            value.encode(&mut self.data);
        }
        self.index += 1;
    }

    fn finish(self, writer: &mut ByteWriter) {
        self.mask.write(writer);
        writer.put_slice(self.data.as_slice());
    }
}

/// Reads fields written by [`FieldEncoder`].
pub struct FieldDecoder<'r, 'a> {
    mask: PresenceMask,
    reader: &'r mut ByteReader<'a>,
    index: usize,
}

impl<'r, 'a> FieldDecoder<'r, 'a> {
    fn new(reader: &'r mut ByteReader<'a>, field_count: usize) -> Result<Self, CodecError> {
        let mask = PresenceMask::read(reader, field_count)?;
        Ok(Self {
            mask,
            reader,
            index: 0,
        })
    }

    /// Decode the next field into `slot` if its presence bit is set.
    pub fn field<T: Decode>(&mut self, slot: &mut T) -> Result<(), CodecError> {
        let present = self.mask.is_set(self.index);
        self.index += 1;
        if present {
            *slot = T::decode(self.reader)?;
        }
        Ok(())
    }
}

/// Encode `body` with its presence mask.
pub fn encode_body<B: PacketBody>(body: &B, writer: &mut ByteWriter) {
    let mut fields = FieldEncoder::new(B::FIELD_COUNT);
    body.write_fields(&mut fields);
    fields.finish(writer);
}

/// Decode a body, leaving absent fields at their defaults.
pub fn decode_body<B: PacketBody>(reader: &mut ByteReader<'_>) -> Result<B, CodecError> {
    let mut body = B::default();
    let mut fields = FieldDecoder::new(reader, B::FIELD_COUNT)?;
    body.read_fields(&mut fields)?;
    Ok(body)
}

macro_rules! count_fields {
    () => { 0usize };
    ($head:ident $($tail:ident)*) => { 1usize + count_fields!($($tail)*) };
}

macro_rules! packet_bodies {
    ($(
        $(#[$meta:meta])*
        $name:ident { $( $(#[$field_meta:meta])* $field:ident : $ty:ty ),* $(,)? }
    )*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Default, PartialEq)]
            pub struct $name {
                $( $(#[$field_meta])* pub $field: $ty, )*
            }

            impl PacketBody for $name {
                const FIELD_COUNT: usize = count_fields!($($field)*);

                #[allow(unused_variables)]
                fn write_fields(&self, fields: &mut FieldEncoder) {
                    $( fields.field(&self.$field); )*
                }

                #[allow(unused_variables)]
                fn read_fields(&mut self, fields: &mut FieldDecoder<'_, '_>) -> Result<(), CodecError> {
                    $( fields.field(&mut self.$field)?; )*
                    Ok(())
                }
            }
        )*
    };
}

packet_bodies! {
    /// Server to clients: a new entity exists.
    Spawn {
        prefab_id: PrefabId,
        network_id: NetworkId,
        owner_id: ClientId,
        owner_has_authority: bool,
        position: Vec3,
        rotation: Quat,
        scale: Vec3,
    }

    /// Server to clients: an entity is gone for good.
    Despawn {
        network_id: NetworkId,
    }

    OwnershipChange {
        network_id: NetworkId,
        client_id: ClientId,
    }

    AuthorityChange {
        network_id: NetworkId,
        has_authority: bool,
    }

    /// State of one behaviour slot, full or dynamic depending on who produced it.
    BehaviourSync {
        network_id: NetworkId,
        behaviour_id: BehaviourId,
        timestamp: Timestamp,
        payload: Vec<u8>,
    }

    /// Server to client method invocation.
    ClientRpc {
        network_id: NetworkId,
        behaviour_id: BehaviourId,
        method_id: MethodId,
        payload: Vec<u8>,
    }

    /// Client to server method invocation. Only honored from the entity's owner.
    ServerRpc {
        network_id: NetworkId,
        behaviour_id: BehaviourId,
        method_id: MethodId,
        payload: Vec<u8>,
    }

    /// First packet a client sends after the stream opens.
    Connect {
        udp_endpoint: Option<SocketAddr>,
        public_key: PublicKey,
    }

    /// Server reply to `Connect`.
    ServerInfo {
        client_id: ClientId,
        server_public_key: PublicKey,
    }

    Ping {
        sequence: u32,
        sent_at: Timestamp,
    }

    Pong {
        sequence: u32,
        sent_at: Timestamp,
    }

    /// A serialized packet sealed to the recipient's public key.
    Encrypted {
        sealed: Vec<u8>,
    }
}

macro_rules! packet_kinds {
    ($($variant:ident),* $(,)?) => {
        /// Every packet this protocol speaks.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Packet {
            $( $variant($variant), )*
        }

        /// Discriminant of [`Packet`], used as the registry key.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum PacketKind {
            $( $variant, )*
        }

        impl PacketKind {
            /// All kinds in canonical registration order.
            pub const ALL: &'static [PacketKind] = &[$( PacketKind::$variant, )*];
        }

        impl Packet {
            pub fn kind(&self) -> PacketKind {
                match self {
                    $( Packet::$variant(_) => PacketKind::$variant, )*
                }
            }

            pub(crate) fn encode_body(&self, writer: &mut ByteWriter) {
                match self {
                    $( Packet::$variant(body) => encode_body(body, writer), )*
                }
            }

            pub(crate) fn decode_body(
                kind: PacketKind,
                reader: &mut ByteReader<'_>,
            ) -> Result<Packet, CodecError> {
                match kind {
                    $( PacketKind::$variant => decode_body::<$variant>(reader).map(Packet::$variant), )*
                }
            }
        }

        $(
            impl From<$variant> for Packet {
                fn from(body: $variant) -> Self {
                    Packet::$variant(body)
                }
            }
        )*
    };
}

packet_kinds! {
    Spawn,
    Despawn,
    OwnershipChange,
    AuthorityChange,
    BehaviourSync,
    ClientRpc,
    ServerRpc,
    Connect,
    ServerInfo,
    Ping,
    Pong,
    Encrypted,
}
