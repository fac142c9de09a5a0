//! Packet kind to wire id mapping.
//!
//! Ids are dense and zero-based, assigned in registration order. Every process in
//! a session must register the same kinds in the same order; the protocol only
//! detects a mismatch when an id has no kind at all.
//!
//! ```text
//! +------------------+----------------------------+
//! | kind id (u32 LE) | packet body (mask, fields) |
//! +------------------+----------------------------+
//! ```

use std::collections::HashMap;

use crate::codec::{ByteReader, ByteWriter, CodecError};
use crate::packet::{Packet, PacketKind};

#[derive(Debug, Clone)]
pub struct PacketRegistry {
    ids: HashMap<PacketKind, u32>,
    kinds: Vec<PacketKind>,
}

impl PacketRegistry {
    /// An empty registry. Most callers want [`PacketRegistry::standard`].
    pub fn new() -> Self {
        Self {
            ids: HashMap::new(),
            kinds: Vec::new(),
        }
    }

    /// Registry holding every kind in [`PacketKind::ALL`] order.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for kind in PacketKind::ALL {
            registry.register(*kind);
        }
        registry
    }

    /// Assign the next id to `kind`. Registering a kind twice keeps its first id.
    pub fn register(&mut self, kind: PacketKind) -> u32 {
        if let Some(id) = self.ids.get(&kind) {
            return *id;
        }
        let id = self.kinds.len() as u32;
        self.ids.insert(kind, id);
        self.kinds.push(kind);
        id
    }

    pub fn id_of(&self, kind: PacketKind) -> Option<u32> {
        self.ids.get(&kind).copied()
    }

    pub fn kind_of(&self, id: u32) -> Option<PacketKind> {
        self.kinds.get(id as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// `id ++ body`.
    pub fn serialize(&self, packet: &Packet) -> Result<Vec<u8>, CodecError> {
        let kind = packet.kind();
        let id = self
            .id_of(kind)
            .ok_or(CodecError::UnregisteredPacketKind(kind))?;
        let mut writer = ByteWriter::with_capacity(32);
        writer.write(&id);
        packet.encode_body(&mut writer);
        Ok(writer.into_inner())
    }

    /// Inverse of [`serialize`](Self::serialize). The body must span the rest of `bytes`.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Packet, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let id: u32 = reader.read()?;
        let kind = self.kind_of(id).ok_or(CodecError::UnknownPacketKind(id))?;
        let packet = Packet::decode_body(kind, &mut reader)?;
        if !reader.is_empty() {
            return Err(CodecError::InvalidValue("trailing bytes after packet body"));
        }
        Ok(packet)
    }
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
