//! The sync adapter contract every replicated behaviour implements, plus the
//! dirty-field bitmask helpers adapters build their payloads with.
//!
//! A behaviour payload uses the same presence-mask layout as packet bodies but
//! over the behaviour's own field list:
//!
//! ```text
//! +-----------------------------------+-----------------------------------+
//! | mask: ceil(sync fields / 8) bytes | fields whose bit is set, in order |
//! +-----------------------------------+-----------------------------------+
//! ```
//!
//! A full encoding sets every bit. A dynamic encoding sets only the bits of
//! fields dirtied since the previous dynamic encode.

use std::any::Any;

use tether_net::codec::{ByteReader, ByteWriter, CodecError, Decode, Encode, PresenceMask};
use tether_net::{Channel, ClientId, MethodId};

use crate::error::RpcError;
use crate::rpc::{ArgReader, RpcContext, RpcKind};
use crate::transform::Transform;

/// A replicated sub-component of an entity.
///
/// Field order is fixed by the implementation and must be identical on every
/// process. Sync methods receive the owning entity's [`Transform`].
pub trait Behaviour: Send + Sync + 'static {
    /// Type name used in logs.
    fn name(&self) -> &'static str;

    /// Ordered names of the replicated fields.
    fn sync_fields(&self) -> &'static [&'static str];

    /// Channel dynamic syncs ride on.
    fn sync_channel(&self) -> Channel {
        Channel::Reliable
    }

    /// Whether any field changed since the last dynamic encode. Called once per
    /// tick on the side that is authoritative for the entity.
    fn has_changed(&mut self, transform: &Transform) -> bool;

    /// Every field, unconditionally. Does not touch dirty state.
    fn encode_full(&self, transform: &Transform, writer: &mut ByteWriter);

    /// Only the dirty fields, then clears the dirty set.
    fn encode_dynamic(&mut self, transform: &Transform, writer: &mut ByteWriter);

    /// Apply a full or dynamic payload.
    fn apply(
        &mut self,
        transform: &mut Transform,
        reader: &mut ByteReader<'_>,
    ) -> Result<(), CodecError>;

    /// Invoke a method from this behaviour's client or server table.
    fn invoke_rpc(
        &mut self,
        kind: RpcKind,
        method_id: MethodId,
        args: &mut ArgReader<'_>,
        ctx: &RpcContext,
    ) -> Result<(), RpcError> {
        let _ = (kind, args, ctx);
        Err(RpcError::UnknownMethod(method_id))
    }

    fn on_ownership_changed(&mut self, _old: ClientId, _new: ClientId) {}

    fn on_authority_changed(&mut self, _old: bool, _new: bool) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Fields dirtied since the last dynamic encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyFields {
    mask: PresenceMask,
    field_count: usize,
}

impl DirtyFields {
    pub fn new(field_count: usize) -> Self {
        Self {
            mask: PresenceMask::new(field_count),
            field_count,
        }
    }

    pub fn mark(&mut self, index: usize) {
        self.mask.set(index);
    }

    pub fn is_dirty(&self, index: usize) -> bool {
        self.mask.is_set(index)
    }

    pub fn any(&self) -> bool {
        !self.mask.is_empty()
    }

    pub fn clear(&mut self) {
        self.mask = PresenceMask::new(self.field_count);
    }

    pub fn field_count(&self) -> usize {
        self.field_count
    }
}

/// Builds a behaviour payload field by field, in declaration order.
pub struct SyncWriter {
    mask: PresenceMask,
    selected: Option<PresenceMask>,
    data: ByteWriter,
    index: usize,
}

impl SyncWriter {
    /// Writer that includes every field.
    pub fn full(field_count: usize) -> Self {
        Self {
            mask: PresenceMask::new(field_count),
            selected: None,
            data: ByteWriter::new(),
            index: 0,
        }
    }

    /// Writer that includes only the fields marked in `dirty`.
    pub fn dynamic(dirty: &DirtyFields) -> Self {
        Self {
            mask: PresenceMask::new(dirty.field_count),
            selected: Some(dirty.mask.clone()),
            data: ByteWriter::new(),
            index: 0,
        }
    }

    /// Offer the next field. It is written if this writer selects it.
    pub fn field<T: Encode + ?Sized>(&mut self, value: &T) -> &mut Self {
        let include = self
            .selected
            .as_ref()
            .is_none_or(|selected| selected.is_set(self.index));
        if include {
            self.mask.set(self.index);
            value.encode(&mut self.data);
        }
        self.index += 1;
        self
    }

    pub fn finish(self, writer: &mut ByteWriter) {
        self.mask.write(writer);
        writer.put_slice(self.data.as_slice());
    }
}

/// Reads a payload written by [`SyncWriter`].
pub struct SyncReader<'r, 'a> {
    mask: PresenceMask,
    reader: &'r mut ByteReader<'a>,
    index: usize,
}

impl<'r, 'a> SyncReader<'r, 'a> {
    pub fn new(reader: &'r mut ByteReader<'a>, field_count: usize) -> Result<Self, CodecError> {
        let mask = PresenceMask::read(reader, field_count)?;
        Ok(Self {
            mask,
            reader,
            index: 0,
        })
    }

    /// Next field, or `None` if the payload does not carry it.
    pub fn field<T: Decode>(&mut self) -> Result<Option<T>, CodecError> {
        let present = self.mask.is_set(self.index);
        self.index += 1;
        if present {
            self.reader.read().map(Some)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_fields_mark_and_clear() {
        let mut dirty = DirtyFields::new(12);
        assert!(!dirty.any());
        dirty.mark(9);
        assert!(dirty.is_dirty(9));
        assert!(!dirty.is_dirty(8));
        assert!(dirty.any());
        dirty.clear();
        assert!(!dirty.any());
        assert_eq!(dirty.field_count(), 12);
    }

    #[test]
    fn test_dynamic_writer_skips_clean_fields() {
        let mut dirty = DirtyFields::new(3);
        dirty.mark(1);

        let mut writer = SyncWriter::dynamic(&dirty);
        writer.field(&10u32).field(&20u32).field(&30u32);
        let mut out = ByteWriter::new();
        writer.finish(&mut out);
        assert_eq!(out.as_slice(), &[0b010, 20, 0, 0, 0]);

        let mut reader = ByteReader::new(out.as_slice());
        let mut fields = SyncReader::new(&mut reader, 3).unwrap();
        assert_eq!(fields.field::<u32>().unwrap(), None);
        assert_eq!(fields.field::<u32>().unwrap(), Some(20));
        assert_eq!(fields.field::<u32>().unwrap(), None);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_full_writer_spans_multiple_mask_bytes() {
        let mut writer = SyncWriter::full(9);
        for value in 0u8..9 {
            writer.field(&value);
        }
        let mut out = ByteWriter::new();
        writer.finish(&mut out);
        assert_eq!(&out.as_slice()[..2], &[0xFF, 0x01]);
        assert_eq!(out.len(), 2 + 9);
    }

    #[test]
    fn test_reader_rejects_missing_field_bytes() {
        let bytes = [0b001u8, 7];
        let mut reader = ByteReader::new(&bytes);
        let mut fields = SyncReader::new(&mut reader, 1).unwrap();
        assert!(matches!(
            fields.field::<u32>(),
            Err(CodecError::MalformedPayload { .. })
        ));
    }
}
