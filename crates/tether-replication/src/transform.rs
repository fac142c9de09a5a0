//! Entity transform and the built-in behaviour that replicates it.

use std::any::Any;

use glam::{Quat, Vec3};
use tether_net::Channel;
use tether_net::codec::{ByteReader, ByteWriter, CodecError};

use crate::behaviour::{Behaviour, DirtyFields, SyncReader, SyncWriter};

/// Position, rotation and scale of an entity.
///
/// Engine-managed: every behaviour sees the owning entity's transform while
/// encoding and applying state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }
}

const POSITION: usize = 0;
const ROTATION: usize = 1;
const SCALE: usize = 2;
const FIELDS: &[&str] = &["position", "rotation", "scale"];

/// Replicates the entity transform over the unreliable channel.
///
/// Changes are detected by comparing against the last transform handed to
/// [`Behaviour::encode_dynamic`]; a fresh instance reports every field dirty.
#[derive(Debug)]
pub struct TransformSync {
    last_sent: Option<Transform>,
    dirty: DirtyFields,
}

impl Default for TransformSync {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformSync {
    pub fn new() -> Self {
        Self {
            last_sent: None,
            dirty: DirtyFields::new(FIELDS.len()),
        }
    }
}

impl Behaviour for TransformSync {
    fn name(&self) -> &'static str {
        "TransformSync"
    }

    fn sync_fields(&self) -> &'static [&'static str] {
        FIELDS
    }

    fn sync_channel(&self) -> Channel {
        Channel::Unreliable
    }

    fn has_changed(&mut self, transform: &Transform) -> bool {
        match self.last_sent {
            None => {
                self.dirty.mark(POSITION);
                self.dirty.mark(ROTATION);
                self.dirty.mark(SCALE);
            }
            Some(last) => {
                if last.position != transform.position {
                    self.dirty.mark(POSITION);
                }
                if last.rotation != transform.rotation {
                    self.dirty.mark(ROTATION);
                }
                if last.scale != transform.scale {
                    self.dirty.mark(SCALE);
                }
            }
        }
        self.dirty.any()
    }

    fn encode_full(&self, transform: &Transform, writer: &mut ByteWriter) {
        let mut fields = SyncWriter::full(FIELDS.len());
        fields
            .field(&transform.position)
            .field(&transform.rotation)
            .field(&transform.scale);
        fields.finish(writer);
    }

    fn encode_dynamic(&mut self, transform: &Transform, writer: &mut ByteWriter) {
        let mut fields = SyncWriter::dynamic(&self.dirty);
        fields
            .field(&transform.position)
            .field(&transform.rotation)
            .field(&transform.scale);
        fields.finish(writer);
        self.dirty.clear();
        self.last_sent = Some(*transform);
    }

    fn apply(
        &mut self,
        transform: &mut Transform,
        reader: &mut ByteReader<'_>,
    ) -> Result<(), CodecError> {
        let mut fields = SyncReader::new(reader, FIELDS.len())?;
        let position = fields.field::<Vec3>()?;
        let rotation = fields.field::<Quat>()?;
        let scale = fields.field::<Vec3>()?;

        if let Some(position) = position {
            transform.position = position;
        }
        if let Some(rotation) = rotation {
            transform.rotation = rotation;
        }
        if let Some(scale) = scale {
            transform.scale = scale;
        }
        self.last_sent = Some(*transform);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
