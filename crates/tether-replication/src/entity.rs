//! Replicated entities and their behaviour slots.

use std::fmt;

use tether_net::codec::{ByteReader, ByteWriter};
use tether_net::packet::{BehaviourSync, Spawn};
use tether_net::{BehaviourId, Channel, ClientId, NetworkId, PrefabId, Timestamp};
use tracing::trace;

use crate::behaviour::Behaviour;
use crate::sync::SyncOutcome;
use crate::transform::Transform;

/// Stamp for state a client drives but has not synced yet.
const EARLIEST_STAMP: Timestamp = Timestamp(i64::MIN + 1);

// ---------------------------------------------------------------------------
// EntityState
// ---------------------------------------------------------------------------

/// Lifecycle of an entity record. `Despawned` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Unspawned,
    Spawned,
    Despawned,
}

// ---------------------------------------------------------------------------
// BehaviourSlot
// ---------------------------------------------------------------------------

/// One behaviour attached to an entity, with the stamp of the newest sync applied to it.
pub struct BehaviourSlot {
    id: BehaviourId,
    last_update: Timestamp,
    behaviour: Box<dyn Behaviour>,
}

impl BehaviourSlot {
    pub fn id(&self) -> BehaviourId {
        self.id
    }

    /// Stamp of the newest applied sync, [`Timestamp::MIN`] before the first.
    pub fn last_update(&self) -> Timestamp {
        self.last_update
    }

    pub fn behaviour(&self) -> &dyn Behaviour {
        self.behaviour.as_ref()
    }

    pub fn behaviour_mut(&mut self) -> &mut dyn Behaviour {
        self.behaviour.as_mut()
    }

    /// A sync is applied only if it is strictly newer than the last one.
    pub fn should_apply(&self, timestamp: Timestamp) -> bool {
        timestamp > self.last_update
    }
}

impl fmt::Debug for BehaviourSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviourSlot")
            .field("id", &self.id)
            .field("behaviour", &self.behaviour.name())
            .field("last_update", &self.last_update)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A replicated object.
///
/// Built unspawned with its behaviours, then handed to a directory which
/// assigns the network id. Behaviour ids follow the order behaviours were added,
/// so every process must build a given prefab the same way.
#[derive(Debug)]
pub struct Entity {
    network_id: NetworkId,
    prefab_id: PrefabId,
    owner_id: ClientId,
    has_authority: bool,
    state: EntityState,
    transform: Transform,
    slots: Vec<BehaviourSlot>,
}

impl Entity {
    pub fn new(prefab_id: PrefabId, transform: Transform) -> Self {
        Self {
            network_id: NetworkId::default(),
            prefab_id,
            owner_id: ClientId::SERVER,
            has_authority: false,
            state: EntityState::Unspawned,
            transform,
            slots: Vec::new(),
        }
    }

    pub fn with_behaviour<B: Behaviour>(mut self, behaviour: B) -> Self {
        self.add_behaviour(behaviour);
        self
    }

    /// Attach a behaviour and return its slot id.
    pub fn add_behaviour<B: Behaviour>(&mut self, behaviour: B) -> BehaviourId {
        let id = BehaviourId(self.slots.len() as u32);
        self.slots.push(BehaviourSlot {
            id,
            last_update: Timestamp::MIN,
            behaviour: Box::new(behaviour),
        });
        id
    }

    pub fn network_id(&self) -> NetworkId {
        self.network_id
    }

    pub fn prefab_id(&self) -> PrefabId {
        self.prefab_id
    }

    /// Owning client; [`ClientId::SERVER`] for server-controlled entities.
    pub fn owner_id(&self) -> ClientId {
        self.owner_id
    }

    pub fn has_authority(&self) -> bool {
        self.has_authority
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn is_spawned(&self) -> bool {
        self.state == EntityState::Spawned
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn transform_mut(&mut self) -> &mut Transform {
        &mut self.transform
    }

    pub fn slots(&self) -> &[BehaviourSlot] {
        &self.slots
    }

    pub fn slot(&self, id: BehaviourId) -> Option<&BehaviourSlot> {
        self.slots.get(id.0 as usize)
    }

    pub fn slot_mut(&mut self, id: BehaviourId) -> Option<&mut BehaviourSlot> {
        self.slots.get_mut(id.0 as usize)
    }

    /// First behaviour of type `B`.
    pub fn behaviour<B: Behaviour>(&self) -> Option<&B> {
        self.slots
            .iter()
            .find_map(|slot| slot.behaviour.as_any().downcast_ref::<B>())
    }

    pub fn behaviour_mut<B: Behaviour>(&mut self) -> Option<&mut B> {
        self.slots
            .iter_mut()
            .find_map(|slot| slot.behaviour.as_any_mut().downcast_mut::<B>())
    }

    /// Whether the process identified by `local` drives this entity's state.
    ///
    /// With authority the owning client does, otherwise the server does.
    pub fn is_authoritative(&self, local: ClientId) -> bool {
        if self.has_authority {
            !self.owner_id.is_server() && self.owner_id == local
        } else {
            local.is_server()
        }
    }

    pub(crate) fn mark_spawned(&mut self, network_id: NetworkId, owner: ClientId, authority: bool) {
        self.network_id = network_id;
        self.owner_id = owner;
        self.has_authority = authority && !owner.is_server();
        self.state = EntityState::Spawned;
    }

    pub(crate) fn mark_despawned(&mut self) {
        self.state = EntityState::Despawned;
    }

    pub(crate) fn replace_owner(&mut self, owner: ClientId) -> ClientId {
        let old = std::mem::replace(&mut self.owner_id, owner);
        if old != owner {
            for slot in &mut self.slots {
                slot.behaviour.on_ownership_changed(old, owner);
            }
        }
        old
    }

    pub(crate) fn replace_authority(&mut self, authority: bool) -> bool {
        let old = std::mem::replace(&mut self.has_authority, authority);
        if old != authority {
            for slot in &mut self.slots {
                slot.behaviour.on_authority_changed(old, authority);
            }
        }
        old
    }

    pub(crate) fn spawn_packet(&self) -> Spawn {
        Spawn {
            prefab_id: self.prefab_id,
            network_id: self.network_id,
            owner_id: self.owner_id,
            owner_has_authority: self.has_authority,
            position: self.transform.position,
            rotation: self.transform.rotation,
            scale: self.transform.scale,
        }
    }

    /// Full encodings of every slot for a joining client.
    ///
    /// A slot keeps the stamp of the last sync applied to it, so later syncs
    /// relayed from the same source still compare as newer. A client-driven
    /// slot that never received one gets the earliest stamp any sync beats.
    /// Everything else is stamped `timestamp`.
    pub(crate) fn full_syncs(&self, timestamp: Timestamp) -> Vec<BehaviourSync> {
        let client_driven = self.has_authority && !self.owner_id.is_server();
        self.slots
            .iter()
            .map(|slot| {
                let mut writer = ByteWriter::new();
                slot.behaviour.encode_full(&self.transform, &mut writer);
                let stamp = if slot.last_update > Timestamp::MIN {
                    slot.last_update
                } else if client_driven {
                    EARLIEST_STAMP
                } else {
                    timestamp
                };
                BehaviourSync {
                    network_id: self.network_id,
                    behaviour_id: slot.id,
                    timestamp: stamp,
                    payload: writer.into_inner(),
                }
            })
            .collect()
    }

    /// Dynamic encodings of every slot that reports a change.
    pub(crate) fn dynamic_syncs(&mut self, timestamp: Timestamp) -> Vec<(Channel, BehaviourSync)> {
        let mut out = Vec::new();
        for slot in &mut self.slots {
            if !slot.behaviour.has_changed(&self.transform) {
                continue;
            }
            let mut writer = ByteWriter::new();
            slot.behaviour.encode_dynamic(&self.transform, &mut writer);
            out.push((
                slot.behaviour.sync_channel(),
                BehaviourSync {
                    network_id: self.network_id,
                    behaviour_id: slot.id,
                    timestamp,
                    payload: writer.into_inner(),
                },
            ));
        }
        out
    }

    /// Apply a sync payload to one slot, gated on its timestamp.
    pub(crate) fn apply_sync(
        &mut self,
        behaviour_id: BehaviourId,
        timestamp: Timestamp,
        payload: &[u8],
    ) -> SyncOutcome {
        let Some(slot) = self.slots.get_mut(behaviour_id.0 as usize) else {
            return SyncOutcome::UnknownBehaviour;
        };
        if !slot.should_apply(timestamp) {
            trace!(
                network_id = %self.network_id,
                %behaviour_id,
                timestamp = timestamp.as_micros(),
                last_update = slot.last_update.as_micros(),
                "Stale sync discarded"
            );
            return SyncOutcome::Stale {
                last_update: slot.last_update,
            };
        }

        let mut reader = ByteReader::new(payload);
        match slot.behaviour.apply(&mut self.transform, &mut reader) {
            Ok(()) => {
                slot.last_update = timestamp;
                SyncOutcome::Applied
            }
            Err(e) => SyncOutcome::Malformed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::TransformSync;
    use glam::Vec3;

    fn transform_payload(position: Vec3) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        TransformSync::new().encode_full(&Transform::from_position(position), &mut writer);
        writer.into_inner()
    }

    fn spawned() -> Entity {
        let mut entity = Entity::new(PrefabId(2), Transform::default())
            .with_behaviour(TransformSync::new());
        entity.mark_spawned(NetworkId(1), ClientId::SERVER, false);
        entity
    }

    #[test]
    fn test_behaviour_ids_follow_registration_order() {
        let mut entity = Entity::new(PrefabId(1), Transform::default());
        assert_eq!(entity.add_behaviour(TransformSync::new()), BehaviourId(0));
        assert_eq!(entity.add_behaviour(TransformSync::new()), BehaviourId(1));
        assert_eq!(entity.slots().len(), 2);
        assert!(entity.behaviour::<TransformSync>().is_some());
        assert_eq!(entity.slot(BehaviourId(1)).unwrap().last_update(), Timestamp::MIN);
    }

    #[test]
    fn test_full_syncs_keep_the_applied_stamp() {
        let mut entity = spawned();
        assert_eq!(entity.full_syncs(Timestamp(500))[0].timestamp, Timestamp(500));

        entity.replace_owner(ClientId(3));
        entity.replace_authority(true);
        assert_eq!(entity.full_syncs(Timestamp(500))[0].timestamp, EARLIEST_STAMP);

        let payload = transform_payload(Vec3::ONE);
        entity.apply_sync(BehaviourId(0), Timestamp(40), &payload);
        assert_eq!(entity.full_syncs(Timestamp(500))[0].timestamp, Timestamp(40));
    }

    #[test]
    fn test_staleness_gate_is_strict() {
        let mut entity = spawned();
        let first = transform_payload(Vec3::new(1.0, 0.0, 0.0));
        let older = transform_payload(Vec3::new(9.0, 9.0, 9.0));

        assert_eq!(
            entity.apply_sync(BehaviourId(0), Timestamp(100), &first),
            SyncOutcome::Applied
        );
        assert_eq!(entity.transform().position, Vec3::new(1.0, 0.0, 0.0));

        for stamp in [Timestamp(100), Timestamp(99)] {
            assert_eq!(
                entity.apply_sync(BehaviourId(0), stamp, &older),
                SyncOutcome::Stale {
                    last_update: Timestamp(100)
                }
            );
        }
        assert_eq!(entity.transform().position, Vec3::new(1.0, 0.0, 0.0));

        assert_eq!(
            entity.apply_sync(BehaviourId(0), Timestamp(101), &older),
            SyncOutcome::Applied
        );
        assert_eq!(entity.transform().position, Vec3::splat(9.0));
        assert_eq!(entity.slot(BehaviourId(0)).unwrap().last_update(), Timestamp(101));
    }

    #[test]
    fn test_malformed_sync_does_not_advance_stamp() {
        let mut entity = spawned();
        let outcome = entity.apply_sync(BehaviourId(0), Timestamp(5), &[0b001, 1, 2]);
        assert!(matches!(outcome, SyncOutcome::Malformed(_)));
        assert_eq!(entity.slot(BehaviourId(0)).unwrap().last_update(), Timestamp::MIN);
    }

    #[test]
    fn test_unknown_slot() {
        let mut entity = spawned();
        assert_eq!(
            entity.apply_sync(BehaviourId(3), Timestamp(1), &[]),
            SyncOutcome::UnknownBehaviour
        );
    }

    #[test]
    fn test_authority_follows_owner() {
        let mut entity = spawned();
        assert!(entity.is_authoritative(ClientId::SERVER));
        assert!(!entity.is_authoritative(ClientId(3)));

        entity.replace_owner(ClientId(3));
        entity.replace_authority(true);
        assert!(entity.is_authoritative(ClientId(3)));
        assert!(!entity.is_authoritative(ClientId::SERVER));
        assert!(!entity.is_authoritative(ClientId(4)));
    }

    #[test]
    fn test_dynamic_syncs_only_for_changed_slots() {
        let mut entity = spawned();
        assert_eq!(entity.dynamic_syncs(Timestamp(1)).len(), 1);
        assert!(entity.dynamic_syncs(Timestamp(2)).is_empty());

        entity.transform_mut().position.x = 4.0;
        let syncs = entity.dynamic_syncs(Timestamp(3));
        assert_eq!(syncs.len(), 1);
        assert_eq!(syncs[0].0, Channel::Unreliable);
        assert_eq!(syncs[0].1.timestamp, Timestamp(3));
    }
}
