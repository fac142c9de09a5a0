//! Application-facing seams: prefab factories and lifecycle notifications.

use std::collections::HashMap;
use std::fmt;

use tether_net::{ClientId, PrefabId};

use crate::entity::Entity;
use crate::error::ReplicationError;
use crate::transform::Transform;

/// Lifecycle notifications raised by a session. All methods default to no-ops.
pub trait ReplicationHooks: Send {
    /// An entity became live locally (spawned on the server, mirrored on a client).
    fn on_spawned(&mut self, _entity: &Entity) {}

    /// An entity was removed. The record is already in its despawned state.
    fn on_despawned(&mut self, _entity: &Entity) {}

    fn on_ownership_changed(&mut self, _entity: &Entity, _old: ClientId, _new: ClientId) {}

    fn on_authority_changed(&mut self, _entity: &Entity, _old: bool, _new: bool) {}
}

/// Hooks that ignore every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ReplicationHooks for NoHooks {}

type Factory = Box<dyn Fn(&mut Entity) + Send + Sync>;

/// Builds entities from prefab ids.
///
/// A factory attaches behaviours to a blank entity. Server and clients must
/// register the same factories so behaviour ids line up.
#[derive(Default)]
pub struct PrefabRegistry {
    factories: HashMap<PrefabId, Factory>,
}

impl PrefabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `prefab_id`.
    pub fn register<F>(&mut self, prefab_id: PrefabId, factory: F) -> &mut Self
    where
        F: Fn(&mut Entity) + Send + Sync + 'static,
    {
        self.factories.insert(prefab_id, Box::new(factory));
        self
    }

    pub fn contains(&self, prefab_id: PrefabId) -> bool {
        self.factories.contains_key(&prefab_id)
    }

    /// Build an unspawned entity of `prefab_id` at `transform`.
    pub fn instantiate(
        &self,
        prefab_id: PrefabId,
        transform: Transform,
    ) -> Result<Entity, ReplicationError> {
        let factory = self
            .factories
            .get(&prefab_id)
            .ok_or(ReplicationError::UnknownPrefab(prefab_id))?;
        let mut entity = Entity::new(prefab_id, transform);
        factory(&mut entity);
        Ok(entity)
    }
}

impl fmt::Debug for PrefabRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.factories.keys().copied().collect();
        ids.sort();
        f.debug_struct("PrefabRegistry").field("prefabs", &ids).finish()
    }
}
