//! Replication directory: the table of live entities in one process.
//!
//! The server directory allocates network ids from a counter that never goes
//! back, so a despawned id is never handed out again in the same session. A
//! mirror directory (client side) only accepts entities under ids the server
//! chose.
//!
//! Ownership and authority are independent, with one coupling: authority can
//! only be held by a client owner. Setting the owner back to the server revokes
//! authority, and granting authority to a server-owned entity is rejected.

use std::collections::BTreeMap;

use tether_net::{ClientId, NetworkId};

use crate::entity::{Entity, EntityState};
use crate::error::ReplicationError;

/// Which side of the session a directory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Mirror,
}

/// Result of an ownership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipUpdate {
    pub old_owner: ClientId,
    pub new_owner: ClientId,
    /// Authority was dropped because the entity went back to the server.
    pub authority_revoked: bool,
}

impl OwnershipUpdate {
    pub fn changed(&self) -> bool {
        self.old_owner != self.new_owner
    }
}

/// Live entities keyed by network id.
#[derive(Debug)]
pub struct Directory {
    role: Role,
    entities: BTreeMap<NetworkId, Entity>,
    /// Wider than a network id so the counter can pass `u32::MAX`.
    next_id: u64,
}

impl Directory {
    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    pub fn mirror() -> Self {
        Self::new(Role::Mirror)
    }

    fn new(role: Role) -> Self {
        Self {
            role,
            entities: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Spawn `entity` under a freshly allocated network id. Server only.
    pub fn spawn(
        &mut self,
        mut entity: Entity,
        owner: ClientId,
        authority: bool,
    ) -> Result<NetworkId, ReplicationError> {
        if self.role != Role::Server {
            return Err(ReplicationError::NotServer("spawn entities"));
        }
        match entity.state() {
            EntityState::Unspawned => {}
            EntityState::Spawned => {
                return Err(ReplicationError::AlreadySpawned(entity.network_id()));
            }
            EntityState::Despawned => {
                return Err(ReplicationError::Despawned(entity.network_id()));
            }
        }

        let raw = u32::try_from(self.next_id).map_err(|_| ReplicationError::IdsExhausted)?;
        let network_id = NetworkId(raw);
        if authority && owner.is_server() {
            return Err(ReplicationError::AuthorityWithoutOwner(network_id));
        }
        self.next_id += 1;

        entity.mark_spawned(network_id, owner, authority);
        self.entities.insert(network_id, entity);
        Ok(network_id)
    }

    /// Insert a mirror of an entity spawned elsewhere under `network_id`.
    ///
    /// On a server directory the id counter is moved past `network_id`.
    pub fn insert_mirror(
        &mut self,
        network_id: NetworkId,
        mut entity: Entity,
        owner: ClientId,
        authority: bool,
    ) -> Result<(), ReplicationError> {
        if self.entities.contains_key(&network_id) {
            return Err(ReplicationError::AlreadySpawned(network_id));
        }
        if self.role == Role::Server {
            self.next_id = self.next_id.max(u64::from(network_id.0) + 1);
        }
        entity.mark_spawned(network_id, owner, authority);
        self.entities.insert(network_id, entity);
        Ok(())
    }

    /// Remove a live entity. The returned record is in the despawned state.
    pub fn despawn(&mut self, network_id: NetworkId) -> Result<Entity, ReplicationError> {
        let mut entity = self
            .entities
            .remove(&network_id)
            .ok_or(ReplicationError::NotSpawned(network_id))?;
        entity.mark_despawned();
        Ok(entity)
    }

    /// Remove every entity, in network id order.
    pub fn drain(&mut self) -> Vec<Entity> {
        std::mem::take(&mut self.entities)
            .into_values()
            .map(|mut entity| {
                entity.mark_despawned();
                entity
            })
            .collect()
    }

    pub fn set_owner(
        &mut self,
        network_id: NetworkId,
        owner: ClientId,
    ) -> Result<OwnershipUpdate, ReplicationError> {
        let entity = self.live_mut(network_id)?;
        let old_owner = entity.replace_owner(owner);
        let authority_revoked = owner.is_server() && entity.replace_authority(false);
        Ok(OwnershipUpdate {
            old_owner,
            new_owner: owner,
            authority_revoked,
        })
    }

    /// Set the authority flag. Returns the previous value.
    pub fn set_authority(
        &mut self,
        network_id: NetworkId,
        authority: bool,
    ) -> Result<bool, ReplicationError> {
        let entity = self.live_mut(network_id)?;
        if authority && entity.owner_id().is_server() {
            return Err(ReplicationError::AuthorityWithoutOwner(network_id));
        }
        Ok(entity.replace_authority(authority))
    }

    /// Ids of every entity owned by `client`.
    pub fn owned_by(&self, client: ClientId) -> Vec<NetworkId> {
        self.entities
            .values()
            .filter(|entity| entity.owner_id() == client)
            .map(Entity::network_id)
            .collect()
    }

    pub fn get(&self, network_id: NetworkId) -> Option<&Entity> {
        self.entities.get(&network_id)
    }

    pub fn get_mut(&mut self, network_id: NetworkId) -> Option<&mut Entity> {
        self.entities.get_mut(&network_id)
    }

    pub fn contains(&self, network_id: NetworkId) -> bool {
        self.entities.contains_key(&network_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.entities.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn live_mut(&mut self, network_id: NetworkId) -> Result<&mut Entity, ReplicationError> {
        self.entities
            .get_mut(&network_id)
            .ok_or(ReplicationError::NotSpawned(network_id))
    }
}
