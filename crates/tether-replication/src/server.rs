//! Server session: the authoritative directory driven by transport events.
//!
//! All directory mutation happens on the task that owns the session, either
//! through the spawn/despawn/ownership calls or inside [`ServerSession::tick`],
//! which drains every pending transport event and then flushes dynamic syncs.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tether_net::packet::{
    AuthorityChange, BehaviourSync, ClientRpc, Despawn, OwnershipChange, Pong, ServerInfo,
};
use tether_net::{
    BehaviourId, Channel, ClientId, DisconnectReason, MethodId, NetworkId, Packet, PacketRegistry,
    PrefabId, ServerConfig, ServerEvent, ServerTransport,
};
use tracing::{debug, info, trace, warn};

use crate::directory::{Directory, OwnershipUpdate};
use crate::entity::Entity;
use crate::error::ReplicationError;
use crate::hooks::{NoHooks, PrefabRegistry, ReplicationHooks};
use crate::rpc::{self, RpcCall};
use crate::stats::{ReplicationSnapshot, ReplicationStats};
use crate::sync::{self, OutboundSync, SyncClock, SyncOutcome};
use crate::transform::Transform;

/// The authoritative side of a replication session.
pub struct ServerSession<H: ReplicationHooks = NoHooks> {
    transport: ServerTransport,
    directory: Directory,
    prefabs: PrefabRegistry,
    hooks: H,
    clock: SyncClock,
    stats: ReplicationStats,
    clients: BTreeSet<ClientId>,
}

impl ServerSession<NoHooks> {
    pub async fn bind_default(
        config: ServerConfig,
        prefabs: PrefabRegistry,
    ) -> Result<Self, ReplicationError> {
        Self::bind(config, prefabs, NoHooks).await
    }
}

impl<H: ReplicationHooks> ServerSession<H> {
    /// Open the transport with the standard packet registry.
    pub async fn bind(
        config: ServerConfig,
        prefabs: PrefabRegistry,
        hooks: H,
    ) -> Result<Self, ReplicationError> {
        let transport = ServerTransport::bind(config, Arc::new(PacketRegistry::standard())).await?;
        Ok(Self {
            transport,
            directory: Directory::server(),
            prefabs,
            hooks,
            clock: SyncClock::new(),
            stats: ReplicationStats::default(),
            clients: BTreeSet::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn transport(&self) -> &ServerTransport {
        &self.transport
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn entity(&self, network_id: NetworkId) -> Option<&Entity> {
        self.directory.get(network_id)
    }

    /// Mutable access for game logic. Changes go out on the next tick.
    pub fn entity_mut(&mut self, network_id: NetworkId) -> Option<&mut Entity> {
        self.directory.get_mut(network_id)
    }

    pub fn prefabs(&self) -> &PrefabRegistry {
        &self.prefabs
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// Clients that completed the handshake.
    pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients.iter().copied()
    }

    pub fn stats(&self) -> ReplicationSnapshot {
        self.stats
            .snapshot(self.transport.stats().malformed_datagrams)
    }

    /// Spawn `entity` and announce it with its full state.
    pub async fn spawn(
        &mut self,
        entity: Entity,
        owner: ClientId,
        authority: bool,
    ) -> Result<NetworkId, ReplicationError> {
        let network_id = self.directory.spawn(entity, owner, authority)?;
        let stamp = self.clock.next();

        let entity = self
            .directory
            .get(network_id)
            .ok_or(ReplicationError::NotSpawned(network_id))?;
        self.hooks.on_spawned(entity);
        info!(
            %network_id,
            prefab_id = %entity.prefab_id(),
            %owner,
            authority = entity.has_authority(),
            "Entity spawned"
        );

        let mut packets = vec![Packet::Spawn(entity.spawn_packet())];
        packets.extend(entity.full_syncs(stamp).into_iter().map(Packet::BehaviourSync));
        for packet in &packets {
            self.transport.broadcast(packet, None).await;
        }
        Ok(network_id)
    }

    /// Build `prefab_id` through the prefab registry and spawn it.
    pub async fn spawn_prefab(
        &mut self,
        prefab_id: PrefabId,
        transform: Transform,
        owner: ClientId,
        authority: bool,
    ) -> Result<NetworkId, ReplicationError> {
        let entity = self.prefabs.instantiate(prefab_id, transform)?;
        self.spawn(entity, owner, authority).await
    }

    /// Remove a live entity everywhere. Returns the despawned record.
    pub async fn despawn(&mut self, network_id: NetworkId) -> Result<Entity, ReplicationError> {
        let entity = self.directory.despawn(network_id)?;
        self.hooks.on_despawned(&entity);
        info!(%network_id, "Entity despawned");
        self.transport
            .broadcast(&Packet::Despawn(Despawn { network_id }), None)
            .await;
        Ok(entity)
    }

    /// Assign `owner` to an entity. Returning it to the server also revokes authority.
    pub async fn set_owner(
        &mut self,
        network_id: NetworkId,
        owner: ClientId,
    ) -> Result<(), ReplicationError> {
        let update = self.directory.set_owner(network_id, owner)?;
        self.publish_ownership(network_id, update).await;
        Ok(())
    }

    /// Grant or revoke the owner's authority.
    pub async fn set_authority(
        &mut self,
        network_id: NetworkId,
        authority: bool,
    ) -> Result<(), ReplicationError> {
        let old = self.directory.set_authority(network_id, authority)?;
        if old == authority {
            return Ok(());
        }
        if let Some(entity) = self.directory.get(network_id) {
            self.hooks.on_authority_changed(entity, old, authority);
        }
        debug!(%network_id, authority, "Authority changed");
        self.transport
            .broadcast(
                &Packet::AuthorityChange(AuthorityChange {
                    network_id,
                    has_authority: authority,
                }),
                None,
            )
            .await;
        Ok(())
    }

    /// Invoke a client method on one client, or on every client when `target` is `None`.
    pub async fn call_client_rpc(
        &mut self,
        target: Option<ClientId>,
        network_id: NetworkId,
        behaviour_id: BehaviourId,
        method_id: MethodId,
        args: Vec<u8>,
    ) -> Result<(), ReplicationError> {
        if !self.directory.contains(network_id) {
            return Err(ReplicationError::NotSpawned(network_id));
        }
        let packet = Packet::ClientRpc(ClientRpc {
            network_id,
            behaviour_id,
            method_id,
            payload: args,
        });
        match target {
            Some(client_id) => self.transport.send(client_id, &packet).await?,
            None => self.transport.broadcast(&packet, None).await,
        }
        Ok(())
    }

    /// Close one client's connection. Cleanup runs when its disconnect event is drained.
    pub async fn kick(&mut self, client_id: ClientId) {
        self.transport.disconnect(client_id).await;
    }

    pub fn shutdown(&mut self) {
        info!("Server session shutting down");
        self.transport.shutdown();
    }

    /// Drain pending transport events, then send dynamic syncs for everything
    /// the server is authoritative for. Returns the number of events handled.
    pub async fn tick(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.transport.try_next_event() {
            self.handle_event(event).await;
            handled += 1;
        }
        self.flush_syncs().await;
        handled
    }

    async fn flush_syncs(&mut self) {
        if self.directory.is_empty() {
            return;
        }
        let stamp = self.clock.next();
        let outbound = sync::collect_dynamic(&mut self.directory, ClientId::SERVER, stamp);
        for OutboundSync { channel, packet } in outbound {
            send_to_all(&self.transport, channel, &Packet::BehaviourSync(packet), None).await;
        }
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { client_id, addr } => {
                debug!(%client_id, %addr, "Connection accepted, awaiting connect");
            }
            ServerEvent::Packet {
                client_id,
                channel,
                packet,
            } => self.handle_packet(client_id, channel, packet).await,
            ServerEvent::Disconnected { client_id, reason } => {
                self.handle_disconnect(client_id, reason).await;
            }
        }
    }

    async fn handle_packet(&mut self, client_id: ClientId, channel: Channel, packet: Packet) {
        if let Packet::Connect(_) = packet {
            self.complete_handshake(client_id).await;
            return;
        }
        if !self.clients.contains(&client_id) {
            debug!(%client_id, kind = ?packet.kind(), "Packet before handshake dropped");
            return;
        }

        match packet {
            Packet::Ping(ping) => {
                let pong = Packet::Pong(Pong {
                    sequence: ping.sequence,
                    sent_at: ping.sent_at,
                });
                let result = match channel {
                    Channel::Reliable => self.transport.send(client_id, &pong).await,
                    Channel::Unreliable => self.transport.send_unreliable(client_id, &pong).await,
                };
                if let Err(e) = result {
                    debug!(%client_id, error = %e, "Pong not sent");
                }
            }
            Packet::ServerRpc(call) => {
                rpc::dispatch(
                    &mut self.directory,
                    RpcCall::from_server_rpc(client_id, &call),
                    &self.stats,
                );
            }
            Packet::BehaviourSync(sync) => self.accept_owner_sync(client_id, channel, sync).await,
            Packet::Pong(_) => trace!(%client_id, "Unsolicited pong ignored"),
            other => {
                self.stats.unauthorized_mutation();
                warn!(%client_id, kind = ?other.kind(), "Server-only packet from client dropped");
            }
        }
    }

    async fn complete_handshake(&mut self, client_id: ClientId) {
        if self.clients.contains(&client_id) {
            debug!(%client_id, "Duplicate connect ignored");
            return;
        }

        let stamp = self.clock.next();
        let mut preamble = vec![Packet::ServerInfo(ServerInfo {
            client_id,
            server_public_key: self.transport.public_key(),
        })];
        for entity in self.directory.iter() {
            preamble.push(Packet::Spawn(entity.spawn_packet()));
            preamble.extend(entity.full_syncs(stamp).into_iter().map(Packet::BehaviourSync));
        }

        match self.transport.accept_handshake(client_id, &preamble).await {
            Ok(()) => {
                self.clients.insert(client_id);
                info!(%client_id, entities = self.directory.len(), "Client joined");
            }
            Err(e) => warn!(%client_id, error = %e, "Handshake failed"),
        }
    }

    /// Accept a sync from the entity's owner if it holds authority, then relay it.
    async fn accept_owner_sync(&mut self, sender: ClientId, channel: Channel, sync: BehaviourSync) {
        let Some(entity) = self.directory.get(sync.network_id) else {
            self.stats.sync_routing_miss();
            debug!(%sender, network_id = %sync.network_id, "Sync for unknown entity");
            return;
        };
        if entity.owner_id() != sender || !entity.has_authority() {
            self.stats.unauthorized_mutation();
            warn!(
                %sender,
                owner = %entity.owner_id(),
                authority = entity.has_authority(),
                network_id = %sync.network_id,
                "Unauthorized sync dropped: sender lacks authority"
            );
            return;
        }

        if sync::apply(&mut self.directory, &sync, &self.stats) == SyncOutcome::Applied {
            send_to_all(
                &self.transport,
                channel,
                &Packet::BehaviourSync(sync),
                Some(sender),
            )
            .await;
        }
    }

    async fn handle_disconnect(&mut self, client_id: ClientId, reason: DisconnectReason) {
        self.clients.remove(&client_id);
        let owned = self.directory.owned_by(client_id);
        info!(%client_id, %reason, owned = owned.len(), "Client left");

        for network_id in owned {
            match self.directory.set_owner(network_id, ClientId::SERVER) {
                Ok(update) => self.publish_ownership(network_id, update).await,
                Err(e) => debug!(%network_id, error = %e, "Ownership cleanup skipped"),
            }
        }
    }

    async fn publish_ownership(&mut self, network_id: NetworkId, update: OwnershipUpdate) {
        if let Some(entity) = self.directory.get(network_id) {
            if update.changed() {
                self.hooks
                    .on_ownership_changed(entity, update.old_owner, update.new_owner);
            }
            if update.authority_revoked {
                self.hooks.on_authority_changed(entity, true, false);
            }
        }

        if update.changed() {
            debug!(%network_id, old = %update.old_owner, new = %update.new_owner, "Ownership changed");
            self.transport
                .broadcast(
                    &Packet::OwnershipChange(OwnershipChange {
                        network_id,
                        client_id: update.new_owner,
                    }),
                    None,
                )
                .await;
        }
        if update.authority_revoked {
            self.transport
                .broadcast(
                    &Packet::AuthorityChange(AuthorityChange {
                        network_id,
                        has_authority: false,
                    }),
                    None,
                )
                .await;
        }
    }
}

async fn send_to_all(
    transport: &ServerTransport,
    channel: Channel,
    packet: &Packet,
    except: Option<ClientId>,
) {
    match channel {
        Channel::Reliable => transport.broadcast(packet, except).await,
        Channel::Unreliable => transport.broadcast_unreliable(packet, except).await,
    }
}
