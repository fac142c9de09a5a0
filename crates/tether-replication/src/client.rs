//! Client session: a mirror directory fed by the server.
//!
//! Until `server_info` arrives the client does not know its own id, so every
//! packet received before it is held and replayed in arrival order afterwards.
//! When the reliable channel closes every mirror is despawned locally.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tether_net::packet::{AuthorityChange, OwnershipChange, Ping, ServerRpc, Spawn};
use tether_net::{
    BehaviourId, Channel, ClientConfig, ClientEvent, ClientId, ClientTransport, ConnectionState,
    DiagnosticsConfig, DiagnosticsTracker, MethodId, NetworkId, Packet, PacketRegistry, Timestamp,
};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::directory::Directory;
use crate::entity::Entity;
use crate::error::ReplicationError;
use crate::hooks::{NoHooks, PrefabRegistry, ReplicationHooks};
use crate::rpc::{self, RpcCall};
use crate::stats::{ReplicationSnapshot, ReplicationStats};
use crate::sync::{self, OutboundSync, SyncClock};
use crate::transform::Transform;

/// Configuration for [`ClientSession`].
#[derive(Debug, Clone)]
pub struct ClientSessionConfig {
    pub transport: ClientConfig,
    /// The process also runs the server; replication packets are ignored. Default: false.
    pub host: bool,
    /// Interval between pings on the datagram channel. Default: 1s.
    pub ping_interval: Duration,
    pub diagnostics: DiagnosticsConfig,
    /// Packets held while waiting for `server_info`. Default: 4096.
    pub max_held_packets: usize,
}

impl Default for ClientSessionConfig {
    fn default() -> Self {
        Self {
            transport: ClientConfig::default(),
            host: false,
            ping_interval: Duration::from_secs(1),
            diagnostics: DiagnosticsConfig::default(),
            max_held_packets: 4096,
        }
    }
}

/// The client side of a replication session.
pub struct ClientSession<H: ReplicationHooks = NoHooks> {
    transport: ClientTransport,
    directory: Directory,
    prefabs: PrefabRegistry,
    hooks: H,
    clock: SyncClock,
    stats: ReplicationStats,
    diagnostics: DiagnosticsTracker,
    client_id: Option<ClientId>,
    held: VecDeque<(Channel, Packet)>,
    max_held: usize,
    host: bool,
    closed: bool,
    ping_interval: Duration,
    last_ping: Option<Instant>,
}

impl ClientSession<NoHooks> {
    pub async fn connect_default(
        config: ClientSessionConfig,
        prefabs: PrefabRegistry,
    ) -> Result<Self, ReplicationError> {
        Self::connect(config, prefabs, NoHooks).await
    }
}

impl<H: ReplicationHooks> ClientSession<H> {
    /// Connect to the server and start the handshake.
    pub async fn connect(
        config: ClientSessionConfig,
        prefabs: PrefabRegistry,
        hooks: H,
    ) -> Result<Self, ReplicationError> {
        let transport =
            ClientTransport::connect(config.transport, Arc::new(PacketRegistry::standard()))
                .await?;
        Ok(Self {
            transport,
            directory: Directory::mirror(),
            prefabs,
            hooks,
            clock: SyncClock::new(),
            stats: ReplicationStats::default(),
            diagnostics: DiagnosticsTracker::new(config.diagnostics),
            client_id: None,
            held: VecDeque::new(),
            max_held: config.max_held_packets,
            host: config.host,
            closed: false,
            ping_interval: config.ping_interval,
            last_ping: None,
        })
    }

    /// Id assigned by the server, once the handshake completed.
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        !self.closed && self.transport.state().current() == ConnectionState::Connected
    }

    /// The connection ended and every mirror was despawned.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_host(&self) -> bool {
        self.host
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn entity(&self, network_id: NetworkId) -> Option<&Entity> {
        self.directory.get(network_id)
    }

    /// Mutable access for entities this client drives. Changes go out on the next tick.
    pub fn entity_mut(&mut self, network_id: NetworkId) -> Option<&mut Entity> {
        self.directory.get_mut(network_id)
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn stats(&self) -> ReplicationSnapshot {
        self.stats
            .snapshot(self.transport.stats().malformed_datagrams)
    }

    pub fn average_rtt(&self) -> Option<Duration> {
        self.diagnostics.average_rtt()
    }

    pub fn loss_rate(&self) -> f64 {
        self.diagnostics.loss_rate()
    }

    /// Invoke a server method on an entity this client owns.
    pub async fn call_server_rpc(
        &mut self,
        network_id: NetworkId,
        behaviour_id: BehaviourId,
        method_id: MethodId,
        args: Vec<u8>,
    ) -> Result<(), ReplicationError> {
        if !self.host && !self.directory.contains(network_id) {
            return Err(ReplicationError::NotSpawned(network_id));
        }
        let packet = Packet::ServerRpc(ServerRpc {
            network_id,
            behaviour_id,
            method_id,
            payload: args,
        });
        self.transport.send(&packet).await?;
        Ok(())
    }

    /// Close the connection and despawn every mirror.
    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
        self.teardown();
    }

    /// Drain transport events, then send dynamic syncs for owned entities and
    /// a ping when one is due. Returns the number of events handled.
    pub async fn tick(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.transport.try_next_event() {
            self.handle_event(event);
            handled += 1;
        }
        if self.is_connected() {
            self.flush_syncs().await;
            self.maybe_ping().await;
        }
        handled
    }

    async fn flush_syncs(&mut self) {
        let Some(local) = self.client_id else {
            return;
        };
        if self.directory.is_empty() {
            return;
        }
        let stamp = self.clock.next();
        for OutboundSync { channel, packet } in
            sync::collect_dynamic(&mut self.directory, local, stamp)
        {
            let packet = Packet::BehaviourSync(packet);
            let result = match channel {
                Channel::Reliable => self.transport.send(&packet).await,
                Channel::Unreliable => self.transport.send_unreliable(&packet).await,
            };
            if let Err(e) = result {
                debug!(error = %e, "Owner sync not sent");
            }
        }
    }

    async fn maybe_ping(&mut self) {
        let due = self
            .last_ping
            .is_none_or(|last| last.elapsed() >= self.ping_interval);
        if !due {
            return;
        }
        self.diagnostics.expire_pending();
        self.last_ping = Some(Instant::now());
        let sequence = self.diagnostics.on_ping_sent();
        let ping = Packet::Ping(Ping {
            sequence,
            sent_at: Timestamp::now(),
        });
        if let Err(e) = self.transport.send_unreliable(&ping).await {
            debug!(error = %e, "Ping not sent");
        }
    }

    fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Packet { channel, packet } => {
                if self.client_id.is_some() {
                    self.handle_packet(channel, packet);
                } else if let Packet::ServerInfo(info) = packet {
                    self.client_id = Some(info.client_id);
                    info!(client_id = %info.client_id, held = self.held.len(), "Joined server");
                    while let Some((channel, packet)) = self.held.pop_front() {
                        self.handle_packet(channel, packet);
                    }
                } else if self.held.len() < self.max_held {
                    self.held.push_back((channel, packet));
                } else {
                    warn!(cap = self.max_held, "Hold-back queue full, packet dropped");
                }
            }
            ClientEvent::Disconnected { reason } => {
                info!(%reason, "Connection to server closed");
                self.teardown();
            }
        }
    }

    fn handle_packet(&mut self, channel: Channel, packet: Packet) {
        let replication = matches!(
            packet,
            Packet::Spawn(_)
                | Packet::Despawn(_)
                | Packet::OwnershipChange(_)
                | Packet::AuthorityChange(_)
                | Packet::BehaviourSync(_)
        );
        if self.host && replication {
            trace!(kind = ?packet.kind(), "Host mode, replication packet ignored");
            return;
        }

        match packet {
            Packet::Spawn(spawn) => self.materialize(spawn),
            Packet::Despawn(despawn) => match self.directory.despawn(despawn.network_id) {
                Ok(entity) => {
                    debug!(network_id = %despawn.network_id, "Mirror despawned");
                    self.hooks.on_despawned(&entity);
                }
                Err(e) => debug!(error = %e, "Despawn for unknown entity"),
            },
            Packet::OwnershipChange(change) => self.apply_ownership(change),
            Packet::AuthorityChange(change) => self.apply_authority(change),
            Packet::BehaviourSync(sync) => {
                sync::apply(&mut self.directory, &sync, &self.stats);
            }
            Packet::ClientRpc(call) => {
                rpc::dispatch(
                    &mut self.directory,
                    RpcCall::from_client_rpc(&call),
                    &self.stats,
                );
            }
            Packet::Pong(pong) => self.diagnostics.on_pong_received(pong.sequence),
            Packet::ServerInfo(_) => debug!("Duplicate server_info ignored"),
            other => debug!(kind = ?other.kind(), ?channel, "Unexpected packet from server"),
        }
    }

    fn materialize(&mut self, spawn: Spawn) {
        let network_id = spawn.network_id;
        if self.directory.contains(network_id) {
            debug!(%network_id, "Duplicate spawn ignored");
            return;
        }
        let transform = Transform {
            position: spawn.position,
            rotation: spawn.rotation,
            scale: spawn.scale,
        };
        let entity = match self.prefabs.instantiate(spawn.prefab_id, transform) {
            Ok(entity) => entity,
            Err(e) => {
                warn!(%network_id, error = %e, "Spawn dropped");
                return;
            }
        };
        if let Err(e) = self.directory.insert_mirror(
            network_id,
            entity,
            spawn.owner_id,
            spawn.owner_has_authority,
        ) {
            debug!(%network_id, error = %e, "Spawn dropped");
            return;
        }
        if let Some(entity) = self.directory.get(network_id) {
            debug!(%network_id, prefab_id = %spawn.prefab_id, owner = %spawn.owner_id, "Mirror spawned");
            self.hooks.on_spawned(entity);
        }
    }

    fn apply_ownership(&mut self, change: OwnershipChange) {
        let update = match self.directory.set_owner(change.network_id, change.client_id) {
            Ok(update) => update,
            Err(e) => {
                debug!(error = %e, "Ownership change for unknown entity");
                return;
            }
        };
        if let Some(entity) = self.directory.get(change.network_id) {
            if update.changed() {
                self.hooks
                    .on_ownership_changed(entity, update.old_owner, update.new_owner);
            }
            if update.authority_revoked {
                self.hooks.on_authority_changed(entity, true, false);
            }
        }
    }

    fn apply_authority(&mut self, change: AuthorityChange) {
        match self
            .directory
            .set_authority(change.network_id, change.has_authority)
        {
            Ok(old) if old != change.has_authority => {
                if let Some(entity) = self.directory.get(change.network_id) {
                    self.hooks
                        .on_authority_changed(entity, old, change.has_authority);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Authority change rejected"),
        }
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.held.clear();
        let mirrors = self.directory.drain();
        info!(mirrors = mirrors.len(), "Client session closed");
        for entity in &mirrors {
            self.hooks.on_despawned(entity);
        }
    }
}
