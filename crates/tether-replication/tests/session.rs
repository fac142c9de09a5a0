use std::any::Any;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use glam::Vec3;
use tether_net::codec::{ByteReader, ByteWriter, CodecError, to_bytes};
use tether_net::packet::BehaviourSync;
use tether_net::{
    BehaviourId, ClientConfig, ClientId, ClientTransport, MethodId, NetworkId, Packet,
    PacketRegistry, PrefabId, ServerConfig, Timestamp,
};
use tether_replication::{
    ArgReader, Behaviour, ClientSession, ClientSessionConfig, DirtyFields, Entity, NoHooks,
    PrefabRegistry, ReplicationHooks, RpcContext, RpcError, RpcKind, RpcTable, ServerSession,
    SyncReader, SyncWriter, Transform, TransformSync,
};
use tokio::time::{sleep, timeout};

const CRATE: PrefabId = PrefabId(2);
const HEALTH: BehaviourId = BehaviourId(1);

struct Health {
    hp: u32,
    last_sent: Option<u32>,
}

static HEALTH_RPCS: LazyLock<RpcTable<Health>> = LazyLock::new(|| {
    RpcTable::<Health>::new().server("damage", |health, amount: u32, _| {
        health.hp = health.hp.saturating_sub(amount);
    })
});

impl Behaviour for Health {
    fn name(&self) -> &'static str {
        "Health"
    }

    fn sync_fields(&self) -> &'static [&'static str] {
        &["hp"]
    }

    fn has_changed(&mut self, _: &Transform) -> bool {
        self.last_sent != Some(self.hp)
    }

    fn encode_full(&self, _: &Transform, writer: &mut ByteWriter) {
        let mut fields = SyncWriter::full(1);
        fields.field(&self.hp);
        fields.finish(writer);
    }

    fn encode_dynamic(&mut self, _: &Transform, writer: &mut ByteWriter) {
        let mut dirty = DirtyFields::new(1);
        dirty.mark(0);
        let mut fields = SyncWriter::dynamic(&dirty);
        fields.field(&self.hp);
        fields.finish(writer);
        self.last_sent = Some(self.hp);
    }

    fn apply(&mut self, _: &mut Transform, reader: &mut ByteReader<'_>) -> Result<(), CodecError> {
        let mut fields = SyncReader::new(reader, 1)?;
        if let Some(hp) = fields.field::<u32>()? {
            self.hp = hp;
            self.last_sent = Some(hp);
        }
        Ok(())
    }

    fn invoke_rpc(
        &mut self,
        kind: RpcKind,
        method_id: MethodId,
        args: &mut ArgReader<'_>,
        ctx: &RpcContext,
    ) -> Result<(), RpcError> {
        HEALTH_RPCS.invoke(kind, method_id, self, args, ctx)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn prefabs() -> PrefabRegistry {
    let mut prefabs = PrefabRegistry::new();
    prefabs.register(CRATE, |entity| {
        entity.add_behaviour(TransformSync::new());
        entity.add_behaviour(Health {
            hp: 100,
            last_sent: None,
        });
    });
    prefabs
}

fn health_payload(hp: u32) -> Vec<u8> {
    let mut writer = ByteWriter::new();
    Health { hp, last_sent: None }.encode_full(&Transform::default(), &mut writer);
    writer.into_inner()
}

fn hp(entity: &Entity) -> u32 {
    entity.behaviour::<Health>().map_or(0, |health| health.hp)
}

async fn server_with(prefabs: PrefabRegistry) -> ServerSession {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    };
    ServerSession::bind_default(config, prefabs).await.unwrap()
}

fn client_config(server: &ServerSession) -> ClientSessionConfig {
    ClientSessionConfig {
        transport: ClientConfig {
            server_addr: server.local_addr(),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn join(server: &ServerSession) -> ClientSession {
    ClientSession::connect_default(client_config(server), prefabs())
        .await
        .unwrap()
}

/// Tick the server and every client until `done` holds.
async fn pump<H, F>(server: &mut ServerSession, clients: &mut [&mut ClientSession<H>], mut done: F)
where
    H: ReplicationHooks,
    F: FnMut(&ServerSession, &[&mut ClientSession<H>]) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            server.tick().await;
            for client in clients.iter_mut() {
                client.tick().await;
            }
            if done(server, clients) {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[derive(Default)]
struct Recorder {
    spawned: Vec<NetworkId>,
    despawned: Vec<NetworkId>,
    authority: Vec<(NetworkId, bool)>,
}

impl ReplicationHooks for Recorder {
    fn on_spawned(&mut self, entity: &Entity) {
        self.spawned.push(entity.network_id());
    }

    fn on_despawned(&mut self, entity: &Entity) {
        self.despawned.push(entity.network_id());
    }

    fn on_authority_changed(&mut self, entity: &Entity, _old: bool, new: bool) {
        self.authority.push((entity.network_id(), new));
    }
}

#[tokio::test]
async fn test_mirror_follows_server_and_discards_stale_state() {
    let mut server = server_with(prefabs()).await;
    let id = server
        .spawn_prefab(CRATE, Transform::default(), ClientId::SERVER, false)
        .await
        .unwrap();

    let mut client = join(&server).await;
    pump(&mut server, &mut [&mut client], |_, c| c[0].entity(id).is_some()).await;

    let mirror = client.entity(id).unwrap();
    assert_eq!(mirror.prefab_id(), CRATE);
    assert_eq!(mirror.owner_id(), ClientId::SERVER);
    assert_eq!(mirror.transform().position, Vec3::ZERO);
    assert_eq!(hp(mirror), 100);

    server.entity_mut(id).unwrap().transform_mut().position = Vec3::X;
    pump(&mut server, &mut [&mut client], |_, c| {
        c[0].entity(id).unwrap().transform().position == Vec3::X
    })
    .await;

    // A full sync stamped long ago must not roll the mirror back.
    let mut payload = ByteWriter::new();
    TransformSync::new().encode_full(
        &Transform::from_position(Vec3::splat(9.0)),
        &mut payload,
    );
    let old = Packet::BehaviourSync(BehaviourSync {
        network_id: id,
        behaviour_id: BehaviourId(0),
        timestamp: Timestamp(1),
        payload: payload.into_inner(),
    });
    let stale_before = client.stats().stale_syncs;
    server.transport().broadcast(&old, None).await;
    pump(&mut server, &mut [&mut client], |_, c| {
        c[0].stats().stale_syncs > stale_before
    })
    .await;
    assert_eq!(client.entity(id).unwrap().transform().position, Vec3::X);

    server.despawn(id).await.unwrap();
    pump(&mut server, &mut [&mut client], |_, c| c[0].entity(id).is_none()).await;
}

#[tokio::test]
async fn test_server_rpc_requires_ownership() {
    let mut server = server_with(prefabs()).await;
    let mut alice = join(&server).await;
    let mut bob = join(&server).await;
    pump(&mut server, &mut [&mut alice, &mut bob], |s, _| {
        s.clients().count() == 2
    })
    .await;
    pump(&mut server, &mut [&mut alice, &mut bob], |_, c| {
        c.iter().all(|client| client.client_id().is_some())
    })
    .await;
    let bob_id = bob.client_id().unwrap();

    let id = server
        .spawn_prefab(CRATE, Transform::default(), bob_id, false)
        .await
        .unwrap();
    pump(&mut server, &mut [&mut alice, &mut bob], |_, c| {
        c.iter().all(|client| client.entity(id).is_some())
    })
    .await;

    let damage = HEALTH_RPCS.method_id(RpcKind::Server, "damage").unwrap();
    alice
        .call_server_rpc(id, HEALTH, damage, to_bytes(&30u32))
        .await
        .unwrap();
    pump(&mut server, &mut [&mut alice, &mut bob], |s, _| {
        s.stats().unauthorized_rpcs == 1
    })
    .await;
    assert_eq!(hp(server.entity(id).unwrap()), 100);
    assert_eq!(server.stats().rpcs_invoked, 0);

    bob.call_server_rpc(id, HEALTH, damage, to_bytes(&30u32))
        .await
        .unwrap();
    pump(&mut server, &mut [&mut alice, &mut bob], |s, _| {
        s.stats().rpcs_invoked == 1
    })
    .await;
    assert_eq!(hp(server.entity(id).unwrap()), 70);

    // The new value reaches both mirrors through the reliable sync.
    pump(&mut server, &mut [&mut alice, &mut bob], |_, c| {
        c.iter().all(|client| hp(client.entity(id).unwrap()) == 70)
    })
    .await;
}

#[tokio::test]
async fn test_owner_sync_is_applied_and_relayed() {
    let mut server = server_with(prefabs()).await;
    let mut alice = join(&server).await;
    let mut bob = join(&server).await;
    pump(&mut server, &mut [&mut alice, &mut bob], |s, c| {
        s.clients().count() == 2 && c.iter().all(|client| client.client_id().is_some())
    })
    .await;
    let alice_id = alice.client_id().unwrap();

    let id = server
        .spawn_prefab(CRATE, Transform::default(), alice_id, true)
        .await
        .unwrap();
    pump(&mut server, &mut [&mut alice, &mut bob], |_, c| {
        c.iter().all(|client| client.entity(id).is_some())
    })
    .await;
    let mirror = alice.entity(id).unwrap();
    assert!(mirror.has_authority());
    assert!(mirror.is_authoritative(alice_id));

    alice.entity_mut(id).unwrap().transform_mut().position = Vec3::new(0.0, 2.0, 0.0);
    pump(&mut server, &mut [&mut alice, &mut bob], |s, c| {
        s.entity(id).unwrap().transform().position.y == 2.0
            && c[1].entity(id).unwrap().transform().position.y == 2.0
    })
    .await;

    // Bob is not the owner, so his local edits stay local.
    bob.entity_mut(id).unwrap().transform_mut().position = Vec3::splat(-5.0);
    for _ in 0..10 {
        server.tick().await;
        bob.tick().await;
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(server.entity(id).unwrap().transform().position.y, 2.0);
    assert_eq!(server.stats().unauthorized_mutations, 0);
}

#[tokio::test]
async fn test_ownership_transfer_reaches_clients() {
    let mut server = server_with(prefabs()).await;
    let mut client = ClientSession::connect(client_config(&server), prefabs(), Recorder::default())
        .await
        .unwrap();
    pump(&mut server, &mut [&mut client], |s, c| {
        s.clients().count() == 1 && c[0].client_id().is_some()
    })
    .await;
    let client_id = client.client_id().unwrap();

    let id = server
        .spawn_prefab(CRATE, Transform::default(), ClientId::SERVER, false)
        .await
        .unwrap();
    pump(&mut server, &mut [&mut client], |_, c| c[0].entity(id).is_some()).await;
    assert_eq!(client.hooks().spawned, vec![id]);

    server.set_owner(id, client_id).await.unwrap();
    server.set_authority(id, true).await.unwrap();
    pump(&mut server, &mut [&mut client], |_, c| {
        c[0].entity(id).unwrap().has_authority()
    })
    .await;
    assert_eq!(client.entity(id).unwrap().owner_id(), client_id);

    server.set_owner(id, ClientId::SERVER).await.unwrap();
    pump(&mut server, &mut [&mut client], |_, c| {
        c[0].entity(id).unwrap().owner_id() == ClientId::SERVER
    })
    .await;
    pump(&mut server, &mut [&mut client], |_, c| {
        !c[0].entity(id).unwrap().has_authority()
    })
    .await;
    assert_eq!(client.hooks().authority, vec![(id, true), (id, false)]);
}

#[tokio::test]
async fn test_unknown_prefab_spawn_is_dropped() {
    let mut server_prefabs = prefabs();
    server_prefabs.register(PrefabId(5), |entity| {
        entity.add_behaviour(TransformSync::new());
    });
    let mut server = server_with(server_prefabs).await;
    let unknown = server
        .spawn_prefab(PrefabId(5), Transform::default(), ClientId::SERVER, false)
        .await
        .unwrap();
    let known = server
        .spawn_prefab(CRATE, Transform::default(), ClientId::SERVER, false)
        .await
        .unwrap();

    let mut client = join(&server).await;
    pump(&mut server, &mut [&mut client], |_, c| c[0].entity(known).is_some()).await;

    assert!(client.entity(unknown).is_none());
    assert_eq!(client.directory().len(), 1);
    assert!(client.stats().sync_routing_misses >= 1);
}

#[tokio::test]
async fn test_host_mode_ignores_replication_packets() {
    let mut server = server_with(prefabs()).await;
    server
        .spawn_prefab(CRATE, Transform::default(), ClientId::SERVER, false)
        .await
        .unwrap();

    let config = ClientSessionConfig {
        host: true,
        ..client_config(&server)
    };
    let mut client = ClientSession::connect_default(config, prefabs())
        .await
        .unwrap();
    pump(&mut server, &mut [&mut client], |_, c| c[0].client_id().is_some()).await;
    for _ in 0..10 {
        server.tick().await;
        client.tick().await;
        sleep(Duration::from_millis(5)).await;
    }

    assert!(client.is_host());
    assert!(client.directory().is_empty());
    assert_eq!(client.stats().applied_syncs, 0);
}

#[tokio::test]
async fn test_server_shutdown_despawns_mirrors() {
    let mut server = server_with(prefabs()).await;
    let id = server
        .spawn_prefab(CRATE, Transform::default(), ClientId::SERVER, false)
        .await
        .unwrap();
    let mut client = ClientSession::connect(client_config(&server), prefabs(), Recorder::default())
        .await
        .unwrap();
    pump(&mut server, &mut [&mut client], |_, c| c[0].entity(id).is_some()).await;
    assert!(client.is_connected());

    server.shutdown();
    timeout(Duration::from_secs(5), async {
        loop {
            client.tick().await;
            if !client.is_connected() && client.directory().is_empty() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("client never saw the connection close");

    assert!(client.directory().is_empty());
    assert_eq!(client.hooks().despawned, vec![id]);
}

#[tokio::test]
async fn test_late_joiner_follows_owner_with_older_clock() {
    let mut server = server_with(prefabs()).await;
    let owner = ClientTransport::connect(
        ClientConfig {
            server_addr: server.local_addr(),
            ..Default::default()
        },
        Arc::new(PacketRegistry::standard()),
    )
    .await
    .unwrap();
    pump::<NoHooks, _>(&mut server, &mut [], |s, _| s.clients().count() == 1).await;
    let owner_id = server.clients().next().unwrap();

    let id = server
        .spawn_prefab(CRATE, Transform::default(), owner_id, true)
        .await
        .unwrap();
    // The owner's clock runs far behind the server's.
    let owner_sync = |timestamp: i64, hp: u32| {
        Packet::BehaviourSync(BehaviourSync {
            network_id: id,
            behaviour_id: HEALTH,
            timestamp: Timestamp(timestamp),
            payload: health_payload(hp),
        })
    };
    owner.send(&owner_sync(1_000, 80)).await.unwrap();
    pump::<NoHooks, _>(&mut server, &mut [], |s, _| hp(s.entity(id).unwrap()) == 80).await;

    let mut late = join(&server).await;
    pump(&mut server, &mut [&mut late], |_, c| {
        c[0].entity(id).is_some_and(|entity| hp(entity) == 80)
    })
    .await;

    owner.send(&owner_sync(1_001, 60)).await.unwrap();
    pump(&mut server, &mut [&mut late], |_, c| {
        hp(c[0].entity(id).unwrap()) == 60
    })
    .await;
    assert_eq!(late.stats().stale_syncs, 0);
}
