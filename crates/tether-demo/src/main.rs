//! Headless tether node.
//!
//! `tether-demo serve` hosts a session and orbits one entity around the origin.
//! `tether-demo join` connects to a server and logs where its mirrors are.
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags,
//! e.g. `cargo run -p tether-demo -- --port 9000 --log-level debug serve`.

use std::f32::consts::TAU;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use glam::{Quat, Vec3};
use tether_config::{CliArgs, Config, NetworkConfig, default_config_dir};
use tether_net::{ClientConfig, ClientId, FrameConfig, PrefabId, ServerConfig};
use tether_replication::{
    ClientSession, ClientSessionConfig, Entity, PrefabRegistry, ReplicationError,
    ReplicationHooks, ServerSession, Transform, TransformSync,
};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{error, info};

const ORBITER: PrefabId = PrefabId(1);
const ORBIT_RADIUS: f32 = 5.0;
/// Seconds per revolution.
const ORBIT_PERIOD: f32 = 8.0;
const REPORT_EVERY: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "tether-demo", about = "Tether replication demo node")]
struct DemoArgs {
    #[command(subcommand)]
    mode: Mode,

    #[command(flatten)]
    overrides: CliArgs,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Host a session and orbit a demo entity.
    Serve,
    /// Join a session and log mirrored positions.
    Join,
}

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error("could not resolve server address {0}: {1}")]
    Resolve(String, #[source] std::io::Error),

    #[error("server address {0} resolved to nothing")]
    NoAddress(String),
}

/// Logs entity lifecycle events as they happen.
struct LogHooks;

impl ReplicationHooks for LogHooks {
    fn on_spawned(&mut self, entity: &Entity) {
        info!(
            network_id = %entity.network_id(),
            prefab_id = %entity.prefab_id(),
            owner = %entity.owner_id(),
            "Entity live"
        );
    }

    fn on_despawned(&mut self, entity: &Entity) {
        info!(network_id = %entity.network_id(), "Entity gone");
    }

    fn on_ownership_changed(&mut self, entity: &Entity, old: ClientId, new: ClientId) {
        info!(network_id = %entity.network_id(), %old, %new, "Owner changed");
    }
}

fn prefabs() -> PrefabRegistry {
    let mut prefabs = PrefabRegistry::new();
    prefabs.register(ORBITER, |entity| {
        entity.add_behaviour(TransformSync::new());
    });
    prefabs
}

fn server_config(network: &NetworkConfig) -> ServerConfig {
    ServerConfig {
        bind_addr: SocketAddr::from(([0, 0, 0, 0], network.server_port)),
        max_connections: network.max_connections as usize,
        handshake_timeout: Duration::from_millis(network.handshake_timeout_ms),
        pending_queue_cap: network.pending_queue_cap,
        outbound_queue_cap: network.outbound_queue_cap,
        encrypt_reliable: network.encrypt_reliable,
        frame: FrameConfig {
            max_payload_size: network.max_frame_size,
        },
        ..Default::default()
    }
}

fn client_config(network: &NetworkConfig, server_addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        server_addr,
        pending_queue_cap: network.pending_queue_cap,
        encrypt_reliable: network.encrypt_reliable,
        frame: FrameConfig {
            max_payload_size: network.max_frame_size,
        },
        ..Default::default()
    }
}

fn tick_period(tick_rate: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(tick_rate.max(1)))
}

/// Position on a horizontal circle, facing along the direction of travel.
fn orbit(elapsed: f32) -> Transform {
    let angle = elapsed / ORBIT_PERIOD * TAU;
    Transform {
        position: Vec3::new(angle.cos(), 0.0, angle.sin()) * ORBIT_RADIUS,
        rotation: Quat::from_rotation_y(-angle),
        scale: Vec3::ONE,
    }
}

async fn resolve(network: &NetworkConfig) -> Result<SocketAddr, DemoError> {
    let host = network.server_address.as_str();
    tokio::net::lookup_host((host, network.server_port))
        .await
        .map_err(|e| DemoError::Resolve(host.to_string(), e))?
        .next()
        .ok_or_else(|| DemoError::NoAddress(host.to_string()))
}

async fn serve(config: &Config) -> Result<(), DemoError> {
    let mut session = ServerSession::bind(server_config(&config.network), prefabs(), LogHooks).await?;
    info!(addr = %session.local_addr(), tick_rate = config.network.tick_rate, "Serving");

    let orbiter = session
        .spawn_prefab(ORBITER, orbit(0.0), ClientId::SERVER, false)
        .await?;

    let period = tick_period(config.network.tick_rate);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let started = Instant::now();
    let mut last_report = Instant::now();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => break,
        }

        if let Some(entity) = session.entity_mut(orbiter) {
            *entity.transform_mut() = orbit(started.elapsed().as_secs_f32());
        }
        session.tick().await;

        if last_report.elapsed() >= REPORT_EVERY {
            last_report = Instant::now();
            let stats = session.stats();
            info!(
                clients = session.clients().count(),
                applied_syncs = stats.applied_syncs,
                unauthorized_rpcs = stats.unauthorized_rpcs,
                unauthorized_mutations = stats.unauthorized_mutations,
                malformed_datagrams = stats.malformed_datagrams,
                "Server status"
            );
        }
    }

    info!("Shutting down");
    session.despawn(orbiter).await?;
    session.tick().await;
    session.shutdown();
    Ok(())
}

async fn join(config: &Config) -> Result<(), DemoError> {
    let server_addr = resolve(&config.network).await?;
    let session_config = ClientSessionConfig {
        transport: client_config(&config.network, server_addr),
        ..Default::default()
    };
    let mut session = ClientSession::connect(session_config, prefabs(), LogHooks).await?;
    info!(%server_addr, "Connecting");

    let mut ticker = interval(tick_period(config.network.tick_rate));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut last_report = Instant::now();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => {
                info!("Leaving");
                session.disconnect().await;
                return Ok(());
            }
        }

        session.tick().await;
        if session.is_closed() {
            info!("Server closed the connection");
            return Ok(());
        }

        if session.is_connected() && last_report.elapsed() >= REPORT_EVERY {
            last_report = Instant::now();
            for entity in session.directory().iter() {
                info!(
                    network_id = %entity.network_id(),
                    position = ?entity.transform().position,
                    "Mirror"
                );
            }
            info!(
                client_id = ?session.client_id(),
                rtt = ?session.average_rtt(),
                loss = session.loss_rate(),
                stale_syncs = session.stats().stale_syncs,
                "Client status"
            );
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = DemoArgs::parse();

    let config_dir = args
        .overrides
        .config
        .clone()
        .unwrap_or_else(default_config_dir);

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args.overrides);

    let log_dir = config
        .debug
        .log_dir
        .clone()
        .unwrap_or_else(|| config_dir.join("logs"));
    tether_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let result = match args.mode {
        Mode::Serve => serve(&config).await,
        Mode::Join => join(&config).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Node stopped");
            ExitCode::FAILURE
        }
    }
}
