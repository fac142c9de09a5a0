//! Delta-sync engine: stamps, outbound collection and gated apply.

use tether_net::codec::CodecError;
use tether_net::packet::BehaviourSync;
use tether_net::{Channel, ClientId, Timestamp};
use tracing::{debug, warn};

use crate::directory::Directory;
use crate::stats::ReplicationStats;

/// Hands out strictly increasing sync stamps.
///
/// Stamps follow wall-clock microseconds but never repeat or go backwards,
/// even when two ticks land in the same microsecond.
#[derive(Debug, Default)]
pub struct SyncClock {
    last: Option<Timestamp>,
}

impl SyncClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> Timestamp {
        let now = Timestamp::now();
        let stamp = match self.last {
            Some(last) if now <= last => Timestamp(last.as_micros().saturating_add(1)),
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }
}

/// Result of applying one `behaviour_sync`.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Applied,
    /// Not strictly newer than the slot's last applied stamp. Expected on the
    /// unreliable channel.
    Stale { last_update: Timestamp },
    UnknownEntity,
    UnknownBehaviour,
    Malformed(CodecError),
}

/// A sync ready to hand to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSync {
    pub channel: Channel,
    pub packet: BehaviourSync,
}

/// Dynamic syncs for every spawned entity `local` is authoritative for.
pub fn collect_dynamic(
    directory: &mut Directory,
    local: ClientId,
    timestamp: Timestamp,
) -> Vec<OutboundSync> {
    let mut out = Vec::new();
    for entity in directory.iter_mut() {
        if !entity.is_spawned() || !entity.is_authoritative(local) {
            continue;
        }
        out.extend(
            entity
                .dynamic_syncs(timestamp)
                .into_iter()
                .map(|(channel, packet)| OutboundSync { channel, packet }),
        );
    }
    out
}

/// Route a received sync to its slot and apply it, counting the outcome.
pub fn apply(
    directory: &mut Directory,
    sync: &BehaviourSync,
    stats: &ReplicationStats,
) -> SyncOutcome {
    let outcome = match directory.get_mut(sync.network_id) {
        Some(entity) => entity.apply_sync(sync.behaviour_id, sync.timestamp, &sync.payload),
        None => SyncOutcome::UnknownEntity,
    };

    match &outcome {
        SyncOutcome::Applied => stats.applied_sync(),
        SyncOutcome::Stale { .. } => stats.stale_sync(),
        SyncOutcome::UnknownEntity | SyncOutcome::UnknownBehaviour => {
            stats.sync_routing_miss();
            debug!(
                network_id = %sync.network_id,
                behaviour_id = %sync.behaviour_id,
                ?outcome,
                "Sync routing miss"
            );
        }
        SyncOutcome::Malformed(e) => {
            stats.malformed_sync();
            warn!(
                network_id = %sync.network_id,
                behaviour_id = %sync.behaviour_id,
                error = %e,
                "Malformed sync payload dropped"
            );
        }
    }
    outcome
}
