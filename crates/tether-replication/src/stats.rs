//! Replication counters.
//!
//! Dropped traffic is silent on the wire, so every drop class has its own
//! counter. Unauthorized drops and routing misses are kept apart.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lifetime counters for one session.
#[derive(Debug, Default)]
pub struct ReplicationStats {
    unauthorized_rpcs: AtomicU64,
    unauthorized_mutations: AtomicU64,
    rpc_routing_misses: AtomicU64,
    sync_routing_misses: AtomicU64,
    malformed_rpcs: AtomicU64,
    malformed_syncs: AtomicU64,
    stale_syncs: AtomicU64,
    applied_syncs: AtomicU64,
    rpcs_invoked: AtomicU64,
}

/// Plain copy of [`ReplicationStats`], plus the transport's malformed datagram count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationSnapshot {
    pub unauthorized_rpcs: u64,
    pub unauthorized_mutations: u64,
    pub rpc_routing_misses: u64,
    pub sync_routing_misses: u64,
    pub malformed_rpcs: u64,
    pub malformed_syncs: u64,
    pub stale_syncs: u64,
    pub applied_syncs: u64,
    pub rpcs_invoked: u64,
    pub malformed_datagrams: u64,
}

macro_rules! counters {
    ($($method:ident => $field:ident),* $(,)?) => {
        impl ReplicationStats {
            $(
                pub(crate) fn $method(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            /// Current values. `malformed_datagrams` comes from the transport.
            pub fn snapshot(&self, malformed_datagrams: u64) -> ReplicationSnapshot {
                ReplicationSnapshot {
                    $( $field: self.$field.load(Ordering::Relaxed), )*
                    malformed_datagrams,
                }
            }
        }
    };
}

counters! {
    unauthorized_rpc => unauthorized_rpcs,
    unauthorized_mutation => unauthorized_mutations,
    rpc_routing_miss => rpc_routing_misses,
    sync_routing_miss => sync_routing_misses,
    malformed_rpc => malformed_rpcs,
    malformed_sync => malformed_syncs,
    stale_sync => stale_syncs,
    applied_sync => applied_syncs,
    rpc_invoked => rpcs_invoked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_independent() {
        let stats = ReplicationStats::default();
        stats.unauthorized_rpc();
        stats.rpc_routing_miss();
        stats.rpc_routing_miss();
        stats.stale_sync();

        let snap = stats.snapshot(4);
        assert_eq!(snap.unauthorized_rpcs, 1);
        assert_eq!(snap.rpc_routing_misses, 2);
        assert_eq!(snap.stale_syncs, 1);
        assert_eq!(snap.applied_syncs, 0);
        assert_eq!(snap.malformed_datagrams, 4);
    }
}
