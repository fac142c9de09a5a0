//! Errors returned by replication operations.

use tether_net::{MethodId, NetworkId, PrefabId, TransportError};
use tether_net::codec::CodecError;

/// Errors returned by directory and session operations.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// The entity (or its network id) is already live in this directory.
    #[error("entity {0} is already spawned")]
    AlreadySpawned(NetworkId),

    /// The entity was despawned; despawn is terminal.
    #[error("entity {0} was despawned and cannot be spawned again")]
    Despawned(NetworkId),

    /// No live entity carries this network id.
    #[error("no spawned entity with network id {0}")]
    NotSpawned(NetworkId),

    /// A server-only transition was attempted on a client mirror.
    #[error("only the server may {0}")]
    NotServer(&'static str),

    /// Authority was granted while the entity is still server-owned.
    #[error("entity {0} has no client owner, authority cannot be granted")]
    AuthorityWithoutOwner(NetworkId),

    /// Every network id has been issued once already.
    #[error("network ids exhausted")]
    IdsExhausted,

    /// No factory is registered for this prefab.
    #[error("unknown prefab {0}")]
    UnknownPrefab(PrefabId),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised while invoking a remote procedure on a behaviour.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The behaviour has no method with this id in the addressed table.
    #[error("unknown method {0}")]
    UnknownMethod(MethodId),

    /// The argument bytes did not decode into the method's parameters.
    #[error("malformed rpc arguments: {0}")]
    MalformedArgs(#[from] CodecError),
}
