//! Object replication over `tether-net`: a server-side directory of networked
//! entities, client mirrors, timestamp-gated delta sync and owner-checked RPCs.

pub mod behaviour;
pub mod client;
pub mod directory;
pub mod entity;
pub mod error;
pub mod hooks;
pub mod rpc;
pub mod server;
pub mod stats;
pub mod sync;
pub mod transform;

pub use behaviour::{Behaviour, DirtyFields, SyncReader, SyncWriter};
pub use client::{ClientSession, ClientSessionConfig};
pub use directory::{Directory, OwnershipUpdate, Role};
pub use entity::{BehaviourSlot, Entity, EntityState};
pub use error::{ReplicationError, RpcError};
pub use hooks::{NoHooks, PrefabRegistry, ReplicationHooks};
pub use rpc::{
    ArgReader, RpcArgs, RpcCall, RpcContext, RpcHandler, RpcKind, RpcOutcome, RpcTable,
};
pub use server::ServerSession;
pub use stats::{ReplicationSnapshot, ReplicationStats};
pub use sync::{OutboundSync, SyncClock, SyncOutcome};
pub use transform::{Transform, TransformSync};
