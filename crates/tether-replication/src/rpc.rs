//! Entity-scoped remote procedure calls.
//!
//! Each behaviour type declares two method tables, one per direction. Method ids
//! are the registration index within a table, so tables must be built in the
//! same order on every process. Arguments are encoded back to back with the
//! field codec and no presence mask.
//!
//! A handler receives its arguments already decoded. The table decodes them
//! and checks that no bytes are left over before the handler runs, so a
//! malformed call never has side effects.
//!
//! ```ignore
//! static DOOR_RPCS: LazyLock<RpcTable<Door>> = LazyLock::new(|| {
//!     RpcTable::<Door>::new()
//!         .server("open", |door, open: bool, ctx| {
//!             door.open = open;
//!             door.opened_by = ctx.sender;
//!         })
//!         .client("slam", |door, _: (), _| door.slammed = true)
//! });
//! ```

use glam::{Quat, Vec3};
use tether_net::codec::{ByteReader, CodecError, Decode};
use tether_net::packet::{ClientRpc, ServerRpc};
use tether_net::{BehaviourId, ClientId, MethodId, NetworkId};
use tracing::{debug, trace, warn};

use crate::directory::Directory;
use crate::error::RpcError;
use crate::stats::ReplicationStats;

/// Direction of a call, which also selects the method table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcKind {
    /// Sent by the server, runs on clients.
    Client,
    /// Sent by a client, runs on the server. Only the entity's owner may call it.
    Server,
}

/// Who called, and on what.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcContext {
    pub sender: ClientId,
    pub network_id: NetworkId,
    pub behaviour_id: BehaviourId,
}

/// Sequential reader over encoded arguments.
pub struct ArgReader<'a> {
    reader: ByteReader<'a>,
}

impl<'a> ArgReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            reader: ByteReader::new(bytes),
        }
    }

    /// Decode the next argument.
    pub fn arg<T: Decode>(&mut self) -> Result<T, RpcError> {
        Ok(self.reader.read()?)
    }

    /// Fail if bytes remain after the last argument.
    pub fn finish(&self) -> Result<(), RpcError> {
        if self.reader.is_empty() {
            Ok(())
        } else {
            Err(CodecError::InvalidValue("trailing rpc argument bytes").into())
        }
    }
}

/// Arguments a method decodes in full before it runs.
pub trait RpcArgs: Sized {
    fn decode_args(args: &mut ArgReader<'_>) -> Result<Self, RpcError>;
}

impl RpcArgs for () {
    fn decode_args(_: &mut ArgReader<'_>) -> Result<Self, RpcError> {
        Ok(())
    }
}

impl<T: Decode> RpcArgs for Vec<T> {
    fn decode_args(args: &mut ArgReader<'_>) -> Result<Self, RpcError> {
        args.arg()
    }
}

macro_rules! single_arg {
    ($($ty:ty),* $(,)?) => {
        $(
            impl RpcArgs for $ty {
                fn decode_args(args: &mut ArgReader<'_>) -> Result<Self, RpcError> {
                    args.arg()
                }
            }
        )*
    };
}

single_arg!(
    bool, char, u8, i8, u16, i16, u32, i32, u64, i64, f32, f64, String, Vec3, Quat, ClientId,
    NetworkId,
);

macro_rules! tuple_args {
    ($($name:ident),+) => {
        impl<$($name: Decode),+> RpcArgs for ($($name,)+) {
            fn decode_args(args: &mut ArgReader<'_>) -> Result<Self, RpcError> {
                Ok(($(args.arg::<$name>()?,)+))
            }
        }
    };
}

tuple_args!(A);
tuple_args!(A, B);
tuple_args!(A, B, C);
tuple_args!(A, B, C, D);

/// A registered method with its argument decoding erased.
pub type RpcHandler<B> =
    Box<dyn Fn(&mut B, &mut ArgReader<'_>, &RpcContext) -> Result<(), RpcError> + Send + Sync>;

fn erase<B, A, F>(handler: F) -> RpcHandler<B>
where
    B: 'static,
    A: RpcArgs + 'static,
    F: Fn(&mut B, A, &RpcContext) + Send + Sync + 'static,
{
    Box::new(
        move |target: &mut B, args: &mut ArgReader<'_>, ctx: &RpcContext| {
            let decoded = A::decode_args(args)?;
            args.finish()?;
            handler(target, decoded, ctx);
            Ok(())
        },
    )
}

/// Client and server method tables for behaviour type `B`.
pub struct RpcTable<B> {
    client: Vec<(&'static str, RpcHandler<B>)>,
    server: Vec<(&'static str, RpcHandler<B>)>,
}

impl<B> Default for RpcTable<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> RpcTable<B> {
    pub fn new() -> Self {
        Self {
            client: Vec::new(),
            server: Vec::new(),
        }
    }
}

impl<B: 'static> RpcTable<B> {
    /// Register the next client-invocable method.
    pub fn client<A, F>(mut self, name: &'static str, handler: F) -> Self
    where
        A: RpcArgs + 'static,
        F: Fn(&mut B, A, &RpcContext) + Send + Sync + 'static,
    {
        self.client.push((name, erase(handler)));
        self
    }

    /// Register the next server-invocable method.
    pub fn server<A, F>(mut self, name: &'static str, handler: F) -> Self
    where
        A: RpcArgs + 'static,
        F: Fn(&mut B, A, &RpcContext) + Send + Sync + 'static,
    {
        self.server.push((name, erase(handler)));
        self
    }
}

impl<B> RpcTable<B> {

    fn methods(&self, kind: RpcKind) -> &[(&'static str, RpcHandler<B>)] {
        match kind {
            RpcKind::Client => &self.client,
            RpcKind::Server => &self.server,
        }
    }

    pub fn method_id(&self, kind: RpcKind, name: &str) -> Option<MethodId> {
        self.methods(kind)
            .iter()
            .position(|(method, _)| *method == name)
            .map(|index| MethodId(index as u32))
    }

    pub fn method_name(&self, kind: RpcKind, method_id: MethodId) -> Option<&'static str> {
        self.methods(kind)
            .get(method_id.0 as usize)
            .map(|(name, _)| *name)
    }

    pub fn len(&self, kind: RpcKind) -> usize {
        self.methods(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        self.client.is_empty() && self.server.is_empty()
    }

    /// Decode arguments and run the method. Fails without touching `target`
    /// unless every argument byte is consumed.
    pub fn invoke(
        &self,
        kind: RpcKind,
        method_id: MethodId,
        target: &mut B,
        args: &mut ArgReader<'_>,
        ctx: &RpcContext,
    ) -> Result<(), RpcError> {
        let (_, handler) = self
            .methods(kind)
            .get(method_id.0 as usize)
            .ok_or(RpcError::UnknownMethod(method_id))?;
        handler(target, args, ctx)
    }
}

/// An invocation as it arrived off the wire.
#[derive(Debug, Clone, Copy)]
pub struct RpcCall<'a> {
    pub kind: RpcKind,
    pub sender: ClientId,
    pub network_id: NetworkId,
    pub behaviour_id: BehaviourId,
    pub method_id: MethodId,
    pub args: &'a [u8],
}

impl<'a> RpcCall<'a> {
    pub fn from_server_rpc(sender: ClientId, rpc: &'a ServerRpc) -> Self {
        Self {
            kind: RpcKind::Server,
            sender,
            network_id: rpc.network_id,
            behaviour_id: rpc.behaviour_id,
            method_id: rpc.method_id,
            args: &rpc.payload,
        }
    }

    pub fn from_client_rpc(rpc: &'a ClientRpc) -> Self {
        Self {
            kind: RpcKind::Client,
            sender: ClientId::SERVER,
            network_id: rpc.network_id,
            behaviour_id: rpc.behaviour_id,
            method_id: rpc.method_id,
            args: &rpc.payload,
        }
    }
}

/// What happened to an incoming call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcOutcome {
    Invoked,
    /// Server-bound call from a client that does not own the entity.
    Unauthorized { owner: ClientId },
    UnknownEntity,
    UnknownBehaviour,
    UnknownMethod,
    MalformedArgs(CodecError),
}

/// Route a call to its entity, behaviour and method.
///
/// Unauthorized calls are dropped before any argument is decoded, and are
/// counted apart from routing misses.
pub fn dispatch(
    directory: &mut Directory,
    call: RpcCall<'_>,
    stats: &ReplicationStats,
) -> RpcOutcome {
    let outcome = route(directory, &call);
    match &outcome {
        RpcOutcome::Invoked => {
            stats.rpc_invoked();
            trace!(
                network_id = %call.network_id,
                behaviour_id = %call.behaviour_id,
                method_id = %call.method_id,
                "Rpc invoked"
            );
        }
        RpcOutcome::Unauthorized { owner } => {
            stats.unauthorized_rpc();
            warn!(
                sender = %call.sender,
                %owner,
                network_id = %call.network_id,
                method_id = %call.method_id,
                "Unauthorized rpc dropped: sender does not own entity"
            );
        }
        RpcOutcome::UnknownEntity | RpcOutcome::UnknownBehaviour | RpcOutcome::UnknownMethod => {
            stats.rpc_routing_miss();
            debug!(
                sender = %call.sender,
                network_id = %call.network_id,
                behaviour_id = %call.behaviour_id,
                method_id = %call.method_id,
                ?outcome,
                "Rpc routing miss"
            );
        }
        RpcOutcome::MalformedArgs(e) => {
            stats.malformed_rpc();
            warn!(
                sender = %call.sender,
                network_id = %call.network_id,
                method_id = %call.method_id,
                error = %e,
                "Malformed rpc arguments"
            );
        }
    }
    outcome
}

fn route(directory: &mut Directory, call: &RpcCall<'_>) -> RpcOutcome {
    let Some(entity) = directory.get_mut(call.network_id) else {
        return RpcOutcome::UnknownEntity;
    };
    if call.kind == RpcKind::Server && entity.owner_id() != call.sender {
        return RpcOutcome::Unauthorized {
            owner: entity.owner_id(),
        };
    }
    let Some(slot) = entity.slot_mut(call.behaviour_id) else {
        return RpcOutcome::UnknownBehaviour;
    };

    let ctx = RpcContext {
        sender: call.sender,
        network_id: call.network_id,
        behaviour_id: call.behaviour_id,
    };
    let mut args = ArgReader::new(call.args);
    match slot
        .behaviour_mut()
        .invoke_rpc(call.kind, call.method_id, &mut args, &ctx)
    {
        Ok(()) => RpcOutcome::Invoked,
        Err(RpcError::UnknownMethod(_)) => RpcOutcome::UnknownMethod,
        Err(RpcError::MalformedArgs(e)) => RpcOutcome::MalformedArgs(e),
    }
}
