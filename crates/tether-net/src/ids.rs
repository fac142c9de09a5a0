//! Identifier newtypes and the wire timestamp.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::{ByteReader, ByteWriter, CodecError, Decode, Encode};

macro_rules! wire_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
            pub struct $name(pub u32);

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl Encode for $name {
                fn encode(&self, writer: &mut ByteWriter) {
                    self.0.encode(writer);
                }
            }

            impl Decode for $name {
                fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
                    reader.read().map(Self)
                }
            }
        )*
    };
}

wire_id! {
    /// Identifies a connection. `0` is the server, clients count up from `1`.
    ClientId,
    /// Identifies a spawned entity for the lifetime of a server session.
    NetworkId,
    /// Selects the template a receiver materializes for a spawned entity.
    PrefabId,
    /// Index of a behaviour slot within its entity, in registration order.
    BehaviourId,
    /// Index of an RPC method within a behaviour's method table.
    MethodId,
}

impl ClientId {
    pub const SERVER: ClientId = ClientId(0);

    pub fn is_server(self) -> bool {
        self == Self::SERVER
    }
}

/// Microseconds since the UNIX epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Earlier than any timestamp a clock can produce.
    pub const MIN: Timestamp = Timestamp(i64::MIN);

    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as i64)
            .unwrap_or(0);
        Self(micros)
    }

    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }
}

impl Encode for Timestamp {
    fn encode(&self, writer: &mut ByteWriter) {
        self.0.encode(writer);
    }
}

impl Decode for Timestamp {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        reader.read().map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{from_bytes, to_bytes};

    #[test]
    fn test_ids_encode_as_u32() {
        assert_eq!(to_bytes(&NetworkId(258)), vec![2, 1, 0, 0]);
        assert_eq!(from_bytes::<ClientId>(&[7, 0, 0, 0]).unwrap(), ClientId(7));
    }

    #[test]
    fn test_server_client_id() {
        assert!(ClientId::SERVER.is_server());
        assert!(!ClientId(1).is_server());
    }

    #[test]
    fn test_timestamp_ordering() {
        let now = Timestamp::now();
        assert!(Timestamp::MIN < now);
        assert!(Timestamp::from_micros(5) > Timestamp::from_micros(4));
        assert_eq!(from_bytes::<Timestamp>(&to_bytes(&now)).unwrap(), now);
    }
}
