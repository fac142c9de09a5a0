//! Fixed-width binary field codec.
//!
//! Every value is written little-endian with no varint compression. Composite
//! values carry a length prefix:
//!
//! ```text
//! string : [presence u8 = 1][units u32][u16 x units]      absent string = [0]
//! array  : [count u32][element x count]
//! vec3   : [x f32][y f32][z f32]
//! quat   : [x f32][y f32][z f32][w f32]
//! addr   : [presence u8 = 1][ip string][port u16]
//! ```
//!
//! Decoding never panics on hostile input. Any read that would run past the end
//! of the buffer yields [`CodecError::MalformedPayload`].

use std::net::{IpAddr, SocketAddr};

use glam::{Quat, Vec3};

use crate::packet::PacketKind;

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// A declared length would read past the end of the buffer.
    #[error("malformed payload: needed {needed} bytes but only {remaining} remain")]
    MalformedPayload {
        /// Bytes the decoder tried to consume.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// The bytes were present but do not form a valid value.
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),

    /// The packet kind id is not present in the registry.
    #[error("unknown packet kind id {0}")]
    UnknownPacketKind(u32),

    /// The packet kind was never registered, so it has no wire id.
    #[error("packet kind {0:?} is not registered")]
    UnregisteredPacketKind(PacketKind),
}

/// Growable output buffer that values encode themselves into.
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Encode `value` at the end of the buffer.
    pub fn write<T: Encode + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.encode(self);
        self
    }

    pub fn put_u8(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a borrowed byte buffer.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, cursor: 0 }
    }

    /// Position of the next unread byte.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Decode the next value.
    pub fn read<T: Decode>(&mut self) -> Result<T, CodecError> {
        T::decode(self)
    }

    /// Consume exactly `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(CodecError::MalformedPayload {
                needed: len,
                remaining,
            });
        }
        let start = self.cursor;
        self.cursor += len;
        Ok(&self.bytes[start..self.cursor])
    }

    /// Consume exactly `N` bytes into an array.
    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Look at the next byte without consuming it.
    pub fn peek_u8(&self) -> Result<u8, CodecError> {
        self.bytes
            .get(self.cursor)
            .copied()
            .ok_or(CodecError::MalformedPayload {
                needed: 1,
                remaining: 0,
            })
    }

    /// Consume everything left in the buffer.
    pub fn rest(&mut self) -> &'a [u8] {
        let start = self.cursor;
        self.cursor = self.bytes.len();
        &self.bytes[start..]
    }
}

/// A value with a fixed binary encoding.
pub trait Encode {
    fn encode(&self, writer: &mut ByteWriter);
}

/// A value that can be reconstructed from its [`Encode`] output.
pub trait Decode: Sized {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError>;
}

/// Marker for types whose encoding starts with a presence byte of `1`.
///
/// `Option<T>` of such a type encodes `None` as the single byte `0`.
pub trait Nullable {}

/// Encode a single value into a fresh buffer.
pub fn to_bytes<T: Encode + ?Sized>(value: &T) -> Vec<u8> {
    let mut writer = ByteWriter::new();
    value.encode(&mut writer);
    writer.into_inner()
}

/// Decode a single value that must span the whole buffer.
pub fn from_bytes<T: Decode>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut reader = ByteReader::new(bytes);
    let value = T::decode(&mut reader)?;
    if !reader.is_empty() {
        return Err(CodecError::InvalidValue("trailing bytes after value"));
    }
    Ok(value)
}

macro_rules! impl_fixed_width {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Encode for $ty {
                fn encode(&self, writer: &mut ByteWriter) {
                    writer.put_slice(&self.to_le_bytes());
                }
            }

            impl Decode for $ty {
                fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
                    Ok(<$ty>::from_le_bytes(reader.take_array()?))
                }
            }
        )*
    };
}

impl_fixed_width!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Encode for bool {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.put_u8(u8::from(*self));
    }
}

impl Decode for bool {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        match reader.read::<u8>()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(CodecError::InvalidValue("bool must be 0 or 1")),
        }
    }
}

impl Encode for char {
    fn encode(&self, writer: &mut ByteWriter) {
        u32::from(*self).encode(writer);
    }
}

impl Decode for char {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        char::from_u32(reader.read()?).ok_or(CodecError::InvalidValue("not a unicode scalar"))
    }
}

impl Encode for str {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.put_u8(1);
        let units: Vec<u16> = self.encode_utf16().collect();
        (units.len() as u32).encode(writer);
        for unit in units {
            unit.encode(writer);
        }
    }
}

impl Encode for String {
    fn encode(&self, writer: &mut ByteWriter) {
        self.as_str().encode(writer);
    }
}

impl Decode for String {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        match reader.read::<u8>()? {
            1 => {}
            0 => return Err(CodecError::InvalidValue("absent string where one is required")),
            _ => return Err(CodecError::InvalidValue("string presence byte must be 0 or 1")),
        }
        let count = reader.read::<u32>()? as usize;
        let byte_len = count
            .checked_mul(2)
            .ok_or(CodecError::InvalidValue("string length overflows"))?;
        let raw = reader.take(byte_len)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| CodecError::InvalidValue("string is not valid utf-16"))
    }
}

impl Nullable for String {}

impl Encode for SocketAddr {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.put_u8(1);
        self.ip().to_string().encode(writer);
        self.port().encode(writer);
    }
}

impl Decode for SocketAddr {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        if reader.read::<u8>()? != 1 {
            return Err(CodecError::InvalidValue("absent address where one is required"));
        }
        let ip: IpAddr = reader
            .read::<String>()?
            .parse()
            .map_err(|_| CodecError::InvalidValue("unparseable ip address"))?;
        let port = reader.read::<u16>()?;
        Ok(SocketAddr::new(ip, port))
    }
}

impl Nullable for SocketAddr {}

impl<T: Encode + Nullable> Encode for Option<T> {
    fn encode(&self, writer: &mut ByteWriter) {
        match self {
            Some(value) => value.encode(writer),
            None => writer.put_u8(0),
        }
    }
}

impl<T: Decode + Nullable> Decode for Option<T> {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        if reader.peek_u8()? == 0 {
            reader.take(1)?;
            return Ok(None);
        }
        T::decode(reader).map(Some)
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, writer: &mut ByteWriter) {
        self.as_slice().encode(writer);
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, writer: &mut ByteWriter) {
        (self.len() as u32).encode(writer);
        for element in self {
            element.encode(writer);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let count = reader.read::<u32>()? as usize;
        // Every element occupies at least one byte, so a count larger than the
        // remaining buffer is forged.
        if count > reader.remaining() {
            return Err(CodecError::MalformedPayload {
                needed: count,
                remaining: reader.remaining(),
            });
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(T::decode(reader)?);
        }
        Ok(out)
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.put_slice(self);
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        reader.take_array()
    }
}

impl Encode for Vec3 {
    fn encode(&self, writer: &mut ByteWriter) {
        self.x.encode(writer);
        self.y.encode(writer);
        self.z.encode(writer);
    }
}

impl Decode for Vec3 {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Vec3::new(reader.read()?, reader.read()?, reader.read()?))
    }
}

impl Encode for Quat {
    fn encode(&self, writer: &mut ByteWriter) {
        self.x.encode(writer);
        self.y.encode(writer);
        self.z.encode(writer);
        self.w.encode(writer);
    }
}

impl Decode for Quat {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Quat::from_xyzw(
            reader.read()?,
            reader.read()?,
            reader.read()?,
            reader.read()?,
        ))
    }
}

/// One presence bit per field, packed eight to a byte, least significant bit first.
///
/// Used by the packet body codec and, independently, by sync adapters to mark
/// which behaviour fields changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceMask {
    bytes: Vec<u8>,
}

impl PresenceMask {
    pub fn new(field_count: usize) -> Self {
        Self {
            bytes: vec![0; field_count.div_ceil(8)],
        }
    }

    /// Mask with every bit of every byte set, as written by full encodings.
    pub fn full(field_count: usize) -> Self {
        Self {
            bytes: vec![0xFF; field_count.div_ceil(8)],
        }
    }

    pub fn set(&mut self, index: usize) {
        if let Some(byte) = self.bytes.get_mut(index / 8) {
            *byte |= 1 << (index % 8);
        }
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.bytes
            .get(index / 8)
            .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.iter().all(|byte| *byte == 0)
    }

    pub fn write(&self, writer: &mut ByteWriter) {
        writer.put_slice(&self.bytes);
    }

    /// Read the mask for a list of `field_count` fields.
    pub fn read(reader: &mut ByteReader<'_>, field_count: usize) -> Result<Self, CodecError> {
        let bytes = reader.take(field_count.div_ceil(8))?.to_vec();
        Ok(Self { bytes })
    }
}
