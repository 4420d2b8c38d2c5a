use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// How a binding turns values into payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFlavor {
    /// Generic serde serialization.
    Structured,
    /// The type supplies its own byte encoding.
    Binary,
    /// Explicit encode/decode functions.
    Custom,
}

/// Encode/decode strategy for values of type `T`.
pub trait PacketCodec<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<Bytes, CodecError>;

    fn decode(&self, payload: &[u8]) -> Result<T, CodecError>;

    fn flavor(&self) -> PacketFlavor {
        PacketFlavor::Custom
    }
}

/// A packet type with a fixed wire type id.
pub trait TypedPacket {
    const TYPE_ID: u32;
}

/// A packet type that encodes itself to raw bytes.
pub trait BinaryPacket: Sized {
    fn encode(&self) -> Bytes;

    fn decode(payload: &[u8]) -> Result<Self, CodecError>;
}

/// Structured codec: serde values as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> PacketCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, payload: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(payload)?)
    }

    fn flavor(&self) -> PacketFlavor {
        PacketFlavor::Structured
    }
}

/// Binary codec delegating to [`BinaryPacket`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl<T> PacketCodec<T> for BinaryCodec
where
    T: BinaryPacket,
{
    fn encode(&self, value: &T) -> Result<Bytes, CodecError> {
        Ok(BinaryPacket::encode(value))
    }

    fn decode(&self, payload: &[u8]) -> Result<T, CodecError> {
        <T as BinaryPacket>::decode(payload)
    }

    fn flavor(&self) -> PacketFlavor {
        PacketFlavor::Binary
    }
}

/// Codec built from a pair of functions.
pub struct FnCodec<T, E, D> {
    encode: E,
    decode: D,
    _marker: PhantomData<fn() -> T>,
}

impl<T, E, D> FnCodec<T, E, D> {
    pub fn new(encode: E, decode: D) -> Self
    where
        E: Fn(&T) -> Result<Bytes, CodecError>,
        D: Fn(&[u8]) -> Result<T, CodecError>,
    {
        Self {
            encode,
            decode,
            _marker: PhantomData,
        }
    }
}

impl<T, E, D> PacketCodec<T> for FnCodec<T, E, D>
where
    T: 'static,
    E: Fn(&T) -> Result<Bytes, CodecError> + Send + Sync + 'static,
    D: Fn(&[u8]) -> Result<T, CodecError> + Send + Sync + 'static,
{
    fn encode(&self, value: &T) -> Result<Bytes, CodecError> {
        (self.encode)(value)
    }

    fn decode(&self, payload: &[u8]) -> Result<T, CodecError> {
        (self.decode)(payload)
    }
}
