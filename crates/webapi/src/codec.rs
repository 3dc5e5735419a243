//! Packet codecs and argument conversion.

use std::fmt::Debug;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::error::CodecError;
use crate::packet::Packet;

/// Encodes packets to bytes and back.
pub trait PacketCodec: Debug + Send + Sync + 'static {
    /// Encode a packet.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet cannot be serialized.
    fn encode(&self, packet: &Packet) -> Result<Bytes, CodecError>;

    /// Decode a packet.
    ///
    /// # Errors
    ///
    /// Returns an error if the data does not match the packet shape.
    fn decode(&self, data: &[u8]) -> Result<Packet, CodecError>;
}

/// CBOR codec, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl PacketCodec for CborCodec {
    fn encode(&self, packet: &Packet) -> Result<Bytes, CodecError> {
        let mut vec = Vec::new();
        ciborium::ser::into_writer(packet, &mut vec)?;
        Ok(Bytes::from(vec))
    }

    fn decode(&self, data: &[u8]) -> Result<Packet, CodecError> {
        Ok(ciborium::de::from_reader(data)?)
    }
}

/// JSON codec, useful when the peer speaks text frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PacketCodec for JsonCodec {
    fn encode(&self, packet: &Packet) -> Result<Bytes, CodecError> {
        serde_json::to_vec(packet)
            .map(Bytes::from)
            .map_err(|e| CodecError::SerializationFailed(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<Packet, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::DeserializationFailed(e.to_string()))
    }
}

/// Convert a value into a positional argument.
///
/// # Errors
///
/// Returns an error if the value cannot be represented as a [`Value`].
pub fn to_arg<T: Serialize + ?Sized>(value: &T) -> Result<Value, CodecError> {
    serde_json::to_value(value).map_err(|e| CodecError::SerializationFailed(e.to_string()))
}

/// Anything that can be turned into the positional arguments of a call.
pub trait IntoArgs {
    /// Convert into positional arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if an argument cannot be serialized.
    fn into_args(self) -> Result<Vec<Value>, CodecError>;
}

impl IntoArgs for Vec<Value> {
    fn into_args(self) -> Result<Vec<Value>, CodecError> {
        Ok(self)
    }
}

impl IntoArgs for () {
    fn into_args(self) -> Result<Vec<Value>, CodecError> {
        Ok(Vec::new())
    }
}

macro_rules! impl_into_args_for_tuple {
    ($($name:ident),+) => {
        impl<$($name: Serialize),+> IntoArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_args(self) -> Result<Vec<Value>, CodecError> {
                let ($($name,)+) = self;
                Ok(vec![$(to_arg(&$name)?),+])
            }
        }
    };
}

impl_into_args_for_tuple!(A);
impl_into_args_for_tuple!(A, B);
impl_into_args_for_tuple!(A, B, C);
impl_into_args_for_tuple!(A, B, C, D);
impl_into_args_for_tuple!(A, B, C, D, E);
impl_into_args_for_tuple!(A, B, C, D, E, F);
