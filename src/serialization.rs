//! Transport of arbitrary `serde` values as byte buffers.
//!
//! The send side encodes eagerly into a [`Serialized`] container, which is
//! passed to `send_buf` like any other container. The receive side passes a
//! library-allocated [`Deserializable`] byte container as `recv_buf`; the
//! operation sizes it like any other output and the caller decodes it from
//! the result.
//!
//! ```
//! use mpiparams::local;
//! use mpiparams::params::{as_deserializable, as_serialized, destination, recv_buf, send_buf};
//! use std::collections::HashMap;
//!
//! local::run(2, |mpi| {
//!     let world = mpi.world();
//!     if world.rank() == 0 {
//!         let map = HashMap::from([("a".to_string(), 1), ("b".to_string(), 2)]);
//!         world.send((send_buf(as_serialized(&map).unwrap()), destination(1))).unwrap();
//!     } else {
//!         let received = world
//!             .recv(recv_buf(as_deserializable::<HashMap<String, i32>>()))
//!             .unwrap()
//!             .into_value();
//!         assert_eq!(received.deserialize().unwrap()["b"], 2);
//!     }
//! });
//! ```

use crate::buffer::{Caller, Container, ContainerMut, Owned, ResizableContainer};
use crate::error::{Error, Result};
use crate::params::{alloc_new, AllocNew, IntoStorage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;

mod sealed {
    pub trait Sealed {}
}

/// A wire encoding for serialized values.
pub trait Encoding: sealed::Sealed + Copy + Default + 'static {
    /// Name for logs and errors.
    const NAME: &'static str;

    /// Encode `value`.
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>>;

    /// Decode a value from `bytes`.
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}

/// MessagePack through `rmp-serde`, with named struct fields. The default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgPack;

/// JSON through `serde_json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Json;

impl sealed::Sealed for MsgPack {}
impl sealed::Sealed for Json {}

impl Encoding for MsgPack {
    const NAME: &'static str = "msgpack";

    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

impl Encoding for Json {
    const NAME: &'static str = "json";

    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// An encoded value, ready to send.
#[derive(Clone, PartialEq, Eq)]
pub struct Serialized<E = MsgPack> {
    bytes: Vec<u8>,
    _encoding: PhantomData<E>,
}

impl<E: Encoding> Serialized<E> {
    /// The encoded bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Take the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl<E: Encoding> fmt::Debug for Serialized<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serialized")
            .field("encoding", &E::NAME)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl<E: Encoding> Container for Serialized<E> {
    type Elem = u8;

    fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl<E: Encoding> ContainerMut for Serialized<E> {
    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl<E: Encoding> IntoStorage for Serialized<E> {
    type Storage = Owned<Serialized<E>, Caller>;

    fn into_storage(self) -> Self::Storage {
        Owned::new(self)
    }
}

/// Receive storage for an encoded `T`.
pub struct Deserializable<T, E = MsgPack> {
    bytes: Vec<u8>,
    _marker: PhantomData<fn() -> (T, E)>,
}

impl<T: DeserializeOwned, E: Encoding> Deserializable<T, E> {
    /// Decode the received bytes.
    pub fn deserialize(&self) -> Result<T> {
        E::decode(&self.bytes)
    }

    /// The received bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl<T, E> Default for Deserializable<T, E> {
    fn default() -> Self {
        Deserializable {
            bytes: Vec::new(),
            _marker: PhantomData,
        }
    }
}

impl<T, E: Encoding> fmt::Debug for Deserializable<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deserializable")
            .field("type", &std::any::type_name::<T>())
            .field("encoding", &E::NAME)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl<T: 'static, E: Encoding> Container for Deserializable<T, E> {
    type Elem = u8;

    fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl<T: 'static, E: Encoding> ContainerMut for Deserializable<T, E> {
    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl<T: 'static, E: Encoding> ResizableContainer for Deserializable<T, E> {
    fn resize(&mut self, len: usize) {
        self.bytes.resize(len, 0);
    }
}

/// Encode `value` with MessagePack.
pub fn as_serialized<T: Serialize + ?Sized>(value: &T) -> Result<Serialized<MsgPack>> {
    as_serialized_with::<MsgPack, T>(value)
}

/// Encode `value` with encoding `E`.
pub fn as_serialized_with<E: Encoding, T: Serialize + ?Sized>(value: &T) -> Result<Serialized<E>> {
    let bytes = E::encode(value)?;
    tracing::trace!(encoding = E::NAME, len = bytes.len(), "serialized value");
    Ok(Serialized {
        bytes,
        _encoding: PhantomData,
    })
}

/// Library-allocated receive storage for a MessagePack-encoded `T`.
pub fn as_deserializable<T: DeserializeOwned + 'static>() -> AllocNew<Deserializable<T, MsgPack>> {
    as_deserializable_with::<T, MsgPack>()
}

/// Library-allocated receive storage for a `T` encoded with `E`.
pub fn as_deserializable_with<T: DeserializeOwned + 'static, E: Encoding>(
) -> AllocNew<Deserializable<T, E>> {
    alloc_new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{recv_buf, send_buf};
    use std::collections::BTreeMap;

    fn sample() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("alpha".to_string(), "one".to_string()),
            ("beta".to_string(), "two".to_string()),
        ])
    }

    fn decode_through_buffer<E: Encoding>() {
        let encoded = as_serialized_with::<E, _>(&sample()).unwrap();
        let sent = send_buf(&encoded);
        let mut received = recv_buf(as_deserializable_with::<BTreeMap<String, String>, E>());
        received
            .resize_if_requested(|| sent.size())
            .unwrap();
        received.as_mut_slice().copy_from_slice(sent.as_slice());
        assert_eq!(received.extract().deserialize().unwrap(), sample());
    }

    #[test]
    fn msgpack_bytes_decode_after_transfer() {
        decode_through_buffer::<MsgPack>();
    }

    #[test]
    fn json_bytes_decode_after_transfer() {
        decode_through_buffer::<Json>();
        let encoded = as_serialized_with::<Json, _>(&[1, 2]).unwrap();
        assert_eq!(encoded.bytes(), b"[1,2]");
    }

    #[test]
    fn garbage_fails_to_decode() {
        let mut slot = Deserializable::<BTreeMap<String, String>, Json>::default();
        slot.resize(3);
        slot.as_mut_slice().copy_from_slice(b"{{{");
        assert!(matches!(slot.deserialize(), Err(Error::Serialization(_))));
    }
}
