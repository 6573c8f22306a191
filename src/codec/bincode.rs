//! Serde+bincode opt-in persistence (via a wrapper type).

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{KeyCodec, PersistKey, PersistValue, ValueCodec};
use crate::status::Status;

/// Wrapper type to opt into serde+bincode persistence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Bincode<T>(pub T);

/// Serde+bincode codec for `Bincode<T>` wrappers.
pub struct SerdeBincodeCodec<T>(PhantomData<T>);

impl<T> SerdeBincodeCodec<T> {
    #[inline]
    fn payload_len(value: &T) -> Result<usize, Status>
    where
        T: Serialize,
    {
        let n = bincode::serialized_size(value).map_err(|_| Status::InvalidArgument)?;
        usize::try_from(n).map_err(|_| Status::ResourceExhausted)
    }
}

impl<T> KeyCodec<Bincode<T>> for SerdeBincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Eq + std::hash::Hash + Clone + Send + Sync + 'static,
{
    const IS_FIXED: bool = false;
    const FIXED_LEN: usize = 0;

    #[inline]
    fn encoded_len(key: &Bincode<T>) -> Result<usize, Status> {
        Self::payload_len(&key.0)
    }

    #[inline]
    fn encode_into(key: &Bincode<T>, dst: &mut [u8]) -> Result<(), Status> {
        let mut cur = std::io::Cursor::new(dst);
        bincode::serialize_into(&mut cur, &key.0).map_err(|_| Status::InvalidArgument)
    }

    #[inline]
    fn decode(encoded: &[u8]) -> Result<Bincode<T>, Status> {
        bincode::deserialize(encoded)
            .map(Bincode)
            .map_err(|_| Status::Corruption)
    }
}

impl<T> ValueCodec<Bincode<T>> for SerdeBincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    const IS_FIXED: bool = false;
    const FIXED_LEN: usize = 0;

    #[inline]
    fn encoded_len(value: &Bincode<T>) -> Result<usize, Status> {
        Self::payload_len(&value.0)
    }

    #[inline]
    fn encode_into(value: &Bincode<T>, dst: &mut [u8]) -> Result<(), Status> {
        let mut cur = std::io::Cursor::new(dst);
        bincode::serialize_into(&mut cur, &value.0).map_err(|_| Status::InvalidArgument)
    }

    #[inline]
    fn decode(encoded: &[u8]) -> Result<Bincode<T>, Status> {
        bincode::deserialize(encoded)
            .map(Bincode)
            .map_err(|_| Status::Corruption)
    }
}

impl<T> PersistKey for Bincode<T>
where
    T: Serialize + DeserializeOwned + Eq + std::hash::Hash + Clone + Send + Sync + 'static,
{
    type Codec = SerdeBincodeCodec<T>;
}

impl<T> PersistValue for Bincode<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Codec = SerdeBincodeCodec<T>;
}
