//! Fixed-size and raw byte-string codecs.

use std::marker::PhantomData;

use crate::codec::{KeyCodec, PersistKey, PersistValue, ValueCodec};
use crate::status::Status;

/// Little-endian fixed-size encoding for primitive integers.
pub trait Blittable: Copy + Send + Sync + 'static {
    /// Encoded size in bytes.
    const LEN: usize;

    /// Write the little-endian encoding into `dst`.
    fn write_le(&self, dst: &mut [u8]);
    /// Read a value from its little-endian encoding.
    fn read_le(src: &[u8]) -> Self;
}

macro_rules! impl_blittable {
    ($($t:ty),*) => {
        $(
            impl Blittable for $t {
                const LEN: usize = std::mem::size_of::<$t>();

                #[inline]
                fn write_le(&self, dst: &mut [u8]) {
                    dst.copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn read_le(src: &[u8]) -> Self {
                    let mut bytes = [0u8; std::mem::size_of::<$t>()];
                    bytes.copy_from_slice(src);
                    <$t>::from_le_bytes(bytes)
                }
            }
        )*
    };
}

impl_blittable!(u32, u64, i32, i64);

/// Codec for fixed-size blittable types.
pub struct BlittableCodec<T>(PhantomData<T>);

impl<T: Blittable> BlittableCodec<T> {
    #[inline]
    fn check_len(bytes: &[u8]) -> Result<(), Status> {
        if bytes.len() == T::LEN {
            Ok(())
        } else {
            Err(Status::Corruption)
        }
    }
}

impl<T> KeyCodec<T> for BlittableCodec<T>
where
    T: Blittable + Eq,
{
    const IS_FIXED: bool = true;
    const FIXED_LEN: usize = std::mem::size_of::<T>();

    #[inline]
    fn encoded_len(_key: &T) -> Result<usize, Status> {
        Ok(T::LEN)
    }

    #[inline]
    fn encode_into(key: &T, dst: &mut [u8]) -> Result<(), Status> {
        Self::check_len(dst)?;
        key.write_le(dst);
        Ok(())
    }

    #[inline]
    fn decode(encoded: &[u8]) -> Result<T, Status> {
        Self::check_len(encoded)?;
        Ok(T::read_le(encoded))
    }
}

impl<T> ValueCodec<T> for BlittableCodec<T>
where
    T: Blittable,
{
    const IS_FIXED: bool = true;
    const FIXED_LEN: usize = std::mem::size_of::<T>();

    #[inline]
    fn encoded_len(_value: &T) -> Result<usize, Status> {
        Ok(T::LEN)
    }

    #[inline]
    fn encode_into(value: &T, dst: &mut [u8]) -> Result<(), Status> {
        Self::check_len(dst)?;
        value.write_le(dst);
        Ok(())
    }

    #[inline]
    fn decode(encoded: &[u8]) -> Result<T, Status> {
        Self::check_len(encoded)?;
        Ok(T::read_le(encoded))
    }
}

impl PersistKey for u32 {
    type Codec = BlittableCodec<u32>;
}
impl PersistKey for u64 {
    type Codec = BlittableCodec<u64>;
}
impl PersistKey for i32 {
    type Codec = BlittableCodec<i32>;
}
impl PersistKey for i64 {
    type Codec = BlittableCodec<i64>;
}

impl PersistValue for u32 {
    type Codec = BlittableCodec<u32>;
}
impl PersistValue for u64 {
    type Codec = BlittableCodec<u64>;
}
impl PersistValue for i32 {
    type Codec = BlittableCodec<i32>;
}
impl PersistValue for i64 {
    type Codec = BlittableCodec<i64>;
}

/// Owned byte-string wrapper for raw keys/values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct RawBytes(pub Vec<u8>);

impl From<Vec<u8>> for RawBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for RawBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for RawBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Identity codec for raw byte strings.
pub struct RawBytesCodec;

impl KeyCodec<RawBytes> for RawBytesCodec {
    const IS_FIXED: bool = false;
    const FIXED_LEN: usize = 0;

    #[inline]
    fn encoded_len(key: &RawBytes) -> Result<usize, Status> {
        Ok(key.0.len())
    }

    #[inline]
    fn encode_into(key: &RawBytes, dst: &mut [u8]) -> Result<(), Status> {
        if dst.len() != key.0.len() {
            return Err(Status::Corruption);
        }
        dst.copy_from_slice(&key.0);
        Ok(())
    }

    #[inline]
    fn decode(encoded: &[u8]) -> Result<RawBytes, Status> {
        Ok(RawBytes(encoded.to_vec()))
    }
}

impl ValueCodec<RawBytes> for RawBytesCodec {
    const IS_FIXED: bool = false;
    const FIXED_LEN: usize = 0;

    #[inline]
    fn encoded_len(value: &RawBytes) -> Result<usize, Status> {
        Ok(value.0.len())
    }

    #[inline]
    fn encode_into(value: &RawBytes, dst: &mut [u8]) -> Result<(), Status> {
        if dst.len() != value.0.len() {
            return Err(Status::Corruption);
        }
        dst.copy_from_slice(&value.0);
        Ok(())
    }

    #[inline]
    fn decode(encoded: &[u8]) -> Result<RawBytes, Status> {
        Ok(RawBytes(encoded.to_vec()))
    }
}

impl PersistKey for RawBytes {
    type Codec = RawBytesCodec;
}
impl PersistValue for RawBytes {
    type Codec = RawBytesCodec;
}
