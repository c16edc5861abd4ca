//! # State Persistence
//!
//! The checkpoint boundary: an append-only, order-sensitive blob per
//! operator instance, written through typed [`StateWriter::write`] calls
//! and read back through [`StateReader::read`] calls in the identical
//! order. Write order == read order == field dependency order (a count is
//! written before the elements it bounds; [`StateValue`] container impls
//! keep that invariant internally).
//!
//! Each blob starts with a `(name, version)` header so recovery rejects
//! incompatible state instead of misinterpreting it.
//!
//! Blobs live in a [`CheckpointStore`], keyed by the stable node key the
//! pipeline assigns at subscribe time. [`InMemoryCheckpointStore`] is the
//! reference implementation; durable stores plug in behind the same trait.

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fxhash::FxHashMap;

/// Errors from state encoding, decoding, or blob bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// The blob ended before a field could be read.
    #[error("unexpected end of state blob (needed {needed} bytes, {remaining} remaining)")]
    UnexpectedEof {
        /// Bytes the failed read required.
        needed: usize,
        /// Bytes left in the blob.
        remaining: usize,
    },

    /// The blob header names a different operator.
    #[error("state blob written by `{found}`, expected `{expected}`")]
    NameMismatch {
        /// Name the loading operator expected.
        expected: String,
        /// Name found in the blob header.
        found: String,
    },

    /// The blob header carries an incompatible version.
    #[error("state blob for `{name}` has version {found}, expected {expected}")]
    VersionMismatch {
        /// Operator name.
        name: String,
        /// Version the loading operator expected.
        expected: u32,
        /// Version found in the blob header.
        found: u32,
    },

    /// A field decoded to an invalid value.
    #[error("malformed state field: {0}")]
    Malformed(String),
}

/// A value that can be written to and read from a state blob.
///
/// Implementations must read back exactly the bytes they wrote; the codec
/// carries no per-field framing.
pub trait StateValue: Sized {
    /// Appends this value to the blob.
    fn write_to(&self, buf: &mut BytesMut);

    /// Reads a value of this type from the front of the blob.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::UnexpectedEof`] if the blob is exhausted, or
    /// [`StateError::Malformed`] if the bytes decode to an invalid value.
    fn read_from(buf: &mut Bytes) -> Result<Self, StateError>;
}

fn need(buf: &Bytes, needed: usize) -> Result<(), StateError> {
    if buf.remaining() < needed {
        return Err(StateError::UnexpectedEof {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

macro_rules! scalar_state_value {
    ($ty:ty, $put:ident, $get:ident, $size:expr) => {
        impl StateValue for $ty {
            fn write_to(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }

            fn read_from(buf: &mut Bytes) -> Result<Self, StateError> {
                need(buf, $size)?;
                Ok(buf.$get())
            }
        }
    };
}

scalar_state_value!(u8, put_u8, get_u8, 1);
scalar_state_value!(u16, put_u16_le, get_u16_le, 2);
scalar_state_value!(u32, put_u32_le, get_u32_le, 4);
scalar_state_value!(u64, put_u64_le, get_u64_le, 8);
scalar_state_value!(i32, put_i32_le, get_i32_le, 4);
scalar_state_value!(i64, put_i64_le, get_i64_le, 8);
scalar_state_value!(f32, put_f32_le, get_f32_le, 4);
scalar_state_value!(f64, put_f64_le, get_f64_le, 8);

impl StateValue for bool {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, StateError> {
        need(buf, 1)?;
        match buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(StateError::Malformed(format!(
                "invalid bool encoding {other}"
            ))),
        }
    }
}

impl StateValue for usize {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u64_le(*self as u64);
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, StateError> {
        need(buf, 8)?;
        let raw = buf.get_u64_le();
        usize::try_from(raw)
            .map_err(|_| StateError::Malformed(format!("usize value {raw} out of range")))
    }
}

impl StateValue for String {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32_le(u32::try_from(self.len()).unwrap_or(u32::MAX));
        buf.put_slice(self.as_bytes());
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, StateError> {
        need(buf, 4)?;
        let len = buf.get_u32_le() as usize;
        need(buf, len)?;
        let raw = buf.split_to(len);
        String::from_utf8(raw.to_vec())
            .map_err(|e| StateError::Malformed(format!("invalid utf-8 string: {e}")))
    }
}

impl<T: StateValue> StateValue for Option<T> {
    fn write_to(&self, buf: &mut BytesMut) {
        match self {
            Some(value) => {
                buf.put_u8(1);
                value.write_to(buf);
            }
            None => buf.put_u8(0),
        }
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, StateError> {
        need(buf, 1)?;
        match buf.get_u8() {
            0 => Ok(None),
            1 => Ok(Some(T::read_from(buf)?)),
            other => Err(StateError::Malformed(format!(
                "invalid option tag {other}"
            ))),
        }
    }
}

impl<T: StateValue> StateValue for Vec<T> {
    fn write_to(&self, buf: &mut BytesMut) {
        // Count first: the reader needs the bound before the elements.
        buf.put_u32_le(u32::try_from(self.len()).unwrap_or(u32::MAX));
        for item in self {
            item.write_to(buf);
        }
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, StateError> {
        need(buf, 4)?;
        let len = buf.get_u32_le() as usize;
        // Every element encodes to at least one byte, so a length beyond
        // the remaining bytes is corrupt, not just short.
        if len > buf.remaining() {
            return Err(StateError::Malformed(format!(
                "collection length {len} exceeds blob size"
            )));
        }
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(T::read_from(buf)?);
        }
        Ok(items)
    }
}

impl<T: StateValue> StateValue for VecDeque<T> {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32_le(u32::try_from(self.len()).unwrap_or(u32::MAX));
        for item in self {
            item.write_to(buf);
        }
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, StateError> {
        let items = Vec::<T>::read_from(buf)?;
        Ok(items.into())
    }
}

/// Writes an operator's state fields in order.
#[derive(Debug, Default)]
pub struct StateWriter {
    buf: BytesMut,
}

impl StateWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one typed field.
    pub fn write<T: StateValue>(&mut self, value: &T) {
        value.write_to(&mut self.buf);
    }

    /// Writes the `(name, version)` blob header.
    pub fn write_header(&mut self, name: &str, version: u32) {
        self.write(&name.to_string());
        self.write(&version);
    }

    /// Returns the number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finishes the blob.
    #[must_use]
    pub fn into_blob(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads an operator's state fields back, in write order.
#[derive(Debug)]
pub struct StateReader {
    buf: Bytes,
}

impl StateReader {
    /// Wraps a blob for reading.
    #[must_use]
    pub fn new(blob: Bytes) -> Self {
        Self { buf: blob }
    }

    /// Reads the next typed field.
    ///
    /// # Errors
    ///
    /// See [`StateValue::read_from`].
    pub fn read<T: StateValue>(&mut self) -> Result<T, StateError> {
        T::read_from(&mut self.buf)
    }

    /// Reads and checks the `(name, version)` blob header.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NameMismatch`] or
    /// [`StateError::VersionMismatch`] when the blob was written by a
    /// different operator or an incompatible version of it.
    pub fn read_header(&mut self, expected_name: &str, expected_version: u32) -> Result<(), StateError> {
        let name: String = self.read()?;
        if name != expected_name {
            return Err(StateError::NameMismatch {
                expected: expected_name.to_string(),
                found: name,
            });
        }
        let version: u32 = self.read()?;
        if version != expected_version {
            return Err(StateError::VersionMismatch {
                name,
                expected: expected_version,
                found: version,
            });
        }
        Ok(())
    }

    /// Returns the number of unread bytes.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}

/// Keyed blob storage for checkpoints.
///
/// Keys are the stable node keys assigned at subscribe time; a
/// differential checkpoint overwrites only the keys whose operators were
/// dirty, leaving the rest of the snapshot intact.
pub trait CheckpointStore: Send {
    /// Stores (or replaces) a blob.
    fn put(&mut self, key: &str, blob: Bytes);

    /// Fetches a blob.
    fn get(&self, key: &str) -> Option<Bytes>;

    /// Removes a blob, returning `true` if it existed.
    fn remove(&mut self, key: &str) -> bool;
}

/// A heap-backed [`CheckpointStore`].
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    blobs: FxHashMap<String, Bytes>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Returns `true` if the store holds no blobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Returns the total size of all blobs, in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.blobs.values().map(Bytes::len).sum()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn put(&mut self, key: &str, blob: Bytes) {
        self.blobs.insert(key.to_string(), blob);
    }

    fn get(&self, key: &str) -> Option<Bytes> {
        self.blobs.get(key).cloned()
    }

    fn remove(&mut self, key: &str) -> bool {
        self.blobs.remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let mut writer = StateWriter::new();
        writer.write(&42u64);
        writer.write(&-7i64);
        writer.write(&true);
        writer.write(&2.5f64);
        writer.write(&"hello".to_string());

        let mut reader = StateReader::new(writer.into_blob());
        assert_eq!(reader.read::<u64>().unwrap(), 42);
        assert_eq!(reader.read::<i64>().unwrap(), -7);
        assert!(reader.read::<bool>().unwrap());
        assert!((reader.read::<f64>().unwrap() - 2.5).abs() < f64::EPSILON);
        assert_eq!(reader.read::<String>().unwrap(), "hello");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_container_round_trip() {
        let mut writer = StateWriter::new();
        writer.write(&Some(9i32));
        writer.write(&Option::<i32>::None);
        writer.write(&vec![1i64, 2, 3]);
        writer.write(&VecDeque::from(vec!["a".to_string(), "b".to_string()]));

        let mut reader = StateReader::new(writer.into_blob());
        assert_eq!(reader.read::<Option<i32>>().unwrap(), Some(9));
        assert_eq!(reader.read::<Option<i32>>().unwrap(), None);
        assert_eq!(reader.read::<Vec<i64>>().unwrap(), vec![1, 2, 3]);
        assert_eq!(
            reader.read::<VecDeque<String>>().unwrap(),
            VecDeque::from(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_eof_detection() {
        let mut writer = StateWriter::new();
        writer.write(&1u8);
        let mut reader = StateReader::new(writer.into_blob());
        let _ = reader.read::<u8>().unwrap();
        let err = reader.read::<u64>().unwrap_err();
        assert!(matches!(err, StateError::UnexpectedEof { needed: 8, .. }));
    }

    #[test]
    fn test_corrupt_collection_length() {
        let mut writer = StateWriter::new();
        writer.write(&u32::MAX);
        let mut reader = StateReader::new(writer.into_blob());
        let err = reader.read::<Vec<u8>>().unwrap_err();
        assert!(matches!(err, StateError::Malformed(_)));
    }

    #[test]
    fn test_header_check() {
        let mut writer = StateWriter::new();
        writer.write_header("rill/sum", 2);
        let blob = writer.into_blob();

        let mut ok = StateReader::new(blob.clone());
        ok.read_header("rill/sum", 2).unwrap();

        let mut wrong_name = StateReader::new(blob.clone());
        assert!(matches!(
            wrong_name.read_header("rill/min", 2),
            Err(StateError::NameMismatch { .. })
        ));

        let mut wrong_version = StateReader::new(blob);
        assert!(matches!(
            wrong_version.read_header("rill/sum", 3),
            Err(StateError::VersionMismatch {
                expected: 3,
                found: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_in_memory_store() {
        let mut store = InMemoryCheckpointStore::new();
        assert!(store.is_empty());

        store.put("0/rill/sum", Bytes::from_static(b"abc"));
        store.put("1/rill/buffer", Bytes::from_static(b"defg"));
        assert_eq!(store.len(), 2);
        assert_eq!(store.total_bytes(), 7);
        assert_eq!(store.get("0/rill/sum"), Some(Bytes::from_static(b"abc")));

        assert!(store.remove("0/rill/sum"));
        assert!(!store.remove("0/rill/sum"));
        assert_eq!(store.get("0/rill/sum"), None);
    }
}
