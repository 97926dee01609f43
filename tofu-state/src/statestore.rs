//! State storage - A locked key/value view over persisted state
//!
//! [`Storage`] is the interface the rest of the engine uses to read and
//! write individual state objects. Implementations decide how keys map onto
//! their underlying store and how much concurrency they can really offer;
//! callers always lock the keys they use, read and write them while holding
//! those locks, and release them when done.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::backend::BackendError;
use crate::remote::codec::CodecError;
use crate::statekeys::{KeyError, StateKey};

/// Opaque identifier for one object (or potential object) in a [`Storage`]
///
/// Keys are always valid encodings of a [`StateKey`]; clones are cheap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Arc<str>);

impl Key {
    /// Wrap a name produced by [`StateKey::encode`]
    pub(crate) fn from_canonical(raw: String) -> Self {
        Self(Arc::from(raw))
    }

    /// Validate a key name loaded from outside the process
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        StateKey::decode(raw).map(|key| key.encode())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", &*self.0)
    }
}

impl From<&StateKey> for Key {
    fn from(key: &StateKey) -> Self {
        key.encode()
    }
}

/// Opaque bytes associated with a [`Key`]
///
/// A stored value is never empty; an empty value stands for "no value".
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Value(Vec<u8>);

/// SHA-256 of a value, recorded so later operations can detect changes
pub type ValueHash = [u8; 32];

impl Value {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when this value represents absence
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn hash(&self) -> ValueHash {
        Sha256::digest(&self.0).into()
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({} bytes)", self.0.len())
    }
}

/// A set of keys, ordered by name
pub type KeySet = BTreeSet<Key>;

/// Errors from the storage protocol
#[derive(Debug, Error)]
pub enum StorageError {
    /// Read or write attempted without holding any lock
    #[error("{operation} while not holding a lock")]
    NotLocked { operation: &'static str },

    /// More keys unlocked than were ever locked
    #[error("Released more locks than have been acquired")]
    OverReleased,

    /// Lock status changed while a key sequence was being consumed
    #[error("Storage lock status changed before the key sequence was consumed")]
    ConcurrentStateChange,

    #[error("State storage is closed")]
    Closed,

    /// The persisted blob could not be decoded
    #[error("Invalid state data: {0}")]
    CorruptRemoteState(#[source] CodecError),

    /// The underlying client failed
    #[error("{operation}: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: BackendError,
    },
}

impl StorageError {
    pub(crate) fn backend(operation: &'static str) -> impl FnOnce(BackendError) -> Self {
        move |source| Self::Backend { operation, source }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Sequence of keys returned by [`Storage::keys`]
pub type KeySeq = Box<dyn Iterator<Item = StorageResult<Key>> + Send>;

/// Locked key/value access to persisted state
#[async_trait]
pub trait Storage: Send + Sync {
    /// Enumerate the keys that currently have values
    ///
    /// Without any lock held this is a one-shot snapshot straight from the
    /// underlying store and successive calls may disagree. With a lock held
    /// the sequence reflects locked data, and yields
    /// [`StorageError::ConcurrentStateChange`] if the lock status changes
    /// before it is fully consumed.
    async fn keys(&self) -> KeySeq;

    /// Read the values for the given keys; keys with no value are omitted
    async fn read(&self, keys: &KeySet) -> StorageResult<HashMap<Key, Value>>;

    /// Write values; an empty value deletes the key
    async fn write(&self, data: HashMap<Key, Value>) -> StorageResult<()>;

    /// Acquire shared and exclusive locks on the given keys
    async fn lock(&self, shared: &KeySet, exclusive: &KeySet) -> StorageResult<()>;

    /// Release locks on the given keys
    async fn unlock(&self, keys: &KeySet) -> StorageResult<()>;

    /// Make any buffered writes durable without releasing locks
    async fn persist(&self) -> StorageResult<()>;

    /// Release everything and make the storage unusable
    async fn close(&self) -> StorageResult<()>;
}

/// Collect the output of [`Storage::keys`] into a [`KeySet`]
pub fn collect_key_set(items: KeySeq) -> StorageResult<KeySet> {
    items.collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parse_accepts_canonical_names() {
        let key = Key::parse("rsrcinst|aws_instance.foo").unwrap();
        assert_eq!(key.name(), "rsrcinst|aws_instance.foo");
        assert_eq!(format!("{:?}", key), "Key(\"rsrcinst|aws_instance.foo\")");
        assert!(Key::parse("not a key").is_err());
    }

    #[test]
    fn keys_order_by_name() {
        let mut set = KeySet::new();
        set.insert(Key::parse("rsrcinst|b.b").unwrap());
        set.insert(Key::parse("meta|snapshot").unwrap());
        set.insert(Key::parse("rsrc|a.a").unwrap());
        let names: Vec<_> = set.iter().map(|k| k.name().to_string()).collect();
        // Byte-wise: 'i' (0x69) sorts before '|' (0x7c)
        assert_eq!(names, vec!["meta|snapshot", "rsrcinst|b.b", "rsrc|a.a"]);
    }

    #[test]
    fn value_hash_is_sha256() {
        let hash = Value::default().hash();
        assert_eq!(hash[..4], [0xe3, 0xb0, 0xc4, 0x42]);
        assert!(Value::default().is_empty());
        assert_eq!(Value::new(vec![1, 2]).len(), 2);
    }

    #[test]
    fn collect_key_set_stops_at_error() {
        let items: KeySeq = Box::new(
            vec![
                Ok(Key::parse("meta|snapshot").unwrap()),
                Err(StorageError::ConcurrentStateChange),
            ]
            .into_iter(),
        );
        assert!(matches!(
            collect_key_set(items),
            Err(StorageError::ConcurrentStateChange)
        ));
    }
}
