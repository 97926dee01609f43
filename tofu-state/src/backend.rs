//! Remote client traits, backend error types and backend configuration

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tofu_core::Value;

use crate::encryption::EncryptionConfig;
use crate::lock::LockInfo;

/// Errors that can occur when interacting with a remote state client
#[derive(Debug, Error)]
pub enum BackendError {
    /// The state is locked by another process
    #[error(
        "State is locked by {who} (lock ID: {lock_id}, operation: {operation}, info: {info})"
    )]
    Locked {
        lock_id: String,
        who: String,
        operation: String,
        info: String,
    },

    /// The lock was not found (for release/force-unlock operations)
    #[error("Lock not found: {0}")]
    LockNotFound(String),

    /// Lock ID mismatch when trying to release
    #[error("Lock ID mismatch: expected {expected}, got {actual}")]
    LockMismatch { expected: String, actual: String },

    /// The backend type is not supported
    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    /// Configuration error
    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// The bucket/container does not exist
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// Failed to create bucket
    #[error("Failed to create bucket: {0}")]
    BucketCreationFailed(String),

    /// Network or I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// AWS SDK error
    #[error("AWS error: {0}")]
    Aws(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Encrypting or decrypting the state blob failed
    #[error("Encryption error: {0}")]
    Encryption(String),
}

impl BackendError {
    /// Create a Locked error from a LockInfo
    pub fn locked(lock: &LockInfo) -> Self {
        Self::Locked {
            lock_id: lock.id.clone(),
            who: lock.who.clone(),
            operation: lock.operation.clone(),
            info: lock.info.clone(),
        }
    }

    /// Create an unsupported backend error
    pub fn unsupported_backend(backend_type: impl Into<String>) -> Self {
        Self::UnsupportedBackend(backend_type.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Minimal contract for a remote state store holding one blob
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch the stored blob
    ///
    /// Returns `None` if nothing has been stored yet
    async fn get(&self) -> BackendResult<Option<Vec<u8>>>;

    /// Replace the stored blob
    async fn put(&self, data: &[u8]) -> BackendResult<()>;

    /// Remove the stored blob entirely
    async fn delete(&self) -> BackendResult<()>;
}

/// A remote client that can also hold a single global lock
#[async_trait]
pub trait ClientLocker: RemoteClient {
    /// Acquire the global lock, returning the lock ID to release it with
    ///
    /// This should fail with [`BackendError::Locked`] if the lock is already
    /// held by someone else
    async fn lock(&self, info: &LockInfo) -> BackendResult<String>;

    /// Release a lock previously returned by [`ClientLocker::lock`]
    async fn unlock(&self, lock_id: &str) -> BackendResult<()>;

    /// Force release a lock by its ID
    ///
    /// This is an administrative operation that should be used with caution
    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        log::warn!("Forcibly releasing state lock {}", lock_id);
        self.unlock(lock_id).await
    }
}

/// Configuration for a state backend
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Backend type (e.g., "s3", "local", "inmem")
    pub backend_type: String,
    /// Backend-specific attributes
    pub attributes: HashMap<String, Value>,
}

impl BackendConfig {
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            attributes: HashMap::new(),
        }
    }

    /// Set an attribute and return the config for chaining
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Get a string attribute value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get a boolean attribute value
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.attributes.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Get a boolean attribute with a default value
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    /// Get an integer attribute value
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.attributes.get(key) {
            Some(Value::Int(i)) => Some(*i),
            _ => None,
        }
    }

    /// Fail if `key` is present with a type other than `expected`
    fn check_type(&self, key: &str, expected: &str) -> BackendResult<()> {
        match self.attributes.get(key) {
            Some(value) if value.type_name() != expected => {
                Err(BackendError::configuration(format!(
                    "attribute '{}' must be {}, got {}",
                    key,
                    expected,
                    value.type_name()
                )))
            }
            _ => Ok(()),
        }
    }

    fn non_negative_int(&self, key: &str) -> BackendResult<Option<u64>> {
        self.check_type(key, "Int")?;
        match self.get_int(key) {
            Some(i) if i < 0 => Err(BackendError::configuration(format!(
                "attribute '{}' must not be negative",
                key
            ))),
            Some(i) => Ok(Some(i as u64)),
            None => Ok(None),
        }
    }
}

/// Settings shared by every client, resolved from a [`BackendConfig`]
///
/// These are passed explicitly to each client rather than living in any
/// process-wide setting, so concurrent instances never affect each other.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Maximum attempts for backend clients that retry on their own
    pub retry_max: u32,
    /// How long to keep polling a contended lock before giving up
    pub lock_timeout: Duration,
    /// When false the client is wrapped in [`crate::lock::LockDisabled`]
    pub lock_enabled: bool,
    /// Passphrase-based encryption of the state blob
    pub encryption: Option<EncryptionConfig>,
}

impl StorageConfig {
    pub const DEFAULT_RETRY_MAX: u32 = 3;

    pub fn from_backend_config(config: &BackendConfig) -> BackendResult<Self> {
        config.check_type("lock", "Bool")?;
        config.check_type("encryption_passphrase", "String")?;
        config.check_type("encryption_fallback", "Bool")?;

        let retry_max = match config.non_negative_int("retry_max")? {
            Some(n) => u32::try_from(n)
                .map_err(|_| BackendError::configuration("attribute 'retry_max' is too large"))?,
            None => Self::DEFAULT_RETRY_MAX,
        };
        let lock_timeout = config
            .non_negative_int("lock_timeout")?
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);

        let encryption = match config.get_string("encryption_passphrase") {
            Some(passphrase) => {
                let mut encryption = EncryptionConfig::new(passphrase)
                    .with_fallback_unencrypted(config.get_bool_or("encryption_fallback", false));
                if let Some(iterations) = config.non_negative_int("encryption_iterations")? {
                    let iterations = u32::try_from(iterations).map_err(|_| {
                        BackendError::configuration("attribute 'encryption_iterations' is too large")
                    })?;
                    encryption = encryption.with_iterations(iterations);
                }
                encryption.validate()?;
                Some(encryption)
            }
            None => None,
        };

        Ok(Self {
            retry_max,
            lock_timeout,
            lock_enabled: config.get_bool_or("lock", true),
            encryption,
        })
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retry_max: Self::DEFAULT_RETRY_MAX,
            lock_timeout: Duration::ZERO,
            lock_enabled: true,
            encryption: None,
        }
    }
}

/// A shared, lockable remote client as handed to the storage adapter
pub type SharedClient = Arc<dyn ClientLocker>;
