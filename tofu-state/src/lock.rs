//! Lock information and the lock-disabling client decorator

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendResult, ClientLocker, RemoteClient};

/// Information about a state lock
///
/// Stored alongside the lock by clients that support it so that a second
/// process contending for the lock can tell who holds it and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier for this lock
    pub id: String,
    /// The operation being performed (e.g., "apply", "destroy", "plan")
    pub operation: String,
    /// Free-form extra information for humans
    #[serde(default)]
    pub info: String,
    /// Who acquired the lock (username@hostname)
    pub who: String,
    /// Version of the tool that acquired the lock
    pub version: String,
    /// When the lock was created
    pub created: DateTime<Utc>,
    /// When the lock expires; `None` means it is held until released
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

impl LockInfo {
    /// Create a new lock for an operation
    ///
    /// The lock never expires. Another process can only clear it through
    /// `force_unlock`.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation: operation.into(),
            info: String::new(),
            who: get_lock_owner(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            created: Utc::now(),
            expires: None,
        }
    }

    /// Create a lock that other processes may take over after `timeout_secs`
    pub fn with_timeout(operation: impl Into<String>, timeout_secs: i64) -> Self {
        let mut lock = Self::new(operation);
        lock.expires = Some(lock.created + Duration::seconds(timeout_secs));
        lock
    }

    /// Attach free-form information shown in lock conflict errors
    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    /// Check if the lock has expired
    pub fn is_expired(&self) -> bool {
        self.expires.is_some_and(|expires| Utc::now() > expires)
    }

    /// Get the remaining time until expiration
    pub fn time_remaining(&self) -> Option<Duration> {
        self.expires.map(|expires| expires - Utc::now())
    }
}

/// Get the lock owner string (username@hostname)
fn get_lock_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}

/// Client decorator that makes locking a no-op
///
/// Everything except `lock`/`unlock` is forwarded to the inner client. Used
/// for clients with no native locking and when the user turned locking off,
/// so callers always go through the same locking interface.
pub struct LockDisabled<C: ?Sized> {
    inner: Arc<C>,
}

impl<C: ?Sized> LockDisabled<C> {
    pub fn new(inner: Arc<C>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Arc<C> {
        &self.inner
    }
}

#[async_trait]
impl<C: RemoteClient + ?Sized> RemoteClient for LockDisabled<C> {
    async fn get(&self) -> BackendResult<Option<Vec<u8>>> {
        self.inner.get().await
    }

    async fn put(&self, data: &[u8]) -> BackendResult<()> {
        self.inner.put(data).await
    }

    async fn delete(&self) -> BackendResult<()> {
        self.inner.delete().await
    }
}

#[async_trait]
impl<C: RemoteClient + ?Sized> ClientLocker for LockDisabled<C> {
    async fn lock(&self, _info: &LockInfo) -> BackendResult<String> {
        Ok(String::new())
    }

    async fn unlock(&self, _lock_id: &str) -> BackendResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InmemClient;

    #[test]
    fn test_lock_info_new() {
        let lock = LockInfo::new("apply");
        assert_eq!(lock.operation, "apply");
        assert!(!lock.id.is_empty());
        assert!(!lock.who.is_empty());
        assert_eq!(lock.version, env!("CARGO_PKG_VERSION"));
        assert!(lock.expires.is_none());
        assert!(lock.time_remaining().is_none());
    }

    #[test]
    fn test_lock_info_not_expired() {
        let lock = LockInfo::new("apply");
        assert!(!lock.is_expired());
        assert!(LockInfo::with_timeout("apply", -1).is_expired());
    }

    #[test]
    fn test_lock_info_without_expiry_round_trips() {
        let json = serde_json::to_string(&LockInfo::new("apply")).unwrap();
        assert!(!json.contains("expires"));
        let parsed: LockInfo = serde_json::from_str(&json).unwrap();
        assert!(parsed.expires.is_none());
        assert!(!parsed.is_expired());
    }

    #[test]
    fn test_lock_info_with_timeout() {
        let lock = LockInfo::with_timeout("apply", 60);
        let remaining = lock.time_remaining().unwrap();
        // Should be close to 60 seconds (allowing for test execution time)
        assert!(remaining.num_seconds() > 55);
        assert!(remaining.num_seconds() <= 60);
    }

    #[test]
    fn test_lock_owner_format() {
        let who = get_lock_owner();
        assert!(who.contains('@'));
    }

    #[test]
    fn test_lock_info_serialization() {
        let lock = LockInfo::new("apply").with_info("ticket 42");
        let json = serde_json::to_string_pretty(&lock).unwrap();
        let deserialized: LockInfo = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.id, lock.id);
        assert_eq!(deserialized.operation, lock.operation);
        assert_eq!(deserialized.who, lock.who);
        assert_eq!(deserialized.info, "ticket 42");
    }

    #[tokio::test]
    async fn test_lock_disabled_never_contacts_inner_lock() {
        let inner = Arc::new(InmemClient::new());
        let held = inner.lock(&LockInfo::new("apply")).await.unwrap();

        // The inner client is locked, but the decorator ignores that entirely
        let client = LockDisabled::new(inner.clone());
        let id = client.lock(&LockInfo::new("plan")).await.unwrap();
        client.unlock(&id).await.unwrap();
        client.unlock("anything").await.unwrap();

        // Data operations still reach the inner client
        client.put(b"blob").await.unwrap();
        assert_eq!(inner.get().await.unwrap(), Some(b"blob".to_vec()));
        client.delete().await.unwrap();
        assert_eq!(client.get().await.unwrap(), None);

        inner.unlock(&held).await.unwrap();
    }
}
