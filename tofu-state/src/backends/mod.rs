//! Client implementations for state storage

mod inmem;
mod local;
mod s3;

pub use inmem::InmemClient;
pub use local::LocalClient;
pub use s3::S3Client;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendConfig, BackendError, BackendResult, SharedClient, StorageConfig};
use crate::encryption::EncryptedClient;
use crate::lock::LockDisabled;

/// Delay between attempts while waiting for a contended lock
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Create a client from configuration
///
/// This function dispatches to the appropriate client implementation based
/// on the backend_type in the configuration, then applies encryption and
/// lock disabling as configured.
pub async fn create_client(config: &BackendConfig) -> BackendResult<SharedClient> {
    let storage = StorageConfig::from_backend_config(config)?;

    let client: SharedClient = match config.backend_type.as_str() {
        "inmem" => Arc::new(InmemClient::new()),
        "local" => Arc::new(LocalClient::from_config(config, &storage)?),
        "s3" => {
            let client = S3Client::from_config(config, &storage).await?;
            client.init().await?;
            Arc::new(client)
        }
        other => return Err(BackendError::unsupported_backend(other)),
    };

    let client: SharedClient = match storage.encryption {
        Some(encryption) => {
            // Key derivation is deliberately slow
            let encrypted =
                tokio::task::spawn_blocking(move || EncryptedClient::new(client, encryption))
                    .await
                    .map_err(|e| BackendError::Encryption(format!("key derivation failed: {}", e)))?;
            Arc::new(encrypted)
        }
        None => client,
    };

    if storage.lock_enabled {
        Ok(client)
    } else {
        log::info!("State locking is disabled for the {} backend", config.backend_type);
        Ok(Arc::new(LockDisabled::new(client)))
    }
}

/// Retry `attempt` while it reports the lock as held, until `timeout` elapses
pub(crate) async fn wait_for_lock<F, Fut>(timeout: Duration, mut attempt: F) -> BackendResult<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<String>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match attempt().await {
            Err(BackendError::Locked {
                lock_id,
                who,
                operation,
                info,
            }) => {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Err(BackendError::Locked {
                        lock_id,
                        who,
                        operation,
                        info,
                    });
                }
                log::info!(
                    "State is locked by {} ({}), retrying",
                    who,
                    operation
                );
                tokio::time::sleep(LOCK_RETRY_INTERVAL.min(deadline - now)).await;
            }
            other => return other,
        }
    }
}
