//! S3 client for state storage
//!
//! The state blob lives at `key` in `bucket`; the lock is a JSON
//! [`LockInfo`] object stored at `<key>.lock`.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketVersioningStatus, PublicAccessBlockConfiguration, ServerSideEncryption,
    VersioningConfiguration,
};

use super::wait_for_lock;
use crate::backend::{
    BackendConfig, BackendError, BackendResult, ClientLocker, RemoteClient, StorageConfig,
};
use crate::lock::LockInfo;

/// S3-based state client
pub struct S3Client {
    /// S3 client
    client: Client,
    /// Bucket name
    bucket: String,
    /// Object key for the state blob
    key: String,
    /// AWS region
    region: String,
    /// Whether to request server-side encryption (default: true)
    encrypt: bool,
    /// Whether to auto-create the bucket if it doesn't exist (default: false)
    auto_create: bool,
    /// How long to wait for a lock held by someone else
    lock_timeout: Duration,
}

impl S3Client {
    /// Create a new S3Client from configuration
    pub async fn from_config(config: &BackendConfig, storage: &StorageConfig) -> BackendResult<Self> {
        let bucket = required(config, "bucket")?;
        let key = required(config, "key")?;
        let region = required(config, "region")?;

        let encrypt = config.get_bool_or("encrypt", true);
        let auto_create = config.get_bool_or("auto_create", false);

        // The SDK owns retries; the storage layer never retries on its own
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region.clone()))
            .retry_config(RetryConfig::standard().with_max_attempts(max_attempts(storage.retry_max)))
            .load()
            .await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(endpoint) = config.get_string("endpoint") {
            s3_config = s3_config.endpoint_url(endpoint);
        }
        if let Some(path_style) = config.get_bool("force_path_style") {
            s3_config = s3_config.force_path_style(path_style);
        }
        let client = Client::from_conf(s3_config.build());

        Ok(Self {
            client,
            bucket,
            key,
            region,
            encrypt,
            auto_create,
            lock_timeout: storage.lock_timeout,
        })
    }

    /// Get the lock object key (state key + ".lock")
    fn lock_key(&self) -> String {
        lock_key_for(&self.key)
    }

    /// Fetch an object, returning `None` if it does not exist
    async fn get_object(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let body = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| BackendError::Io(e.to_string()))?;
                Ok(Some(body.into_bytes().to_vec()))
            }
            Err(err) => {
                if is_not_found_error(&err) {
                    Ok(None)
                } else {
                    Err(BackendError::Aws(err.to_string()))
                }
            }
        }
    }

    async fn put_object(&self, key: String, body: Vec<u8>, content_type: &str) -> BackendResult<()> {
        self.put_object_with(key, body, content_type, false)
            .await
            .map(|_| ())
    }

    /// Upload an object; with `if_absent` the write only succeeds when no
    /// object exists at `key`, and `Ok(false)` reports that one did
    async fn put_object_with(
        &self,
        key: String,
        body: Vec<u8>,
        content_type: &str,
        if_absent: bool,
    ) -> BackendResult<bool> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type);

        if self.encrypt {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }
        if if_absent {
            request = request.if_none_match("*");
        }

        match request.send().await {
            Ok(_) => Ok(true),
            Err(err) if if_absent && is_precondition_failed(&err) => Ok(false),
            Err(err) => Err(BackendError::Aws(err.to_string())),
        }
    }

    async fn delete_object(&self, key: String) -> BackendResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BackendError::Aws(e.to_string()))?;

        Ok(())
    }

    /// Read the lock object from S3
    async fn read_lock(&self) -> BackendResult<Option<LockInfo>> {
        match self.get_object(&self.lock_key()).await? {
            Some(bytes) => {
                let lock: LockInfo = serde_json::from_slice(&bytes)
                    .map_err(|e| BackendError::Serialization(e.to_string()))?;
                Ok(Some(lock))
            }
            None => Ok(None),
        }
    }

    async fn try_lock(&self, info: &LockInfo) -> BackendResult<String> {
        // Check for existing lock
        if let Some(existing_lock) = self.read_lock().await? {
            if existing_lock.is_expired() {
                log::warn!(
                    "Taking over expired state lock {} held by {}",
                    existing_lock.id,
                    existing_lock.who
                );
                self.delete_object(self.lock_key()).await?;
            } else {
                return Err(BackendError::locked(&existing_lock));
            }
        }

        let body = serde_json::to_vec_pretty(info)
            .map_err(|e| BackendError::Serialization(e.to_string()))?;
        let created = self
            .put_object_with(self.lock_key(), body, "application/json", true)
            .await?;
        if !created {
            return match self.read_lock().await? {
                Some(winner) => Err(BackendError::locked(&winner)),
                None => Err(BackendError::Aws(
                    "State lock object changed concurrently".to_string(),
                )),
            };
        }

        // Read it back in case another writer raced us
        match self.read_lock().await? {
            Some(written_lock) if written_lock.id != info.id => {
                Err(BackendError::locked(&written_lock))
            }
            _ => Ok(info.id.clone()),
        }
    }

    async fn release(&self, lock_id: &str) -> BackendResult<()> {
        match self.read_lock().await? {
            Some(existing_lock) if existing_lock.id != lock_id => {
                Err(BackendError::LockMismatch {
                    expected: lock_id.to_string(),
                    actual: existing_lock.id,
                })
            }
            Some(_) => self.delete_object(self.lock_key()).await,
            None => Err(BackendError::LockNotFound(lock_id.to_string())),
        }
    }

    /// Make sure the bucket exists, creating it when `auto_create` is set
    pub async fn init(&self) -> BackendResult<()> {
        if self.bucket_exists().await? {
            return Ok(());
        }
        if !self.auto_create {
            return Err(BackendError::BucketNotFound(self.bucket.clone()));
        }
        log::info!("Creating state bucket {} in {}", self.bucket, self.region);
        self.create_bucket().await
    }

    async fn bucket_exists(&self) -> BackendResult<bool> {
        let result = self.client.head_bucket().bucket(&self.bucket).send().await;

        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                // HeadBucket returns 404 for non-existent buckets
                if err.as_service_error().is_some() || is_not_found_error(&err) {
                    Ok(false)
                } else {
                    Err(BackendError::Aws(err.to_string()))
                }
            }
        }
    }

    async fn create_bucket(&self) -> BackendResult<()> {
        // Create bucket with location constraint if not us-east-1
        let mut create_request = self.client.create_bucket().bucket(&self.bucket);

        if self.region != "us-east-1" {
            use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};

            let constraint = BucketLocationConstraint::from(self.region.as_str());
            let config = CreateBucketConfiguration::builder()
                .location_constraint(constraint)
                .build();
            create_request = create_request.create_bucket_configuration(config);
        }

        create_request
            .send()
            .await
            .map_err(|e| BackendError::BucketCreationFailed(e.to_string()))?;

        // Enable versioning so earlier snapshots stay recoverable
        let versioning_config = VersioningConfiguration::builder()
            .status(BucketVersioningStatus::Enabled)
            .build();

        self.client
            .put_bucket_versioning()
            .bucket(&self.bucket)
            .versioning_configuration(versioning_config)
            .send()
            .await
            .map_err(|e| BackendError::Aws(format!("Failed to enable versioning: {}", e)))?;

        let public_access_block = PublicAccessBlockConfiguration::builder()
            .block_public_acls(true)
            .block_public_policy(true)
            .ignore_public_acls(true)
            .restrict_public_buckets(true)
            .build();

        self.client
            .put_public_access_block()
            .bucket(&self.bucket)
            .public_access_block_configuration(public_access_block)
            .send()
            .await
            .map_err(|e| BackendError::Aws(format!("Failed to block public access: {}", e)))?;

        Ok(())
    }

    /// Get the bucket name
    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl RemoteClient for S3Client {
    async fn get(&self) -> BackendResult<Option<Vec<u8>>> {
        self.get_object(&self.key).await
    }

    async fn put(&self, data: &[u8]) -> BackendResult<()> {
        self.put_object(self.key.clone(), data.to_vec(), "application/octet-stream")
            .await
    }

    async fn delete(&self) -> BackendResult<()> {
        self.delete_object(self.key.clone()).await
    }
}

#[async_trait]
impl ClientLocker for S3Client {
    async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
        wait_for_lock(self.lock_timeout, || async move { self.try_lock(info).await }).await
    }

    async fn unlock(&self, lock_id: &str) -> BackendResult<()> {
        self.release(lock_id).await
    }

    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        log::warn!("Forcibly releasing state lock {}", lock_id);
        self.release(lock_id).await
    }
}

fn required(config: &BackendConfig, attribute: &str) -> BackendResult<String> {
    config
        .get_string(attribute)
        .map(str::to_string)
        .ok_or_else(|| {
            BackendError::configuration(format!("Missing required attribute: {}", attribute))
        })
}

fn lock_key_for(key: &str) -> String {
    format!("{}.lock", key)
}

/// SDK attempt count for a number of retries
fn max_attempts(retry_max: u32) -> u32 {
    retry_max.saturating_add(1)
}

/// Check if an S3 error is a "not found" error
fn is_not_found_error<E: std::fmt::Debug>(err: &aws_sdk_s3::error::SdkError<E>) -> bool {
    // Check the raw HTTP response status
    if let Some(raw) = err.raw_response() {
        return raw.status().as_u16() == 404;
    }
    false
}

/// Check if a conditional write lost to an existing object
fn is_precondition_failed<E: std::fmt::Debug>(err: &aws_sdk_s3::error::SdkError<E>) -> bool {
    err.raw_response()
        .is_some_and(|raw| matches!(raw.status().as_u16(), 409 | 412))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key() {
        assert_eq!(lock_key_for("path/to/tofu.tfstate"), "path/to/tofu.tfstate.lock");
    }

    #[test]
    fn test_max_attempts() {
        assert_eq!(max_attempts(0), 1);
        assert_eq!(max_attempts(StorageConfig::DEFAULT_RETRY_MAX), 4);
        assert_eq!(max_attempts(u32::MAX), u32::MAX);
    }

    #[tokio::test]
    async fn test_missing_required_attributes() {
        let config = BackendConfig::new("s3")
            .with_attribute("bucket", "state-bucket")
            .with_attribute("region", "eu-west-1");

        let err = S3Client::from_config(&config, &StorageConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Backend configuration error: Missing required attribute: key"
        );
    }
}
