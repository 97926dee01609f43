//! Passphrase encryption of the state blob
//!
//! [`EncryptedClient`] wraps any client and encrypts everything passing
//! through `put`/`get` with AES-256-GCM under a key derived from a
//! passphrase with PBKDF2-HMAC-SHA512. Encrypted blobs are self-describing:
//!
//! ```text
//! magic       8 bytes   "TOFUENC1"
//! iterations  4 bytes   u32 big-endian
//! salt        32 bytes
//! nonce       12 bytes
//! ciphertext  remaining bytes, GCM tag included
//! ```
//!
//! The header (magic, iterations, salt) is authenticated as associated data.

use std::fmt;
use std::sync::Arc;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha512;

use crate::backend::{BackendError, BackendResult, ClientLocker, RemoteClient};
use crate::lock::LockInfo;

pub const MAGIC: &[u8; 8] = b"TOFUENC1";
pub const MIN_PASSPHRASE_LEN: usize = 16;
pub const DEFAULT_ITERATIONS: u32 = 600_000;
pub const MIN_ITERATIONS: u32 = 200_000;
/// Envelopes may claim at most this many times the larger of the configured
/// and default iteration counts
pub const MAX_ITERATION_FACTOR: u32 = 10;
pub const SALT_LEN: usize = 32;
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

const HEADER_LEN: usize = MAGIC.len() + 4 + SALT_LEN;

/// Encryption settings for a backend
#[derive(Clone)]
pub struct EncryptionConfig {
    passphrase: String,
    iterations: u32,
    fallback_unencrypted: bool,
}

impl EncryptionConfig {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
            iterations: DEFAULT_ITERATIONS,
            fallback_unencrypted: false,
        }
    }

    /// PBKDF2 iteration count used when encrypting
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    /// Accept unencrypted blobs on read, for migrating existing state
    pub fn with_fallback_unencrypted(mut self, fallback: bool) -> Self {
        self.fallback_unencrypted = fallback;
        self
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn fallback_unencrypted(&self) -> bool {
        self.fallback_unencrypted
    }

    pub fn validate(&self) -> BackendResult<()> {
        if self.passphrase.chars().count() < MIN_PASSPHRASE_LEN {
            return Err(BackendError::configuration(format!(
                "encryption passphrase must be at least {} characters",
                MIN_PASSPHRASE_LEN
            )));
        }
        if self.iterations < MIN_ITERATIONS {
            return Err(BackendError::configuration(format!(
                "encryption iterations must be at least {}",
                MIN_ITERATIONS
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("passphrase", &"<redacted>")
            .field("iterations", &self.iterations)
            .field("fallback_unencrypted", &self.fallback_unencrypted)
            .finish()
    }
}

fn derive_key(passphrase: &[u8], salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha512>(passphrase, salt, iterations, &mut key);
    key
}

fn encryption_error(context: &'static str) -> impl FnOnce(aes_gcm::Error) -> BackendError {
    move |_| BackendError::Encryption(context.to_string())
}

/// Key material for one salt
struct DerivedKey {
    salt: [u8; SALT_LEN],
    iterations: u32,
    key: [u8; KEY_LEN],
}

/// Client decorator encrypting the state blob
///
/// The write key is derived once per client with a fresh salt; blobs written
/// under another salt derive their key on demand.
pub struct EncryptedClient<C: ?Sized> {
    inner: Arc<C>,
    config: EncryptionConfig,
    write_key: DerivedKey,
}

impl<C: ?Sized> EncryptedClient<C> {
    pub fn new(inner: Arc<C>, config: EncryptionConfig) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let key = derive_key(config.passphrase.as_bytes(), &salt, config.iterations);
        Self {
            inner,
            write_key: DerivedKey {
                salt,
                iterations: config.iterations,
                key,
            },
            config,
        }
    }

    pub fn inner(&self) -> &Arc<C> {
        &self.inner
    }

    fn header(iterations: u32, salt: &[u8]) -> Vec<u8> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&iterations.to_be_bytes());
        header.extend_from_slice(salt);
        header
    }

    fn encrypt(&self, plaintext: &[u8]) -> BackendResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let header = Self::header(self.write_key.iterations, &self.write_key.salt);
        let cipher = Aes256Gcm::new_from_slice(&self.write_key.key)
            .map_err(|_| BackendError::Encryption("invalid key length".to_string()))?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(encryption_error("failed to encrypt state"))?;

        let mut out = header;
        out.reserve(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    async fn decrypt(&self, blob: Vec<u8>) -> BackendResult<Vec<u8>> {
        if !blob.starts_with(MAGIC) {
            if self.config.fallback_unencrypted {
                log::warn!("Reading unencrypted state; it will be encrypted on next write");
                return Ok(blob);
            }
            return Err(BackendError::Encryption(
                "state is not encrypted and unencrypted fallback is disabled".to_string(),
            ));
        }
        if blob.len() < HEADER_LEN + NONCE_LEN {
            return Err(BackendError::Encryption(
                "encrypted state is truncated".to_string(),
            ));
        }

        let mut iterations = [0u8; 4];
        iterations.copy_from_slice(&blob[MAGIC.len()..MAGIC.len() + 4]);
        let iterations = u32::from_be_bytes(iterations);
        let salt = &blob[MAGIC.len() + 4..HEADER_LEN];
        let nonce = &blob[HEADER_LEN..HEADER_LEN + NONCE_LEN];
        let ciphertext = &blob[HEADER_LEN + NONCE_LEN..];

        let key = if iterations == self.write_key.iterations && salt == &self.write_key.salt[..] {
            self.write_key.key
        } else {
            if iterations < MIN_ITERATIONS.min(self.config.iterations) {
                return Err(BackendError::Encryption(format!(
                    "encrypted state uses too few key derivation iterations ({})",
                    iterations
                )));
            }
            let ceiling = self
                .config
                .iterations
                .max(DEFAULT_ITERATIONS)
                .saturating_mul(MAX_ITERATION_FACTOR);
            if iterations > ceiling {
                return Err(BackendError::Encryption(format!(
                    "encrypted state uses too many key derivation iterations ({} > {})",
                    iterations, ceiling
                )));
            }
            let passphrase = self.config.passphrase.clone();
            let salt = salt.to_vec();
            tokio::task::spawn_blocking(move || {
                derive_key(passphrase.as_bytes(), &salt, iterations)
            })
            .await
            .map_err(|e| BackendError::Encryption(format!("key derivation failed: {}", e)))?
        };

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| BackendError::Encryption("invalid key length".to_string()))?;
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &blob[..HEADER_LEN],
                },
            )
            .map_err(encryption_error(
                "failed to decrypt state: wrong passphrase or corrupted data",
            ))
    }
}

#[async_trait]
impl<C: RemoteClient + ?Sized> RemoteClient for EncryptedClient<C> {
    async fn get(&self) -> BackendResult<Option<Vec<u8>>> {
        match self.inner.get().await? {
            Some(blob) => Ok(Some(self.decrypt(blob).await?)),
            None => Ok(None),
        }
    }

    async fn put(&self, data: &[u8]) -> BackendResult<()> {
        let blob = self.encrypt(data)?;
        self.inner.put(&blob).await
    }

    async fn delete(&self) -> BackendResult<()> {
        self.inner.delete().await
    }
}

#[async_trait]
impl<C: ClientLocker + ?Sized> ClientLocker for EncryptedClient<C> {
    async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
        self.inner.lock(info).await
    }

    async fn unlock(&self, lock_id: &str) -> BackendResult<()> {
        self.inner.unlock(lock_id).await
    }

    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        self.inner.force_unlock(lock_id).await
    }
}
