//! Tofu State Management
//!
//! This crate keeps the durable record of managed infrastructure and
//! coordinates access to it between concurrent operations and processes.
//!
//! # Overview
//!
//! - **StateKey**: typed addresses mapped onto flat `<namespace>|<address>` keys
//! - **Storage**: a locked key/value view over persisted state
//! - **StateStorage**: a `Storage` over any single-blob client, flattening the
//!   key/value map into one blob and holding one remote lock while active
//! - **RemoteClient / ClientLocker**: the minimal contract a backend provides
//!   (inmem, local file and S3 clients are included)
//! - **EncryptedClient** and **LockDisabled**: client decorators
//! - **StateLocker**: per-process record of held locks
//! - **StateManager**: whole-snapshot reads and writes with lineage and
//!   serial checks
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tofu_state::{create_client, BackendConfig, StateManager, StateStorage, WriteOptions};
//!
//! let config = BackendConfig::new("s3")
//!     .with_attribute("bucket", "my-state-bucket")
//!     .with_attribute("key", "infra/prod/tofu.tfstate")
//!     .with_attribute("region", "ap-northeast-1");
//!
//! let client = create_client(&config).await?;
//! let storage = Arc::new(StateStorage::new(client).with_lock_info("apply", ""));
//! let manager = StateManager::new(storage);
//!
//! // Read current state (locks are held only while reading)
//! let mut state = manager.read_state().await?.state.unwrap_or_default();
//!
//! // ... modify resources ...
//!
//! // Write updated state; fails if someone else wrote a newer serial
//! manager.write_state(&mut state, WriteOptions::default()).await?;
//! manager.close().await?;
//! ```

pub mod backend;
pub mod backends;
pub mod encryption;
pub mod lineage;
pub mod lock;
pub mod locker;
pub mod remote;
pub mod state;
pub mod statekeys;
pub mod statestore;

// Re-export main types for convenience
pub use backend::{
    BackendConfig, BackendError, BackendResult, ClientLocker, RemoteClient, SharedClient,
    StorageConfig,
};
pub use backends::{InmemClient, LocalClient, S3Client, create_client};
pub use encryption::{EncryptedClient, EncryptionConfig};
pub use lineage::new_lineage;
pub use lock::{LockDisabled, LockInfo};
pub use locker::{LockConflict, LockerError, StateLocker};
pub use remote::StateStorage;
pub use remote::codec::CodecError;
pub use state::{
    LoadedState, OutputState, ResourceState, StateError, StateFile, StateManager, StateResult,
    WriteOptions,
};
pub use statekeys::{KeyError, StateKey};
pub use statestore::{Key, KeySet, Storage, StorageError, StorageResult, Value, ValueHash};
