//! State snapshots and their mapping onto granular storage
//!
//! A [`StateFile`] is the whole-snapshot view the rest of the engine works
//! with. [`StateManager`] spreads it over individual storage keys: one for
//! snapshot metadata, one per resource, one per resource instance and one per
//! root output value, each holding a small JSON document.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tofu_core::AbsResourceInstance;

use crate::lineage::new_lineage;
use crate::locker::{LockerError, StateLocker};
use crate::statekeys::{KeyError, StateKey};
use crate::statestore::{
    Key, KeySet, Storage, StorageError, Value, ValueHash, collect_key_set,
};

/// Errors from the snapshot layer
#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Locker(#[from] LockerError),

    #[error(transparent)]
    Key(#[from] KeyError),

    /// Stored state belongs to a different history
    #[error(
        "State lineage mismatch: stored state has lineage {stored}, but this state has {local}"
    )]
    LineageMismatch { stored: String, local: String },

    /// Stored state is newer than the state being written
    #[error("State serial regression: stored serial {stored} is newer than {local}")]
    SerialRegression { stored: u64, local: u64 },

    #[error("Invalid state entry for {key}: {message}")]
    InvalidEntry { key: String, message: String },

    #[error("State has entries but no snapshot metadata")]
    MissingMetadata,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for snapshot operations
pub type StateResult<T> = Result<T, StateError>;

/// The main state structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    /// State format version
    pub version: u32,
    /// Monotonically increasing number for each state modification
    pub serial: u64,
    /// Unique identifier for this state lineage (prevents accidental overwrites)
    pub lineage: String,
    /// Version of the tool that last modified this state
    pub tofu_version: String,
    /// All managed resource instances and their current state
    pub resources: Vec<ResourceState>,
    /// Root module output values
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputState>,
}

impl StateFile {
    /// Current state format version
    pub const CURRENT_VERSION: u32 = 1;

    /// Create a new empty state with a fresh lineage
    pub fn new() -> Self {
        Self::with_lineage(new_lineage())
    }

    /// Create a new state with a specific lineage (for initialization)
    pub fn with_lineage(lineage: String) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            serial: 0,
            lineage,
            tofu_version: env!("CARGO_PKG_VERSION").to_string(),
            resources: Vec::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Increment serial and update the tool version for a new state write
    pub fn increment_serial(&mut self) {
        self.serial += 1;
        self.tofu_version = env!("CARGO_PKG_VERSION").to_string();
    }

    /// Find a resource instance by address
    pub fn find_resource(&self, addr: &AbsResourceInstance) -> Option<&ResourceState> {
        self.resources.iter().find(|r| &r.addr == addr)
    }

    /// Find a resource instance mutably by address
    pub fn find_resource_mut(&mut self, addr: &AbsResourceInstance) -> Option<&mut ResourceState> {
        self.resources.iter_mut().find(|r| &r.addr == addr)
    }

    /// Add or update a resource instance in the state
    pub fn upsert_resource(&mut self, resource: ResourceState) {
        if let Some(existing) = self.find_resource_mut(&resource.addr) {
            *existing = resource;
        } else {
            self.resources.push(resource);
        }
    }

    /// Remove a resource instance from the state
    pub fn remove_resource(&mut self, addr: &AbsResourceInstance) -> Option<ResourceState> {
        let pos = self.resources.iter().position(|r| &r.addr == addr)?;
        Some(self.resources.remove(pos))
    }

    pub fn set_output(&mut self, name: impl Into<String>, output: OutputState) {
        self.outputs.insert(name.into(), output);
    }

    pub fn remove_output(&mut self, name: &str) -> Option<OutputState> {
        self.outputs.remove(name)
    }
}

impl Default for StateFile {
    fn default() -> Self {
        Self::new()
    }
}

/// State of a single resource instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Resource instance address (e.g., "aws_instance.web[0]")
    pub addr: AbsResourceInstance,
    /// Provider name (e.g., "aws")
    pub provider: String,
    /// All attributes of the resource as JSON values
    pub attributes: HashMap<String, serde_json::Value>,
    /// Whether this resource is protected from deletion
    #[serde(default)]
    pub protected: bool,
}

impl ResourceState {
    pub fn new(addr: AbsResourceInstance, provider: impl Into<String>) -> Self {
        Self {
            addr,
            provider: provider.into(),
            attributes: HashMap::new(),
            protected: false,
        }
    }

    /// Set an attribute value
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Mark this resource as protected
    pub fn with_protected(mut self, protected: bool) -> Self {
        self.protected = protected;
        self
    }
}

/// A root module output value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputState {
    pub value: serde_json::Value,
    #[serde(default)]
    pub sensitive: bool,
}

impl OutputState {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            sensitive: false,
        }
    }

    pub fn with_sensitive(mut self, sensitive: bool) -> Self {
        self.sensitive = sensitive;
        self
    }
}

/// Stored under the snapshot metadata key
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMeta {
    version: u32,
    serial: u64,
    lineage: String,
    tofu_version: String,
}

/// Stored under each resource key
#[derive(Debug, Serialize, Deserialize)]
struct ResourceMeta {
    provider: String,
}

/// Stored under each resource instance key
#[derive(Debug, Serialize, Deserialize)]
struct InstanceObject {
    provider: String,
    attributes: HashMap<String, serde_json::Value>,
    #[serde(default)]
    protected: bool,
}

fn encode_json<T: Serialize>(value: &T) -> StateResult<Value> {
    serde_json::to_vec(value)
        .map(Value::new)
        .map_err(|e| StateError::Serialization(e.to_string()))
}

fn decode_json<T: DeserializeOwned>(key: &Key, value: &Value) -> StateResult<T> {
    serde_json::from_slice(value.as_bytes()).map_err(|e| StateError::InvalidEntry {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Flatten a snapshot into storage entries
fn flatten(state: &StateFile) -> StateResult<HashMap<Key, Value>> {
    let mut entries = HashMap::new();
    entries.insert(
        StateKey::SnapshotMeta.encode(),
        encode_json(&SnapshotMeta {
            version: state.version,
            serial: state.serial,
            lineage: state.lineage.clone(),
            tofu_version: state.tofu_version.clone(),
        })?,
    );

    for resource in &state.resources {
        let containing = resource.addr.containing_resource().clone();
        entries.insert(
            StateKey::Resource(containing).encode(),
            encode_json(&ResourceMeta {
                provider: resource.provider.clone(),
            })?,
        );
        entries.insert(
            StateKey::ResourceInstance(resource.addr.clone()).encode(),
            encode_json(&InstanceObject {
                provider: resource.provider.clone(),
                attributes: resource.attributes.clone(),
                protected: resource.protected,
            })?,
        );
    }

    for (name, output) in &state.outputs {
        let addr = tofu_core::OutputValue::parse_name(name).map_err(|e| {
            StateError::InvalidEntry {
                key: format!("output.{}", name),
                message: e.to_string(),
            }
        })?;
        entries.insert(StateKey::RootOutputValue(addr).encode(), encode_json(output)?);
    }

    Ok(entries)
}

/// Rebuild a snapshot from storage entries
fn unflatten(entries: &HashMap<Key, Value>) -> StateResult<Option<StateFile>> {
    let mut meta = None;
    let mut resources = Vec::new();
    let mut outputs = BTreeMap::new();

    for (key, value) in entries {
        match StateKey::try_from(key)? {
            StateKey::SnapshotMeta => meta = Some(decode_json::<SnapshotMeta>(key, value)?),
            StateKey::Resource(_) => {
                // Resource keys carry no data the snapshot needs, but must be well formed
                decode_json::<ResourceMeta>(key, value)?;
            }
            StateKey::ResourceInstance(addr) => {
                let object: InstanceObject = decode_json(key, value)?;
                resources.push(ResourceState {
                    addr,
                    provider: object.provider,
                    attributes: object.attributes,
                    protected: object.protected,
                });
            }
            StateKey::RootOutputValue(addr) => {
                outputs.insert(addr.name, decode_json::<OutputState>(key, value)?);
            }
        }
    }

    let Some(meta) = meta else {
        if entries.is_empty() {
            return Ok(None);
        }
        return Err(StateError::MissingMetadata);
    };

    resources.sort_by_key(|r| r.addr.to_string());
    Ok(Some(StateFile {
        version: meta.version,
        serial: meta.serial,
        lineage: meta.lineage,
        tofu_version: meta.tofu_version,
        resources,
        outputs,
    }))
}

/// A snapshot as loaded from storage
#[derive(Debug)]
pub struct LoadedState {
    /// `None` when the storage holds no state at all
    pub state: Option<StateFile>,
    /// Hash of every entry the snapshot was built from
    pub hashes: HashMap<Key, ValueHash>,
}

/// Options for [`StateManager::write_state`]
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Skip the lineage and serial checks
    pub force: bool,
}

/// Reads and writes whole snapshots through a [`Storage`]
pub struct StateManager {
    storage: Arc<dyn Storage>,
    locker: StateLocker,
}

impl StateManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            locker: StateLocker::new(storage.clone()),
            storage,
        }
    }

    pub fn locker(&self) -> &StateLocker {
        &self.locker
    }

    async fn list_keys(&self) -> StateResult<Vec<StateKey>> {
        let keys = collect_key_set(self.storage.keys().await)?;
        keys.iter()
            .map(|key| StateKey::try_from(key).map_err(StateError::from))
            .collect()
    }

    /// Lock `initial`, then keep locking whatever else storage lists until
    /// every stored key is held
    ///
    /// Keys are listed again after each lock, so anything another process
    /// wrote before our lock took effect is covered too. On error every lock
    /// taken here is released.
    async fn lock_all(
        &self,
        initial: BTreeSet<StateKey>,
        exclusive: bool,
    ) -> StateResult<Vec<StateKey>> {
        let mut held: BTreeSet<StateKey> = BTreeSet::new();
        let mut pending = initial;
        loop {
            if !pending.is_empty() {
                let batch: Vec<StateKey> = pending.iter().cloned().collect();
                let locked = if exclusive {
                    self.locker.lock(Vec::new(), batch).await
                } else {
                    self.locker.lock(batch, Vec::new()).await
                };
                if let Err(e) = locked {
                    self.release_quietly(held).await;
                    return Err(e.into());
                }
                held.append(&mut pending);
            }

            let listed = match self.list_keys().await {
                Ok(listed) => listed,
                Err(e) => {
                    self.release_quietly(held).await;
                    return Err(e);
                }
            };
            pending = listed.into_iter().filter(|key| !held.contains(key)).collect();
            if pending.is_empty() {
                return Ok(held.into_iter().collect());
            }
            log::debug!("{} state keys appeared while locking", pending.len());
        }
    }

    async fn release_quietly(&self, held: BTreeSet<StateKey>) {
        if held.is_empty() {
            return;
        }
        if let Err(e) = self.locker.unlock(held).await {
            log::warn!("Failed to release state locks after an error: {}", e);
        }
    }

    /// Load the whole snapshot under shared locks
    ///
    /// All locks are released before returning. The returned hashes describe
    /// exactly what the snapshot was built from, so a later operation can
    /// tell whether anything changed in between.
    pub async fn read_state(&self) -> StateResult<LoadedState> {
        let keys = self.lock_all(BTreeSet::new(), false).await?;
        if keys.is_empty() {
            return Ok(LoadedState {
                state: None,
                hashes: HashMap::new(),
            });
        }

        let result = self.read_locked(&keys).await;
        let unlocked = self.locker.unlock(keys).await;

        let loaded = result?;
        unlocked?;
        Ok(loaded)
    }

    async fn read_locked(&self, keys: &[StateKey]) -> StateResult<LoadedState> {
        let wanted: KeySet = keys.iter().map(StateKey::encode).collect();
        let entries = self.storage.read(&wanted).await?;

        let state = unflatten(&entries)?;
        let hashes = entries
            .iter()
            .map(|(key, value)| (key.clone(), value.hash()))
            .collect();
        Ok(LoadedState { state, hashes })
    }

    /// Write a snapshot, replacing whatever is stored
    ///
    /// Every existing and new key is locked exclusively for the duration.
    /// Unless forced, the stored snapshot must share this snapshot's lineage
    /// and must not have a newer serial. On success `state.serial` has been
    /// bumped to the serial that was written.
    pub async fn write_state(&self, state: &mut StateFile, options: WriteOptions) -> StateResult<()> {
        let desired: BTreeSet<StateKey> = flatten(state)?
            .keys()
            .map(StateKey::try_from)
            .collect::<Result<_, _>>()?;
        let locked = self.lock_all(desired, true).await?;
        let result = self.write_locked(state, &locked, options).await;
        let unlocked = self.locker.unlock(locked).await;

        result?;
        unlocked?;
        log::info!("Wrote state serial {} ({})", state.serial, state.lineage);
        Ok(())
    }

    async fn write_locked(
        &self,
        state: &mut StateFile,
        locked: &[StateKey],
        options: WriteOptions,
    ) -> StateResult<()> {
        let meta_key = StateKey::SnapshotMeta.encode();
        let mut wanted = KeySet::new();
        wanted.insert(meta_key.clone());
        let stored = self.storage.read(&wanted).await?;

        let mut next_serial = state.serial;
        if let Some(value) = stored.get(&meta_key) {
            let meta: SnapshotMeta = decode_json(&meta_key, value)?;
            if meta.lineage != state.lineage && !options.force {
                return Err(StateError::LineageMismatch {
                    stored: meta.lineage,
                    local: state.lineage.clone(),
                });
            }
            if meta.serial > state.serial {
                if !options.force {
                    return Err(StateError::SerialRegression {
                        stored: meta.serial,
                        local: state.serial,
                    });
                }
                log::warn!(
                    "Overwriting newer stored state (serial {} > {})",
                    meta.serial,
                    state.serial
                );
                next_serial = meta.serial;
            }
        }

        let mut next = state.clone();
        next.serial = next_serial;
        next.increment_serial();
        let mut entries = flatten(&next)?;

        // Anything locked but no longer part of the snapshot is deleted
        for key in locked {
            entries.entry(key.encode()).or_insert_with(Value::default);
        }
        self.storage.write(entries).await?;

        *state = next;
        Ok(())
    }

    /// Release any remaining locks and close the storage
    pub async fn close(&self) -> StateResult<()> {
        self.locker.close().await?;
        self.storage.close().await?;
        Ok(())
    }
}
