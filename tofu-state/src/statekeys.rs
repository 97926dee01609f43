//! State keys - Mapping typed addresses to storage keys and back
//!
//! Every storage key is `<namespace>|<address>`, where the namespace says
//! what kind of object the key tracks and the address is the canonical
//! string form of that object's address. The namespaces are part of the
//! persisted format and must never change meaning.

use std::fmt;

use thiserror::Error;
use tofu_core::{AbsResource, AbsResourceInstance, AddrError, OutputValue};

use crate::statestore::Key;

/// Separates the namespace prefix from the address
pub const DELIMITER: char = '|';

const NS_RESOURCE: &str = "rsrc";
const NS_RESOURCE_INSTANCE: &str = "rsrcinst";
const NS_OUTPUT: &str = "output";
const NS_META: &str = "meta";

const META_SNAPSHOT: &str = "snapshot";

/// A storage key that failed to parse
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("Invalid state key format '{raw}': missing '{}' delimiter", DELIMITER)]
    MissingDelimiter { raw: String },

    #[error("Invalid state key format '{raw}': unknown namespace '{namespace}'")]
    UnknownNamespace { raw: String, namespace: String },

    #[error("Invalid state key format '{raw}': {source}")]
    InvalidAddress {
        raw: String,
        #[source]
        source: AddrError,
    },

    #[error("Invalid state key format '{raw}': address is not in canonical form")]
    NonCanonical { raw: String },

    #[error("Invalid state key format '{raw}': key is not valid UTF-8")]
    InvalidUtf8 { raw: String },
}

/// The typed meaning of a storage key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateKey {
    /// Resource-level metadata, kept even when a resource has no instances
    Resource(AbsResource),
    /// One resource instance object
    ResourceInstance(AbsResourceInstance),
    /// A root module output value
    RootOutputValue(OutputValue),
    /// Snapshot-wide metadata: lineage, serial and format version
    SnapshotMeta,
}

impl StateKey {
    fn namespace(&self) -> &'static str {
        match self {
            StateKey::Resource(_) => NS_RESOURCE,
            StateKey::ResourceInstance(_) => NS_RESOURCE_INSTANCE,
            StateKey::RootOutputValue(_) => NS_OUTPUT,
            StateKey::SnapshotMeta => NS_META,
        }
    }

    fn address(&self) -> String {
        match self {
            StateKey::Resource(addr) => addr.to_string(),
            StateKey::ResourceInstance(addr) => addr.to_string(),
            StateKey::RootOutputValue(addr) => addr.name.clone(),
            StateKey::SnapshotMeta => META_SNAPSHOT.to_string(),
        }
    }

    /// Encode this key into its storage form
    pub fn encode(&self) -> Key {
        Key::from_canonical(format!(
            "{}{}{}",
            self.namespace(),
            DELIMITER,
            self.address()
        ))
    }

    /// Decode a raw storage key name
    pub fn decode(raw: &str) -> Result<Self, KeyError> {
        let (namespace, address) =
            raw.split_once(DELIMITER)
                .ok_or_else(|| KeyError::MissingDelimiter {
                    raw: raw.to_string(),
                })?;

        let invalid = |source: AddrError| KeyError::InvalidAddress {
            raw: raw.to_string(),
            source,
        };
        let key = match namespace {
            NS_RESOURCE => StateKey::Resource(address.parse().map_err(invalid)?),
            NS_RESOURCE_INSTANCE => {
                StateKey::ResourceInstance(address.parse().map_err(invalid)?)
            }
            NS_OUTPUT => StateKey::RootOutputValue(OutputValue::parse_name(address).map_err(invalid)?),
            NS_META if address == META_SNAPSHOT => StateKey::SnapshotMeta,
            NS_META => {
                return Err(invalid(AddrError {
                    input: address.to_string(),
                    position: 0,
                    message: format!("expected '{}'", META_SNAPSHOT),
                }));
            }
            other => {
                return Err(KeyError::UnknownNamespace {
                    raw: raw.to_string(),
                    namespace: other.to_string(),
                });
            }
        };

        // Keys are compared by name, so only the canonical spelling of an
        // address may be accepted.
        if key.address() != address {
            return Err(KeyError::NonCanonical {
                raw: raw.to_string(),
            });
        }
        Ok(key)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.namespace(), DELIMITER, self.address())
    }
}

impl From<AbsResourceInstance> for StateKey {
    fn from(addr: AbsResourceInstance) -> Self {
        StateKey::ResourceInstance(addr)
    }
}

impl From<AbsResource> for StateKey {
    fn from(addr: AbsResource) -> Self {
        StateKey::Resource(addr)
    }
}

impl TryFrom<&Key> for StateKey {
    type Error = KeyError;

    fn try_from(key: &Key) -> Result<Self, Self::Error> {
        StateKey::decode(key.name())
    }
}
