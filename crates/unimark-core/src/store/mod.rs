//! Entity store collaborator traits.
//!
//! The reconciliation engine never talks to a concrete database; it goes
//! through [`EntityStore`], which any ordered key-value backend can
//! implement. Two implementations exist in-tree: [`memory::InMemoryStore`]
//! (tests, demos) and the SQLite store in the `unimark-store` crate.
//!
//! Required capabilities, per backend:
//! - ordered key-range scan within one entity kind
//! - keys-only sampling (shard boundary selection)
//! - batch get / batch put / point delete
//! - a transactional read-modify-write scoped to a small set of keys
//!
//! All coordination records (action records, discrepancy logs, scan
//! cursors) live in the same store as the data being reconciled, under
//! reserved kinds, so a retried task observes exactly what a fresh one
//! would.

pub mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Key of an entity: a kind plus a name, ordered by name within a kind.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    /// Entity kind (table-equivalent).
    pub kind: String,

    /// Name within the kind; the store's natural sort order is the
    /// lexicographic order of names.
    pub name: String,
}

impl Key {
    /// Create a key from a kind and a name.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Encode as a single `kind/name` string.
    ///
    /// This is the wire form used for back-references and log fields.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }

    /// Decode a `kind/name` string produced by [`Self::encode`].
    #[must_use]
    pub fn decode(encoded: &str) -> Option<Self> {
        let (kind, name) = encoded.split_once('/')?;
        if kind.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(kind, name))
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A stored entity: key plus schemaless JSON properties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// The entity's key.
    pub key: Key,

    /// Property map. Field serialization is the backend's concern; the
    /// engine only reads and compares values.
    pub props: BTreeMap<String, serde_json::Value>,
}

impl Entity {
    /// Create an entity with no properties.
    #[must_use]
    pub fn new(key: Key) -> Self {
        Self {
            key,
            props: BTreeMap::new(),
        }
    }

    /// Set a property, builder style.
    #[must_use]
    pub fn with(mut self, name: &str, value: serde_json::Value) -> Self {
        self.props.insert(name.to_string(), value);
        self
    }

    /// Read a string property.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.props.get(name).and_then(serde_json::Value::as_str)
    }
}

/// Errors surfaced by store backends.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Transient backend condition (timeout, lock contention). Safe to
    /// retry with backoff.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Non-transient backend failure.
    #[error("store backend error: {0}")]
    Backend(String),

    /// Property encoding or decoding failure.
    #[error("entity codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A record that must exist inside a transaction was absent.
    #[error("record not found: {key}")]
    NotFound {
        /// Encoded key of the missing record.
        key: String,
    },
}

impl StoreError {
    /// Whether a retry with backoff may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Read-modify-write handle passed to [`EntityStore::transact`] closures.
///
/// Reads observe writes made earlier in the same transaction.
pub trait Transaction {
    /// Read one entity.
    fn get(&mut self, key: &Key) -> Result<Option<Entity>, StoreError>;

    /// Stage a write.
    fn put(&mut self, entity: Entity) -> Result<(), StoreError>;

    /// Stage a delete.
    fn delete(&mut self, key: &Key) -> Result<(), StoreError>;
}

/// Ordered key-value store abstraction the engine runs against.
///
/// Scan ranges are half-open on the left: `(after, until]`, both bounds
/// optional. Exclusive lower bounds make cursor resumption natural (a
/// cursor records the last key fully processed), and shard boundaries
/// are sampled existing keys, so an inclusive upper bound closes each
/// shard exactly at its boundary key.
pub trait EntityStore: Send + Sync {
    /// Scan up to `limit` entities of `kind` with names in
    /// `(after, until]`, in ascending name order.
    fn scan(
        &self,
        kind: &str,
        after: Option<&str>,
        until: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Entity>, StoreError>;

    /// Return up to `count` names of `kind`, evenly spread across the
    /// kind's key order. Used to pick shard split points; a short or
    /// empty result is valid for small domains.
    fn sample_keys(&self, kind: &str, count: usize) -> Result<Vec<String>, StoreError>;

    /// Batch read. The result is positionally aligned with `keys`.
    fn get_many(&self, keys: &[Key]) -> Result<Vec<Option<Entity>>, StoreError>;

    /// Batch write.
    fn put_many(&self, entities: &[Entity]) -> Result<(), StoreError>;

    /// Point delete. Deleting an absent key is a no-op.
    fn delete(&self, key: &Key) -> Result<(), StoreError>;

    /// Run `body` as an atomic read-modify-write. Either every staged
    /// write applies or none does. Implementations may serialize all
    /// transactions; callers keep the touched key set small.
    fn transact(
        &self,
        body: &mut dyn FnMut(&mut dyn Transaction) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
}

/// Encode a serializable record into an entity under `key`.
///
/// # Errors
///
/// Fails if the record does not serialize to a JSON object.
pub fn encode_record<T: Serialize>(key: Key, record: &T) -> Result<Entity, StoreError> {
    let value = serde_json::to_value(record)?;
    let serde_json::Value::Object(map) = value else {
        return Err(StoreError::Backend(format!(
            "record for {key} did not serialize to an object"
        )));
    };
    Ok(Entity {
        key,
        props: map.into_iter().collect(),
    })
}

/// Decode an entity's properties back into a record type.
///
/// # Errors
///
/// Fails if the properties do not match the record shape.
pub fn decode_record<T: serde::de::DeserializeOwned>(entity: &Entity) -> Result<T, StoreError> {
    let map: serde_json::Map<String, serde_json::Value> =
        entity.props.clone().into_iter().collect();
    Ok(serde_json::from_value(serde_json::Value::Object(map))?)
}

/// Bounds selecting every name with the given prefix, for use with
/// [`EntityStore::scan`].
///
/// Relies on the prefix containing no `0x7f` bytes, which holds for the
/// reserved-kind names the engine generates.
#[must_use]
pub fn prefix_bounds(prefix: &str) -> (String, String) {
    (prefix.to_string(), format!("{prefix}\u{7f}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encode_decode_round_trip() {
        let key = Key::new("profile", "user-1");
        assert_eq!(key.encode(), "profile/user-1");
        assert_eq!(Key::decode("profile/user-1"), Some(key));
    }

    #[test]
    fn key_decode_rejects_malformed() {
        assert_eq!(Key::decode("no-separator"), None);
        assert_eq!(Key::decode("/name-only"), None);
        assert_eq!(Key::decode("kind-only/"), None);
    }

    #[test]
    fn prefix_bounds_select_prefixed_names_only() {
        let (after, until) = prefix_bounds("job:");
        assert!("job:a".as_bytes() > after.as_bytes());
        assert!("job:zzz" < until.as_str());
        assert!("joc" > until.as_str() || !"joc".starts_with("job:"));
    }

    #[test]
    fn transient_classification() {
        assert!(StoreError::Transient("busy".into()).is_transient());
        assert!(!StoreError::Backend("corrupt".into()).is_transient());
    }
}
