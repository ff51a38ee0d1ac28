//! Unique-constraint marker records.
//!
//! A marker is a derived side-record whose existence signals that one
//! combination of unique field values is taken. Its name starts with
//! the owning model followed by `|`, and it carries a back-reference to
//! the owning instance plus a creation timestamp.
//!
//! Back-references come in two encodings: the structured form (a
//! [`Key`] object) and a legacy flat string left behind by an older
//! writer. Handlers normalize the legacy form before comparing owners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Entity, Key, StoreError};

/// Reserved kind holding marker records.
pub const MARKER_KIND: &str = "__unimark_marker";

/// A marker's pointer back to its owning instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BackRef {
    /// Structured reference.
    Key(Key),
    /// Legacy string-encoded reference (`kind/name` flattened to one
    /// string by an older writer).
    Legacy(String),
}

impl BackRef {
    /// Resolve to a structured key, decoding the legacy form.
    #[must_use]
    pub fn normalized(&self) -> Option<Key> {
        match self {
            Self::Key(key) => Some(key.clone()),
            Self::Legacy(encoded) => Key::decode(encoded),
        }
    }

    /// Whether this is the legacy string encoding.
    #[must_use]
    pub const fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy(_))
    }
}

/// One persisted marker.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerRecord {
    /// Marker name: `<model>|<identifier>`.
    pub name: String,

    /// Back-reference to the owning instance. `None` when the property
    /// is absent or empty.
    pub instance: Option<BackRef>,

    /// Creation time.
    pub created: DateTime<Utc>,
}

impl MarkerRecord {
    /// Create a marker owned by `owner`, timestamped now.
    #[must_use]
    pub fn new(name: &str, owner: Key) -> Self {
        Self {
            name: name.to_string(),
            instance: Some(BackRef::Key(owner)),
            created: Utc::now(),
        }
    }

    /// Store key for a marker name.
    #[must_use]
    pub fn key(name: &str) -> Key {
        Key::new(MARKER_KIND, name)
    }

    /// Whether this marker was derived for `model`.
    #[must_use]
    pub fn belongs_to_model(&self, model: &str) -> bool {
        self.name
            .strip_prefix(model)
            .is_some_and(|rest| rest.starts_with('|'))
    }

    /// Encode into a store entity.
    ///
    /// # Errors
    ///
    /// Propagates codec failures.
    pub fn to_entity(&self) -> Result<Entity, StoreError> {
        let mut entity = Entity::new(Self::key(&self.name));
        if let Some(instance) = &self.instance {
            entity
                .props
                .insert("instance".to_string(), serde_json::to_value(instance)?);
        }
        entity
            .props
            .insert("created".to_string(), serde_json::to_value(self.created)?);
        Ok(entity)
    }

    /// Decode from a store entity. An absent, null, or empty-string
    /// `instance` property reads as `None`; a missing `created`
    /// property reads as the epoch.
    ///
    /// # Errors
    ///
    /// Fails on malformed properties.
    pub fn from_entity(entity: &Entity) -> Result<Self, StoreError> {
        let instance = match entity.props.get("instance") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) if s.is_empty() => None,
            Some(value) => Some(serde_json::from_value(value.clone())?),
        };
        let created = match entity.props.get("created") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => DateTime::UNIX_EPOCH,
        };
        Ok(Self {
            name: entity.key.name.clone(),
            instance,
            created,
        })
    }
}
