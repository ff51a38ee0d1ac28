//! Marker-key derivation.
//!
//! Given an entity's current field values, [`MarkerKeyDeriver`] returns
//! the deterministic ordered set of marker names the entity should own.
//! The engine treats this as a pure function; [`UniqueConstraintSet`] is
//! the provided implementation, driven by per-model unique-constraint
//! declarations from configuration.
//!
//! Identifier format: `<model>|<field>:<value>|<field>:<value>`, fields
//! in declared order. Oversized values are replaced by their SHA-256
//! hex digest so marker names stay within key-size limits.

use std::collections::HashMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::ModelConfig;
use crate::store::Entity;

/// Values longer than this are hashed into the identifier.
const MAX_VALUE_LENGTH: usize = 100;

/// Collaborator deriving expected marker names from an entity's current
/// state.
pub trait MarkerKeyDeriver: Send + Sync {
    /// Deterministic ordered set of marker names for `entity` under
    /// `model`'s unique constraints. An unknown model derives nothing.
    fn derive(&self, model: &str, entity: &Entity) -> Vec<String>;
}

/// Declared unique-constraint field combinations, one list per model.
#[derive(Debug, Clone, Default)]
pub struct UniqueConstraintSet {
    combos: HashMap<String, Vec<Vec<String>>>,
}

impl UniqueConstraintSet {
    /// Empty set; deriving against it yields nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configured model declarations.
    #[must_use]
    pub fn from_models(models: &[ModelConfig]) -> Self {
        let mut set = Self::new();
        for model in models {
            for combo in &model.unique {
                set.declare(&model.name, combo);
            }
        }
        set
    }

    /// Declare one unique-constraint field combination for `model`.
    pub fn declare(&mut self, model: &str, fields: &[String]) {
        self.combos
            .entry(model.to_string())
            .or_default()
            .push(fields.to_vec());
    }
}

impl MarkerKeyDeriver for UniqueConstraintSet {
    fn derive(&self, model: &str, entity: &Entity) -> Vec<String> {
        let Some(combos) = self.combos.get(model) else {
            return Vec::new();
        };
        combos
            .iter()
            .map(|fields| {
                let mut parts = vec![model.to_string()];
                for field in fields {
                    let rendered = render_value(entity.props.get(field));
                    parts.push(format!("{field}:{rendered}"));
                }
                parts.join("|")
            })
            .collect()
    }
}

fn render_value(value: Option<&Value>) -> String {
    let rendered = match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    if rendered.len() > MAX_VALUE_LENGTH {
        let digest = Sha256::digest(rendered.as_bytes());
        digest.iter().fold(String::new(), |mut acc, byte| {
            use std::fmt::Write;
            let _ = write!(acc, "{byte:02x}");
            acc
        })
    } else {
        rendered
    }
}
