//! Reconciler configuration.
//!
//! Everything the engine needs is carried in an explicit
//! [`ReconcilerConfig`] passed down into task payloads — there is no
//! ambient settings lookup. Loaded from TOML:
//!
//! ```toml
//! store_path = "unimark.db"
//! shard_count = 10
//!
//! [[models]]
//! name = "profile"
//! unique = [["email"], ["team", "handle"]]
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryConfig;

/// Top-level configuration for the reconciliation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Path of the durable store (used by the CLI's SQLite backend).
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Store alias recorded on action records and task payloads.
    #[serde(default = "default_alias")]
    pub alias: String,

    /// Number of shards a job's domain is partitioned into.
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,

    /// Entities fetched per scan batch; the cursor is persisted after
    /// every batch.
    #[serde(default = "default_scan_batch")]
    pub scan_batch: usize,

    /// Worker threads in the local task queue.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-entity retry policy for transient store errors inside a
    /// shard scan.
    #[serde(default)]
    pub entity_retry: RetryConfig,

    /// Whole-task redelivery policy; exhaustion dead-letters the shard
    /// and fails the job.
    #[serde(default)]
    pub task_retry: RetryConfig,

    /// Models the engine may reconcile, with their unique constraints.
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

/// One reconcilable model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name; also the primary entity kind in the store.
    pub name: String,

    /// Unique-constraint field combinations.
    pub unique: Vec<Vec<String>>,
}

const fn default_shard_count() -> u32 {
    10
}

const fn default_scan_batch() -> usize {
    250
}

const fn default_workers() -> usize {
    4
}

fn default_store_path() -> PathBuf {
    PathBuf::from("unimark.db")
}

fn default_alias() -> String {
    "default".to_string()
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            alias: default_alias(),
            shard_count: default_shard_count(),
            scan_batch: default_scan_batch(),
            workers: default_workers(),
            entity_retry: RetryConfig::default(),
            task_retry: RetryConfig::default(),
            models: Vec::new(),
        }
    }
}

impl ReconcilerConfig {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or
    /// validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a configured model.
    #[must_use]
    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_count == 0 {
            return Err(ConfigError::Validation(
                "shard_count must be at least 1".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::Validation(
                "workers must be at least 1".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if model.name.is_empty() {
                return Err(ConfigError::Validation("model name is empty".to_string()));
            }
            if model.name.starts_with("__") {
                return Err(ConfigError::Validation(format!(
                    "model name '{}' collides with reserved kinds",
                    model.name
                )));
            }
            if !seen.insert(model.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "model '{}' is declared twice",
                    model.name
                )));
            }
            if model.unique.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "model '{}' declares no unique constraints",
                    model.name
                )));
            }
            if model.unique.iter().any(|combo| combo.is_empty()) {
                return Err(ConfigError::Validation(format!(
                    "model '{}' has an empty unique-constraint combination",
                    model.name
                )));
            }
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_minimal_config() {
        let config = ReconcilerConfig::from_toml("").unwrap();
        assert_eq!(config.shard_count, 10);
        assert_eq!(config.scan_batch, 250);
        assert_eq!(config.alias, "default");
        assert!(config.models.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let toml = r#"
            store_path = "/var/lib/unimark/store.db"
            shard_count = 4
            workers = 2

            [entity_retry]
            max_attempts = 3

            [entity_retry.backoff]
            type = "fixed"
            delay = "10ms"

            [[models]]
            name = "profile"
            unique = [["email"], ["team", "handle"]]
        "#;
        let config = ReconcilerConfig::from_toml(toml).unwrap();
        assert_eq!(config.shard_count, 4);
        assert_eq!(config.entity_retry.max_attempts, 3);
        let model = config.model("profile").unwrap();
        assert_eq!(model.unique.len(), 2);
    }

    #[test]
    fn duplicate_model_rejected() {
        let toml = r#"
            [[models]]
            name = "profile"
            unique = [["email"]]

            [[models]]
            name = "profile"
            unique = [["handle"]]
        "#;
        let err = ReconcilerConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn reserved_model_name_rejected() {
        let toml = r#"
            [[models]]
            name = "__unimark_marker"
            unique = [["email"]]
        "#;
        assert!(ReconcilerConfig::from_toml(toml).is_err());
    }

    #[test]
    fn zero_shards_rejected() {
        assert!(ReconcilerConfig::from_toml("shard_count = 0").is_err());
    }

    #[test]
    fn empty_constraint_combo_rejected() {
        let toml = r#"
            [[models]]
            name = "profile"
            unique = [[]]
        "#;
        assert!(ReconcilerConfig::from_toml(toml).is_err());
    }
}
