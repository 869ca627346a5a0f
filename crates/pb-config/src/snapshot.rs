//! Configuration snapshots for startup logging and operator checks.
//!
//! A snapshot captures the effective configuration together with where it
//! came from, so two proxies can be compared by hash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::BufferConfig;
use crate::resolve::ConfigSource;

/// A frozen snapshot of configuration state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// When this snapshot was taken.
    pub timestamp: DateTime<Utc>,

    /// Schema version of the configuration.
    pub schema_version: String,

    /// Path the configuration was loaded from.
    #[serde(default)]
    pub path: Option<String>,

    /// Source of the configuration.
    pub source: String,

    /// SHA-256 hash of the file content.
    #[serde(default)]
    pub content_hash: Option<String>,

    /// Hash of the effective values (for quick comparison).
    pub effective_hash: String,

    /// Effective values after defaults were applied.
    pub effective: BufferConfig,
}

impl ConfigSnapshot {
    /// Create a snapshot of a configuration loaded from a file.
    pub fn from_file(
        config: &BufferConfig,
        path: &std::path::Path,
        source: &ConfigSource,
        content: &str,
    ) -> Self {
        ConfigSnapshot {
            timestamp: Utc::now(),
            schema_version: crate::CONFIG_SCHEMA_VERSION.to_string(),
            path: Some(path.display().to_string()),
            source: source.to_string(),
            content_hash: Some(hash_content(content)),
            effective_hash: effective_hash(config),
            effective: config.clone(),
        }
    }

    /// Create a snapshot with only defaults (no config file loaded).
    pub fn defaults_only() -> Self {
        let config = BufferConfig::default();
        ConfigSnapshot {
            timestamp: Utc::now(),
            schema_version: crate::CONFIG_SCHEMA_VERSION.to_string(),
            path: None,
            source: ConfigSource::BuiltinDefault.to_string(),
            content_hash: None,
            effective_hash: effective_hash(&config),
            effective: config,
        }
    }

    /// Serialize snapshot to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Check if this snapshot has the same effective values as another.
    pub fn matches(&self, other: &ConfigSnapshot) -> bool {
        self.effective_hash == other.effective_hash
    }

    /// Get a short identifier for this snapshot (first 12 chars of hash).
    pub fn short_id(&self) -> &str {
        &self.effective_hash[..12.min(self.effective_hash.len())]
    }
}

fn effective_hash(config: &BufferConfig) -> String {
    let canonical = serde_json::to_string(config).unwrap_or_default();
    hash_content(&canonical)
}

/// Hash content with SHA-256 and return hex string.
fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
