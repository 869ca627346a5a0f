//! Proxy buffer configuration loading and validation.
//!
//! This crate provides:
//! - The typed `buffer.toml` format
//! - Config resolution (CLI → env → XDG → system → defaults)
//! - Semantic validation of mode, size, and age parameters
//! - Config snapshots for startup logging

pub mod config;
pub mod resolve;
pub mod snapshot;
pub mod validate;

use std::path::Path;

pub use config::{parse_size, BufferConfig};
pub use resolve::{resolve_config, ConfigPath, ConfigSource};
pub use snapshot::ConfigSnapshot;
pub use validate::{validate_buffer_config, ValidationError, ValidationResult};

/// Schema version for configuration files.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";

/// A resolved, parsed, and validated configuration.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: BufferConfig,
    pub snapshot: ConfigSnapshot,
}

/// Resolve, read, parse, and validate the buffer configuration.
pub fn load_config(cli_path: Option<&Path>) -> ValidationResult<LoadedConfig> {
    let resolved = resolve_config(cli_path);

    let Some(path) = resolved.path else {
        let config = BufferConfig::default();
        validate_buffer_config(&config)?;
        return Ok(LoadedConfig {
            config,
            snapshot: ConfigSnapshot::defaults_only(),
        });
    };

    let content = std::fs::read_to_string(&path).map_err(|e| {
        ValidationError::IoError(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let config = BufferConfig::from_toml_str(&content)?;
    validate_buffer_config(&config)?;

    let snapshot = ConfigSnapshot::from_file(&config, &path, &resolved.source, &content);
    Ok(LoadedConfig { config, snapshot })
}
