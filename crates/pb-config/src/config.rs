//! Buffer configuration file format.

use pb_common::BufferMode;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

use crate::validate::{ValidationError, ValidationResult};

/// Proxy buffer settings, read from `buffer.toml`.
///
/// ```toml
/// mode = "hybrid"
/// memory_size = "16M"
/// memory_age = 3600
/// offline_buffer = 24
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferConfig {
    /// Backing store policy.
    #[serde(deserialize_with = "deserialize_mode")]
    pub mode: BufferMode,

    /// Arena size in bytes. Accepts an integer or a string with a K/M/G suffix.
    #[serde(deserialize_with = "deserialize_size")]
    pub memory_size: u64,

    /// Maximum age in seconds of arena data before it is flushed to the
    /// database. 0 disables the check.
    pub memory_age: u64,

    /// Hours of data kept while the upstream server is unreachable.
    pub offline_buffer: u32,

    /// Hours of data kept in the database after upload.
    pub local_buffer: u32,

    /// Delay between database retries.
    pub db_retry_delay_ms: u64,

    /// Upper bound on how long a reader waits for in-flight writers.
    pub gap_wait_ms: u64,

    /// Poll interval of a gap wait.
    pub gap_poll_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            mode: BufferMode::Disk,
            memory_size: 0,
            memory_age: 0,
            offline_buffer: 1,
            local_buffer: 0,
            db_retry_delay_ms: 10_000,
            gap_wait_ms: 1_000,
            gap_poll_ms: 10,
        }
    }
}

impl BufferConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> ValidationResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ValidationError::IoError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> ValidationResult<Self> {
        toml::from_str(content)
            .map_err(|e| ValidationError::ParseError(format!("Invalid TOML: {}", e)))
    }

    /// Offline buffer period in seconds.
    pub fn offline_buffer_secs(&self) -> u64 {
        u64::from(self.offline_buffer) * 3600
    }
}

/// Parse a size such as `128K`, `16M`, `2G`, or a plain byte count.
pub fn parse_size(value: &str) -> ValidationResult<u64> {
    let value = value.trim();
    let (digits, factor) = match value.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => {
            let factor = match c.to_ascii_uppercase() {
                'K' => 1u64 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                'T' => 1 << 40,
                _ => {
                    return Err(ValidationError::InvalidValue {
                        field: "memory_size".to_string(),
                        message: format!("unknown size suffix in \"{}\"", value),
                    })
                }
            };
            (&value[..idx], factor)
        }
        _ => (value, 1),
    };

    let number: u64 = digits.trim().parse().map_err(|_| ValidationError::InvalidValue {
        field: "memory_size".to_string(),
        message: format!("\"{}\" is not a size", value),
    })?;

    number
        .checked_mul(factor)
        .ok_or_else(|| ValidationError::InvalidValue {
            field: "memory_size".to_string(),
            message: format!("\"{}\" overflows", value),
        })
}

fn deserialize_mode<'de, D>(deserializer: D) -> Result<BufferMode, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    BufferMode::parse(&raw).map_err(serde::de::Error::custom)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Bytes(u64),
    Text(String),
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match SizeValue::deserialize(deserializer)? {
        SizeValue::Bytes(n) => Ok(n),
        SizeValue::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}
