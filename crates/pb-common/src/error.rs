//! Error types for the proxy buffer.
//!
//! This module provides structured error handling with:
//! - Stable error codes for machine parsing
//! - Category classification for error grouping
//! - Recoverability hints for automation
//! - Remediation suggestions for operators
//!
//! Collector and uploader entry points never surface these errors; they are
//! returned from startup, configuration, and operator tooling paths.
//!
//! ```text
//! ✗ Configuration Error
//!   Reason: configuration error: memory_size is required in hybrid mode
//!   Fix: Run 'pb-core config check' to validate the buffer configuration.
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for proxy buffer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration file and parameter errors.
    Config,
    /// Arena creation and capacity errors.
    Arena,
    /// Database collaborator errors.
    Database,
    /// Buffer state and record handling errors.
    Buffer,
    /// File I/O and serialization errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Arena => write!(f, "arena"),
            ErrorCategory::Database => write!(f, "database"),
            ErrorCategory::Buffer => write!(f, "buffer"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Unified error type for the proxy buffer.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("configuration file not found: {0}")]
    ConfigNotFound(String),

    // Arena errors (20-29)
    #[error("cannot create arena: {0}")]
    ArenaCreate(String),

    #[error("record of {size} bytes exceeds arena capacity of {capacity} bytes")]
    RecordTooLarge { size: u64, capacity: u64 },

    // Database errors (30-39)
    #[error("database unavailable: {0}")]
    DatabaseUnavailable(String),

    #[error("database operation failed: {0}")]
    Database(String),

    // Buffer errors (40-49)
    #[error("malformed {kind} record: {message}")]
    MalformedRecord { kind: String, message: String },

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Configuration errors
    /// - 20-29: Arena errors
    /// - 30-39: Database errors
    /// - 40-49: Buffer errors
    /// - 60-69: I/O errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidValue { .. } => 11,
            Error::ConfigNotFound(_) => 12,
            Error::ArenaCreate(_) => 20,
            Error::RecordTooLarge { .. } => 21,
            Error::DatabaseUnavailable(_) => 30,
            Error::Database(_) => 31,
            Error::MalformedRecord { .. } => 40,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::InvalidValue { .. } | Error::ConfigNotFound(_) => {
                ErrorCategory::Config
            }
            Error::ArenaCreate(_) | Error::RecordTooLarge { .. } => ErrorCategory::Arena,
            Error::DatabaseUnavailable(_) | Error::Database(_) => ErrorCategory::Database,
            Error::MalformedRecord { .. } => ErrorCategory::Buffer,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Returns whether this error is potentially recoverable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Config(_) => true,
            Error::InvalidValue { .. } => true,
            Error::ConfigNotFound(_) => true,

            Error::ArenaCreate(_) => false,
            Error::RecordTooLarge { .. } => false, // the record is dropped

            Error::DatabaseUnavailable(_) => true, // retried until it comes back
            Error::Database(_) => false,

            Error::MalformedRecord { .. } => false,

            Error::Io(_) => true,
            Error::Json(_) => false,
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::InvalidValue { .. } => {
                "Run 'pb-core config check' to validate the buffer configuration."
            }
            Error::ConfigNotFound(_) => {
                "Check the path, or unset PB_CONFIG to fall back to the default search order."
            }
            Error::ArenaCreate(_) => {
                "Increase memory_size to at least 128K, or switch the mode to disk."
            }
            Error::RecordTooLarge { .. } => {
                "Increase memory_size so a single record fits, or use hybrid mode."
            }
            Error::DatabaseUnavailable(_) => {
                "Check that the proxy database is reachable. Writes are retried until it recovers."
            }
            Error::Database(_) => {
                "Inspect the database logs. The affected batch was not committed."
            }
            Error::MalformedRecord { .. } => {
                "Internal record layout mismatch. Report as a bug with the log excerpt."
            }
            Error::Io(_) => "Check file permissions and that the configuration directory exists.",
            Error::Json(_) => "Invalid JSON produced or consumed. Report as a bug.",
        }
    }

    /// Returns a short headline for human-readable output.
    pub fn headline(&self) -> &'static str {
        match self {
            Error::Config(_) => "Configuration Error",
            Error::InvalidValue { .. } => "Invalid Configuration Value",
            Error::ConfigNotFound(_) => "Configuration Not Found",
            Error::ArenaCreate(_) => "Arena Creation Failed",
            Error::RecordTooLarge { .. } => "Record Too Large",
            Error::DatabaseUnavailable(_) => "Database Unavailable",
            Error::Database(_) => "Database Error",
            Error::MalformedRecord { .. } => "Malformed Record",
            Error::Io(_) => "I/O Error",
            Error::Json(_) => "JSON Error",
        }
    }
}

/// Structured error response for JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Stable error code.
    pub code: u32,

    /// Error category for grouping.
    pub category: ErrorCategory,

    /// Human-readable error message.
    pub message: String,

    /// Whether the error is potentially recoverable.
    pub recoverable: bool,

    /// Additional structured context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        let mut context = HashMap::new();

        match err {
            Error::InvalidValue { field, .. } => {
                context.insert("field".to_string(), serde_json::json!(field));
            }
            Error::RecordTooLarge { size, capacity } => {
                context.insert("size".to_string(), serde_json::json!(size));
                context.insert("capacity".to_string(), serde_json::json!(capacity));
            }
            Error::MalformedRecord { kind, .. } => {
                context.insert("kind".to_string(), serde_json::json!(kind));
            }
            _ => {}
        }

        StructuredError {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            context,
        }
    }
}

impl StructuredError {
    /// Add additional context to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"serialization_failed"}}"#, self.code)
        })
    }
}

/// Format an error for human-readable stderr output.
pub fn format_error_human(err: &Error, use_color: bool) -> String {
    let (red, cyan, reset) = if use_color {
        ("\x1b[31m", "\x1b[36m", "\x1b[0m")
    } else {
        ("", "", "")
    };

    format!(
        "{red}✗{reset} {headline}\n  Reason: {message}\n  {cyan}Fix:{reset} {remediation}",
        headline = err.headline(),
        message = err,
        remediation = err.remediation()
    )
}
