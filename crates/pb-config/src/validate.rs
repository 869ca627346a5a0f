//! Configuration validation errors and semantic validation.

use pb_common::BufferMode;
use thiserror::Error;

use crate::config::BufferConfig;

/// Validation result type.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Smallest arena accepted in memory and hybrid modes.
pub const MIN_MEMORY_SIZE: u64 = 128 * 1024;

/// Largest arena accepted.
pub const MAX_MEMORY_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Smallest non-zero `memory_age`, in seconds.
pub const MIN_MEMORY_AGE: u64 = 600;

/// Largest `memory_age`, in seconds.
pub const MAX_MEMORY_AGE: u64 = 10 * 86_400;

/// Largest `offline_buffer` and `local_buffer`, in hours.
pub const MAX_BUFFER_HOURS: u32 = 720;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Semantic validation failed: {0}")]
    SemanticError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl ValidationError {
    /// Error code for structured error reporting, in the configuration range.
    pub fn code(&self) -> u32 {
        match self {
            ValidationError::IoError(_) => 12,
            ValidationError::ParseError(_) => 13,
            ValidationError::SemanticError(_) => 14,
            ValidationError::MissingField(_) => 15,
            ValidationError::InvalidValue { .. } => 11,
        }
    }
}

impl From<ValidationError> for pb_common::Error {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::IoError(msg) => pb_common::Error::ConfigNotFound(msg),
            ValidationError::InvalidValue { field, message } => {
                pb_common::Error::InvalidValue { field, message }
            }
            other => pb_common::Error::Config(other.to_string()),
        }
    }
}

/// Validate a buffer configuration semantically.
pub fn validate_buffer_config(config: &BufferConfig) -> ValidationResult<()> {
    validate_hours("offline_buffer", config.offline_buffer, 1)?;
    validate_hours("local_buffer", config.local_buffer, 0)?;

    match config.mode {
        BufferMode::Disk => {
            if config.memory_size != 0 {
                return Err(ValidationError::SemanticError(
                    "memory_size must be 0 in disk mode".to_string(),
                ));
            }
        }
        BufferMode::Memory | BufferMode::Hybrid => {
            if config.memory_size == 0 {
                return Err(ValidationError::MissingField(format!(
                    "memory_size is required in {} mode",
                    config.mode
                )));
            }
            if !(MIN_MEMORY_SIZE..=MAX_MEMORY_SIZE).contains(&config.memory_size) {
                return Err(ValidationError::InvalidValue {
                    field: "memory_size".to_string(),
                    message: format!(
                        "must be between 128K and 2G, got {}",
                        config.memory_size
                    ),
                });
            }
            if config.local_buffer != 0 {
                return Err(ValidationError::SemanticError(format!(
                    "local_buffer must be 0 in {} mode",
                    config.mode
                )));
            }
        }
    }

    if config.memory_age != 0 {
        if config.mode != BufferMode::Hybrid {
            return Err(ValidationError::SemanticError(
                "memory_age is only supported in hybrid mode".to_string(),
            ));
        }
        if !(MIN_MEMORY_AGE..=MAX_MEMORY_AGE).contains(&config.memory_age) {
            return Err(ValidationError::InvalidValue {
                field: "memory_age".to_string(),
                message: format!(
                    "must be 0 or between {} and {} seconds, got {}",
                    MIN_MEMORY_AGE, MAX_MEMORY_AGE, config.memory_age
                ),
            });
        }
        if config.memory_age >= config.offline_buffer_secs() {
            return Err(ValidationError::SemanticError(format!(
                "memory_age ({}s) must be less than offline_buffer ({}h)",
                config.memory_age, config.offline_buffer
            )));
        }
    }

    if config.gap_poll_ms == 0 {
        return Err(ValidationError::InvalidValue {
            field: "gap_poll_ms".to_string(),
            message: "must be positive".to_string(),
        });
    }

    Ok(())
}

fn validate_hours(field: &str, value: u32, min: u32) -> ValidationResult<()> {
    if value < min || value > MAX_BUFFER_HOURS {
        return Err(ValidationError::InvalidValue {
            field: field.to_string(),
            message: format!("must be in [{}, {}] hours, got {}", min, MAX_BUFFER_HOURS, value),
        });
    }
    Ok(())
}
