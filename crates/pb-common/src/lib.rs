//! Proxy buffer common types and errors.
//!
//! This crate provides the vocabulary shared by the buffer crates:
//! - Record kinds and their payload types
//! - Buffer modes and automaton states
//! - The unified error type with stable codes

pub mod error;
pub mod kind;
pub mod record;

pub use error::{format_error_human, Error, ErrorCategory, Result, StructuredError};
pub use kind::{BufferMode, BufferState, DataStore, More, RecordKind};
pub use record::{AutoregRecord, DiscoveryRecord, HistoryRecord};

/// Schema version for serialized snapshots.
pub const SCHEMA_VERSION: &str = "1.0.0";
