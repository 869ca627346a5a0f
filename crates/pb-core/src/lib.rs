//! Proxy Buffer Core Library
//!
//! Buffers monitoring records (history values, discovery results and
//! auto-registration requests) between collection and upload:
//! - Arena-backed per-kind record stores
//! - The disk/memory/hybrid mode automaton
//! - Write handle tracking for gap-free uploads
//! - A database abstraction with an in-process implementation
//!
//! The operator binary entry point is in `main.rs`.

pub mod buffer;
pub mod db;
pub mod exit_codes;
pub mod handles;
pub mod logging;
pub mod mode;
pub mod stats;
pub mod store;

pub use buffer::{parse_mode, ProxyBuffer, RowBatch, WriteHandle};
pub use db::{Database, DbError, InMemoryDatabase, Transaction, Unsent};
pub use mode::{ModeController, Transition};
pub use stats::{BufferHealth, BufferStats, MemoryUsage, Watermarks};
pub use store::BufferRecord;

