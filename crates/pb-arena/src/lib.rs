//! Proxy buffer arena allocator.
//!
//! This crate provides:
//! - A bucketed sub-allocator over one fixed-size region
//! - Boundary-tag coalescing of freed neighbours
//! - Allocation statistics for memory usage reporting
//!
//! The allocator performs no internal locking. Callers serialize access,
//! normally by holding the proxy buffer lock.

pub mod arena;
pub mod stats;

pub use arena::{Arena, ArenaError, Chunk};
pub use stats::ArenaStats;

/// Allocation granularity in bytes.
pub const ALIGNMENT: u64 = 8;

/// Smallest payload handed out; a free chunk stores two list links in it.
pub const MIN_ALLOC: u64 = 16;

/// Number of free-list buckets. The last bucket holds all large chunks.
pub const BUCKET_COUNT: usize = 30;

/// Bytes of boundary tags around every chunk (header + footer).
pub const CHUNK_OVERHEAD: u64 = 16;
