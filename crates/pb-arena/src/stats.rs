//! Allocator statistics.

use serde::{Deserialize, Serialize};

use crate::BUCKET_COUNT;

/// Point-in-time allocator statistics.
///
/// `free_size + used_size + overhead == total_size` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaStats {
    /// Region size in bytes.
    pub total_size: u64,

    /// Payload bytes in free chunks.
    pub free_size: u64,

    /// Payload bytes in allocated chunks.
    pub used_size: u64,

    /// Boundary tag bytes across all chunks.
    pub overhead: u64,

    /// Number of free chunks.
    pub free_chunks: u64,

    /// Number of allocated chunks.
    pub used_chunks: u64,

    /// Smallest free chunk payload, 0 when nothing is free.
    pub min_free_chunk: u64,

    /// Largest free chunk payload, 0 when nothing is free.
    pub max_free_chunk: u64,

    /// Free chunk count per bucket.
    pub chunks_per_bucket: Vec<u64>,
}

impl ArenaStats {
    /// Fraction of the region occupied by allocations and tags, in [0, 1].
    pub fn utilization(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.total_size - self.free_size) as f64 / self.total_size as f64
    }

    pub(crate) fn empty(total_size: u64) -> Self {
        ArenaStats {
            total_size,
            free_size: 0,
            used_size: 0,
            overhead: 0,
            free_chunks: 0,
            used_chunks: 0,
            min_free_chunk: 0,
            max_free_chunk: 0,
            chunks_per_bucket: vec![0; BUCKET_COUNT],
        }
    }
}
