//! Introspection snapshots.

use pb_common::{BufferMode, BufferState, DataStore};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Arena usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct MemoryUsage {
    /// Bytes taken by records and boundary tags.
    pub used: u64,
    /// Arena size; 0 in disk mode.
    pub total: u64,
    /// Bytes available in free chunks.
    pub free: u64,
    /// Records resident across all stores.
    pub records: u64,
}

impl MemoryUsage {
    /// Used fraction in [0, 1].
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used as f64 / self.total as f64
    }
}

/// Buffer health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BufferHealth {
    pub mode: BufferMode,
    pub state: BufferState,
    /// Store receiving new writes.
    pub store: DataStore,
    /// State changes since startup.
    pub changes: u64,
}

/// Per-kind id milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Watermarks {
    /// Acknowledged upstream.
    pub sent: u64,
    /// Committed to the database.
    pub db: u64,
    /// Appended to the arena.
    pub mem: u64,
}

/// Combined snapshot printed by the operator binary.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BufferStats {
    pub schema_version: String,
    pub memory: MemoryUsage,
    pub health: BufferHealth,
}
