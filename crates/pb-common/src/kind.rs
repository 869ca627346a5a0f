//! Record kinds, buffer modes, and automaton states.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Independently buffered telemetry categories.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Item history samples.
    History,
    /// Network discovery results.
    Discovery,
    /// Active agent auto-registration events.
    AutoRegistration,
}

impl RecordKind {
    /// All kinds, in upload order.
    pub const ALL: [RecordKind; 3] = [
        RecordKind::History,
        RecordKind::Discovery,
        RecordKind::AutoRegistration,
    ];

    /// Database table holding this kind.
    pub fn table_name(&self) -> &'static str {
        match self {
            RecordKind::History => "proxy_history",
            RecordKind::Discovery => "proxy_dhistory",
            RecordKind::AutoRegistration => "proxy_autoreg_host",
        }
    }

    /// Position when several kinds hold a record with the same clock.
    /// Lower ranks are evicted first.
    pub fn eviction_rank(&self) -> u8 {
        match self {
            RecordKind::AutoRegistration => 0,
            RecordKind::History => 1,
            RecordKind::Discovery => 2,
        }
    }

    /// Dense index for per-kind arrays.
    pub fn index(&self) -> usize {
        match self {
            RecordKind::History => 0,
            RecordKind::Discovery => 1,
            RecordKind::AutoRegistration => 2,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::History => write!(f, "history"),
            RecordKind::Discovery => write!(f, "discovery"),
            RecordKind::AutoRegistration => write!(f, "autoregistration"),
        }
    }
}

impl FromStr for RecordKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "history" => Ok(RecordKind::History),
            "discovery" => Ok(RecordKind::Discovery),
            "autoregistration" | "autoreg" => Ok(RecordKind::AutoRegistration),
            _ => Err(Error::Config(format!("unknown record kind: {}", s))),
        }
    }
}

/// Operator-configured policy constraining which states are reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BufferMode {
    /// Database only; the automaton is pinned to `Database`.
    #[default]
    Disk,
    /// Arena only; exhaustion discards the oldest data.
    Memory,
    /// Full automaton with database fallback.
    Hybrid,
}

impl BufferMode {
    /// Parse a configured mode. An empty value selects `Disk`.
    pub fn parse(value: &str) -> Result<Self, Error> {
        match value.trim() {
            "" | "disk" => Ok(BufferMode::Disk),
            "memory" => Ok(BufferMode::Memory),
            "hybrid" => Ok(BufferMode::Hybrid),
            other => Err(Error::Config(format!(
                "invalid buffer mode \"{}\": expected disk, memory, or hybrid",
                other
            ))),
        }
    }

    /// Whether this mode needs an arena.
    pub fn uses_memory(&self) -> bool {
        !matches!(self, BufferMode::Disk)
    }
}

impl FromStr for BufferMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BufferMode::parse(s)
    }
}

impl fmt::Display for BufferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferMode::Disk => write!(f, "disk"),
            BufferMode::Memory => write!(f, "memory"),
            BufferMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Backing store for one side of the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DataStore {
    Database,
    Memory,
}

impl fmt::Display for DataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataStore::Database => write!(f, "database"),
            DataStore::Memory => write!(f, "memory"),
        }
    }
}

/// Mode-transition automaton state.
///
/// | State | Writes | Reads |
/// |---|---|---|
/// | `Database` | database | database |
/// | `DatabaseToMemory` | memory | database |
/// | `Memory` | memory | memory |
/// | `MemoryToDatabase` | database | memory |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BufferState {
    Database,
    DatabaseToMemory,
    Memory,
    MemoryToDatabase,
}

impl BufferState {
    /// Store receiving new writes.
    pub fn write_store(&self) -> DataStore {
        match self {
            BufferState::Database | BufferState::MemoryToDatabase => DataStore::Database,
            BufferState::DatabaseToMemory | BufferState::Memory => DataStore::Memory,
        }
    }

    /// Store serving uploads.
    pub fn read_store(&self) -> DataStore {
        match self {
            BufferState::Database | BufferState::DatabaseToMemory => DataStore::Database,
            BufferState::Memory | BufferState::MemoryToDatabase => DataStore::Memory,
        }
    }
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferState::Database => write!(f, "database"),
            BufferState::DatabaseToMemory => write!(f, "database->memory"),
            BufferState::Memory => write!(f, "memory"),
            BufferState::MemoryToDatabase => write!(f, "memory->database"),
        }
    }
}

/// Whether an upload batch left more rows behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum More {
    Done,
    Available,
}

impl More {
    pub fn from_bool(more: bool) -> Self {
        if more {
            More::Available
        } else {
            More::Done
        }
    }
}
