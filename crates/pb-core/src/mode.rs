//! Mode-transition automaton.
//!
//! The configured mode pins the automaton: `disk` stays in `Database`,
//! `memory` stays in `Memory`, and only `hybrid` moves between states.

use pb_common::{BufferMode, BufferState, DataStore, More};
use tracing::info;

use crate::logging::event_names;

/// Why the automaton moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The uploader drained the database.
    UploadDone,
    /// Database backlog sent and no database writer in flight.
    DatabaseDrained,
    /// Arena full after eviction was exhausted.
    ArenaFull,
    /// Arena data exceeded its age limit and was flushed.
    AgeExceeded,
    /// All three stores are empty.
    MemoryDrained,
    /// Shutdown flush.
    Flush,
}

impl Transition {
    fn as_str(&self) -> &'static str {
        match self {
            Transition::UploadDone => "upload_done",
            Transition::DatabaseDrained => "database_drained",
            Transition::ArenaFull => "arena_full",
            Transition::AgeExceeded => "age_exceeded",
            Transition::MemoryDrained => "memory_drained",
            Transition::Flush => "flush",
        }
    }
}

/// Current state, configured mode, and the mode-change counter.
#[derive(Debug, Clone)]
pub struct ModeController {
    mode: BufferMode,
    state: BufferState,
    changes: u64,
    disabled: bool,
}

impl ModeController {
    /// Initial state for `mode`. A hybrid buffer with unsent database rows
    /// starts in `Database` so the backlog is uploaded first.
    pub fn new(mode: BufferMode, backlog: bool) -> Self {
        let state = match mode {
            BufferMode::Disk => BufferState::Database,
            BufferMode::Memory => BufferState::Memory,
            BufferMode::Hybrid if backlog => BufferState::Database,
            BufferMode::Hybrid => BufferState::Memory,
        };
        ModeController {
            mode,
            state,
            changes: 0,
            disabled: false,
        }
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Number of state changes so far.
    pub fn changes(&self) -> u64 {
        self.changes
    }

    /// Store receiving new writes.
    pub fn write_store(&self) -> DataStore {
        if self.disabled {
            return DataStore::Database;
        }
        self.state.write_store()
    }

    /// Store serving uploads.
    pub fn read_store(&self) -> DataStore {
        self.state.read_store()
    }

    fn set_state(&mut self, next: BufferState, reason: Transition) -> bool {
        if self.state == next {
            return false;
        }
        info!(
            event = event_names::STATE_CHANGED,
            from = %self.state,
            to = %next,
            reason = reason.as_str(),
            "buffer state changed"
        );
        self.state = next;
        self.changes += 1;
        true
    }

    fn is_dynamic(&self) -> bool {
        self.mode == BufferMode::Hybrid && !self.disabled
    }

    /// The uploader's per-cycle report.
    pub fn update_state(&mut self, more: More) -> bool {
        if self.is_dynamic() && self.state == BufferState::Database && more == More::Done {
            return self.set_state(BufferState::DatabaseToMemory, Transition::UploadDone);
        }
        false
    }

    /// Move on from a transitional state once its drain condition holds.
    pub fn try_advance(&mut self, database_drained: bool, memory_empty: bool) -> bool {
        if self.mode != BufferMode::Hybrid {
            return false;
        }
        match self.state {
            BufferState::DatabaseToMemory if database_drained && !self.disabled => {
                self.set_state(BufferState::Memory, Transition::DatabaseDrained)
            }
            BufferState::MemoryToDatabase if memory_empty => {
                self.set_state(BufferState::Database, Transition::MemoryDrained)
            }
            _ => false,
        }
    }

    /// An append failed with nothing left to evict.
    pub fn on_arena_full(&mut self) -> bool {
        if self.is_dynamic() && self.state == BufferState::Memory {
            return self.set_state(BufferState::MemoryToDatabase, Transition::ArenaFull);
        }
        false
    }

    /// Arena content is being moved to the database.
    pub fn on_flush(&mut self, reason: Transition) -> bool {
        if self.mode != BufferMode::Hybrid {
            return false;
        }
        self.set_state(BufferState::Database, reason)
    }

    /// Freeze the automaton and route every new write to the database.
    pub fn disable(&mut self) {
        self.disabled = true;
    }
}
