//! Structured event vocabulary for logging.
//!
//! Buffer log lines that report a transition, a retry or lost data carry an
//! `event` field naming what happened.

/// Standard event names used in logging.
pub mod event_names {
    // Lifecycle
    pub const BUFFER_CREATED: &str = "buffer.created";
    pub const BUFFER_DISABLED: &str = "buffer.disabled";
    pub const BUFFER_FLUSHED: &str = "buffer.flushed";
    pub const BUFFER_DESTROYED: &str = "buffer.destroyed";
    pub const BACKLOG_FOUND: &str = "buffer.backlog_found";

    // Automaton
    pub const STATE_CHANGED: &str = "buffer.state_changed";

    // Capacity and age policy
    pub const EVICTED: &str = "buffer.evicted";
    pub const RECORD_DROPPED: &str = "buffer.record_dropped";
    pub const AGE_EXCEEDED: &str = "buffer.age_exceeded";
    pub const OFFLINE_DISCARDED: &str = "buffer.offline_discarded";
    pub const MALFORMED_RECORD: &str = "buffer.malformed_record";

    // Upload path
    pub const ROWS_READ: &str = "upload.rows_read";
    pub const LASTID_SET: &str = "upload.lastid_set";
    pub const LASTID_CLAMPED: &str = "upload.lastid_clamped";
    pub const GAP_WAIT: &str = "upload.gap_wait";
    pub const GAP_ACCEPTED: &str = "upload.gap_accepted";

    // Database
    pub const DB_RETRY: &str = "db.retry";
    pub const DB_BATCH_LOST: &str = "db.batch_lost";
    pub const DB_COMMITTED: &str = "db.committed";

    // Config
    pub const CONFIG_LOADED: &str = "config.loaded";
    pub const CONFIG_DEFAULT_USED: &str = "config.default_used";
    pub const CONFIG_ERROR: &str = "config.error";

    // CLI
    pub const COMMAND_FAILED: &str = "command.failed";
}
