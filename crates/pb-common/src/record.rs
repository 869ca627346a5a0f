//! Record payloads buffered by the proxy.
//!
//! `id` is zero until the buffer assigns one. `clock` is the record's own
//! Unix timestamp in seconds and drives age checks and eviction order.

use serde::{Deserialize, Serialize};

/// An item value collected by a poller or trapper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: u64,
    pub itemid: u64,
    pub clock: i64,
    pub ns: i32,
    /// Log entry timestamp.
    pub timestamp: i64,
    pub severity: i32,
    pub logeventid: i32,
    pub lastlogsize: u64,
    pub mtime: i32,
    /// Item state (0 normal, 1 not supported).
    pub state: i32,
    pub flags: u32,
    /// When the value reached the buffer.
    pub write_clock: i64,
    pub value: String,
    /// Log source.
    pub source: String,
}

impl HistoryRecord {
    /// Minimal record for an item value.
    pub fn new(itemid: u64, clock: i64, value: impl Into<String>) -> Self {
        HistoryRecord {
            itemid,
            clock,
            write_clock: clock,
            value: value.into(),
            ..Default::default()
        }
    }
}

/// A discovery check result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub id: u64,
    pub clock: i64,
    pub druleid: u64,
    pub dcheckid: u64,
    pub port: u16,
    /// Service status (0 up, 1 down).
    pub status: i32,
    pub ip: String,
    pub dns: String,
    pub value: String,
    pub error: String,
}

impl DiscoveryRecord {
    /// Minimal record for a discovered address.
    pub fn new(druleid: u64, clock: i64, ip: impl Into<String>) -> Self {
        DiscoveryRecord {
            druleid,
            clock,
            ip: ip.into(),
            ..Default::default()
        }
    }
}

/// An active agent auto-registration request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoregRecord {
    pub id: u64,
    pub clock: i64,
    pub listen_port: u16,
    pub tls_accepted: u32,
    pub flags: u32,
    pub host: String,
    pub listen_ip: String,
    pub listen_dns: String,
    pub host_metadata: String,
}

impl AutoregRecord {
    /// Minimal record for a registering host.
    pub fn new(host: impl Into<String>, clock: i64) -> Self {
        AutoregRecord {
            host: host.into(),
            clock,
            ..Default::default()
        }
    }
}
