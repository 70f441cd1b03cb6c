//! Point-in-time copies of the hop registry.
//!
//! A [`Snapshot`] is also the persisted/serialized result document.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::hop::GeoLocation;
use super::stats::HopStats;

/// Version of the serialized document layout
pub const SCHEMA_VERSION: u32 = 1;

/// Immutable copy of all hops plus run metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: u32,
    pub target: String,
    /// Resolved target address, empty until resolution finished
    pub target_ip: String,
    pub protocol: String,
    pub max_hops: u8,
    pub count: u64,
    /// Ordered by TTL
    pub hops: Vec<SnapshotHop>,
}

impl Snapshot {
    pub fn hop(&self, ttl: u8) -> Option<&SnapshotHop> {
        self.hops.iter().find(|h| h.ttl == ttl)
    }

    /// Lowest TTL whose latest response came from the destination
    pub fn reached_ttl(&self) -> Option<u8> {
        self.hops.iter().filter(|h| h.reached).map(|h| h.ttl).min()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHop {
    pub ttl: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub lost: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
    pub stats: SnapshotStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub sent: u64,
    pub received: u64,
    pub loss: f64,
    pub last_ms: u64,
    pub avg_ms: u64,
    pub best_ms: u64,
    pub worst_ms: u64,
    pub stddev_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history_ms: Vec<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub avg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub best: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub worst: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stddev: String,
}

impl SnapshotStats {
    pub fn from_stats(stats: &HopStats) -> Self {
        Self {
            sent: stats.sent,
            received: stats.received,
            loss: stats.loss,
            last_ms: duration_ms(stats.last),
            avg_ms: duration_ms(stats.avg),
            best_ms: duration_ms(stats.best),
            worst_ms: duration_ms(stats.worst),
            stddev_ms: duration_ms(stats.stddev),
            history_ms: stats.history.iter().copied().map(duration_ms).collect(),
            last: duration_label(stats.last),
            avg: duration_label(stats.avg),
            best: duration_label(stats.best),
            worst: duration_label(stats.worst),
            stddev: duration_label(stats.stddev),
        }
    }
}

/// Duration rounded to the nearest millisecond
pub fn duration_ms(d: Duration) -> u64 {
    ((d.as_micros() + 500) / 1000) as u64
}

/// "12ms", or empty for a zero duration
pub fn duration_label(d: Duration) -> String {
    if d.is_zero() {
        String::new()
    } else {
        format!("{}ms", duration_ms(d))
    }
}
