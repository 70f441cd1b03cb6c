use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use super::result::ProbeResult;
use super::snapshot::{SnapshotHop, SnapshotStats};
use super::stats::HopStats;

/// Geolocation of a responder, as reported by a geo resolver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
    /// Name of the resolver that produced this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Unparsed backend record, used when no field is known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

/// Backends use "0" as a placeholder for unknown fields
fn meaningful(field: &Option<String>) -> Option<&str> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "0")
}

impl fmt::Display for GeoLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = [&self.country, &self.province, &self.city, &self.isp]
            .into_iter()
            .filter_map(meaningful)
            .collect();
        if !parts.is_empty() {
            return f.write_str(&parts.join(" "));
        }

        if let Some(raw) = meaningful(&self.raw) {
            let cleaned: Vec<&str> = raw
                .split(|c: char| c == '|' || c.is_whitespace())
                .filter(|p| !p.is_empty() && *p != "0")
                .collect();
            if cleaned.is_empty() {
                return f.write_str(raw);
            }
            return f.write_str(&cleaned.join(" "));
        }

        match meaningful(&self.source) {
            Some(source) => write!(f, "[{}]", source),
            None => Ok(()),
        }
    }
}

/// A single TTL rung of the path
#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    pub ttl: u8,
    /// Most recent responder (may change between rounds)
    pub addr: Option<IpAddr>,
    pub hostname: Option<String>,
    pub location: Option<GeoLocation>,
    pub stats: HopStats,
    /// The latest probe at this TTL got no response
    pub lost: bool,
    /// The latest response at this TTL came from the destination
    pub reached: bool,
    hostname_attempt: Option<IpAddr>,
    location_attempt: Option<IpAddr>,
}

impl Hop {
    pub fn new(ttl: u8) -> Self {
        Self {
            ttl,
            addr: None,
            hostname: None,
            location: None,
            stats: HopStats::new(),
            lost: true,
            reached: false,
            hostname_attempt: None,
            location_attempt: None,
        }
    }

    /// Apply one probe result. Returns true when the responder address changed.
    pub fn apply(&mut self, result: &ProbeResult) -> bool {
        self.stats.record_send();

        let responder = match result.responder {
            Some(ip) if !result.kind.is_timeout() => ip,
            _ => {
                self.lost = true;
                self.stats.recompute_loss();
                return false;
            }
        };

        self.lost = false;
        self.reached = result.kind.reaches_destination();
        self.stats.record_round_trip(result.rtt);
        self.stats.recompute_loss();

        let changed = self.addr != Some(responder);
        if changed {
            self.addr = Some(responder);
            self.hostname = None;
            self.location = None;
        }
        changed
    }

    /// Claim the pending reverse lookup for the current address, if any.
    ///
    /// Each distinct address is handed out once; the caller reports back with
    /// [`Hop::store_hostname`].
    pub fn claim_hostname_lookup(&mut self) -> Option<IpAddr> {
        let addr = self.addr?;
        if self.hostname.is_some() || self.hostname_attempt == Some(addr) {
            return None;
        }
        self.hostname_attempt = Some(addr);
        Some(addr)
    }

    /// Store a lookup result, ignored if the responder changed meanwhile
    pub fn store_hostname(&mut self, addr: IpAddr, hostname: Option<String>) {
        if self.addr == Some(addr) {
            self.hostname = hostname;
        }
    }

    /// Same as [`Hop::claim_hostname_lookup`], for geolocation
    pub fn claim_location_lookup(&mut self) -> Option<IpAddr> {
        let addr = self.addr?;
        if self.location.is_some() || self.location_attempt == Some(addr) {
            return None;
        }
        self.location_attempt = Some(addr);
        Some(addr)
    }

    pub fn store_location(&mut self, addr: IpAddr, location: Option<GeoLocation>) {
        if self.addr == Some(addr) {
            self.location = location;
        }
    }

    /// Serializable copy of this hop
    pub fn to_snapshot(&self) -> SnapshotHop {
        let stats = &self.stats;
        SnapshotHop {
            ttl: self.ttl,
            ip: self.addr.map(|ip| ip.to_string()),
            hostname: self.hostname.clone(),
            lost: self.lost,
            reached: self.reached,
            location: self.location.clone(),
            stats: SnapshotStats::from_stats(stats),
        }
    }
}
