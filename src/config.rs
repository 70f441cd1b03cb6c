use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::{MtrError, MtrResult};

/// Probe protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeProtocol {
    /// ICMP Echo Request probes
    #[default]
    Icmp,
    /// UDP datagrams to high ports
    Udp,
}

impl ProbeProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeProtocol::Icmp => "icmp",
            ProbeProtocol::Udp => "udp",
        }
    }
}

impl fmt::Display for ProbeProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProbeProtocol {
    type Err = MtrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "icmp" => Ok(ProbeProtocol::Icmp),
            "udp" => Ok(ProbeProtocol::Udp),
            other => Err(MtrError::InvalidConfig(format!("unknown protocol: {other}"))),
        }
    }
}

/// IP family used for target resolution and sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpFamily {
    #[default]
    V4,
    V6,
}

impl IpFamily {
    /// Build from an IP version number; only 4 and 6 exist
    pub fn from_version(version: u8) -> MtrResult<Self> {
        match version {
            4 => Ok(IpFamily::V4),
            6 => Ok(IpFamily::V6),
            v => Err(MtrError::InvalidConfig(format!(
                "invalid IP version {v} (expected 4 or 6)"
            ))),
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            IpFamily::V4 => 4,
            IpFamily::V6 => 6,
        }
    }

    pub fn of(addr: &IpAddr) -> Self {
        if addr.is_ipv6() { IpFamily::V6 } else { IpFamily::V4 }
    }

    pub fn matches(&self, addr: &IpAddr) -> bool {
        Self::of(addr) == *self
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, IpFamily::V6)
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("IPv4"),
            IpFamily::V6 => f.write_str("IPv6"),
        }
    }
}

/// Per-run configuration. Construct with [`Config::new`] or validate a
/// hand-built value with [`Config::validate`] before use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Target hostname or IP literal
    pub target: String,
    /// Maximum TTL probed per round
    pub max_hops: u8,
    /// Number of rounds (0 = until cancelled)
    pub count: u64,
    /// Pause between rounds
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    /// Per-probe timeout
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    pub protocol: ProbeProtocol,
    pub family: IpFamily,
    /// Enable reverse DNS lookups
    pub dns_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: String::new(),
            max_hops: 30,
            count: 10,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            protocol: ProbeProtocol::Icmp,
            family: IpFamily::V4,
            dns_enabled: true,
        }
    }
}

impl Config {
    /// Default configuration for `target`, validated.
    pub fn new(target: impl Into<String>) -> MtrResult<Self> {
        let config = Self {
            target: target.into(),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants every run relies on.
    pub fn validate(&self) -> MtrResult<()> {
        if self.target.trim().is_empty() {
            return Err(MtrError::InvalidConfig("target must not be empty".into()));
        }
        if self.max_hops == 0 {
            return Err(MtrError::InvalidConfig("max hops must be at least 1".into()));
        }
        if self.interval.is_zero() {
            return Err(MtrError::InvalidConfig("interval must be positive".into()));
        }
        if self.timeout.is_zero() {
            return Err(MtrError::InvalidConfig("timeout must be positive".into()));
        }
        Ok(())
    }

    /// True when the run has no round limit
    pub fn is_unbounded(&self) -> bool {
        self.count == 0
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
