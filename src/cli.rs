use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use hopwatch::config::{Config, IpFamily, ProbeProtocol};
use hopwatch::error::{MtrError, MtrResult};

/// MTR-style path diagnostics: per-hop latency and loss toward a target
#[derive(Parser, Debug, Clone)]
#[command(name = "hopwatch")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Target host (IP address or hostname)
    pub target: String,

    /// Number of rounds to run (0 = until interrupted)
    #[arg(short = 'c', long = "count", default_value = "10")]
    pub count: u64,

    /// Pause between rounds in seconds
    #[arg(short = 'i', long = "interval", default_value = "1.0")]
    pub interval: f64,

    /// Maximum TTL (hops)
    #[arg(short = 'm', long = "max-hops", default_value = "30")]
    pub max_hops: u8,

    /// Per-probe timeout in seconds
    #[arg(long = "timeout", default_value = "1.0")]
    pub timeout: f64,

    /// Probe protocol (icmp, udp)
    #[arg(short = 'p', long = "protocol", default_value = "icmp")]
    pub protocol: String,

    /// IP version to probe over (4 or 6)
    #[arg(long = "ip-version", value_name = "N", conflicts_with_all = ["ipv4", "ipv6"])]
    pub ip_version: Option<u8>,

    /// Shorthand for --ip-version 4
    #[arg(short = '4', long = "ipv4", conflicts_with = "ipv6")]
    pub ipv4: bool,

    /// Shorthand for --ip-version 6
    #[arg(short = '6', long = "ipv6")]
    pub ipv6: bool,

    /// Skip reverse DNS lookups
    #[arg(long = "no-dns")]
    pub no_dns: bool,

    /// Geolocation source (none, maxmind)
    #[arg(long = "geoip", default_value = "none")]
    pub geoip: String,

    /// Path to MaxMind GeoLite2-City database file
    #[arg(long = "geoip-db")]
    pub geoip_db: Option<PathBuf>,

    /// Print the result as JSON instead of a report table
    #[arg(long = "json")]
    pub json: bool,

    /// Debug logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

fn seconds(flag: &str, value: f64) -> MtrResult<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        MtrError::InvalidConfig(format!("{flag} must be a non-negative number of seconds"))
    })
}

impl Args {
    pub fn family(&self) -> MtrResult<IpFamily> {
        let version = match self.ip_version {
            Some(version) => version,
            None if self.ipv6 => 6,
            None => 4,
        };
        IpFamily::from_version(version)
    }

    /// Build and validate the run configuration
    pub fn to_config(&self) -> MtrResult<Config> {
        let config = Config {
            target: self.target.trim().to_string(),
            max_hops: self.max_hops,
            count: self.count,
            interval: seconds("--interval", self.interval)?,
            timeout: seconds("--timeout", self.timeout)?,
            protocol: self.protocol.parse::<ProbeProtocol>()?,
            family: self.family()?,
            dns_enabled: !self.no_dns,
        };
        config.validate()?;
        Ok(config)
    }
}
