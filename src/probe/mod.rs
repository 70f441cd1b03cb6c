//! Probe transmission and response correlation.
//!
//! A [`Prober`] sends one TTL-limited probe at a time and waits for the ICMP
//! message it induces. Two variants exist, selected once per run through
//! [`AnyProber`]: ICMP Echo ([`EchoProber`]) and UDP datagrams
//! ([`DatagramProber`]).

pub mod correlate;
pub mod datagram;
pub mod echo;
pub mod icmp;
pub mod socket;
pub mod udp;

pub use datagram::DatagramProber;
pub use echo::EchoProber;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, IpFamily, ProbeProtocol};
use crate::error::{MtrError, MtrResult};
use crate::state::{ProbeResult, ResponseKind};

/// Capability shared by all probe variants
#[async_trait]
pub trait Prober: Send {
    /// Acquire the sockets. Called once before the first probe; calling it
    /// again is a no-op.
    fn open(&mut self) -> MtrResult<()>;

    /// Bind the destination. Must precede the first probe.
    fn set_target(&mut self, addr: IpAddr) -> MtrResult<()>;

    /// Send one probe with the given TTL and wait for its response.
    ///
    /// The wait ends at `now + timeout` or at `deadline`, whichever is
    /// earlier. Expiry and cancellation both yield a `Timeout` result.
    async fn probe(
        &mut self,
        ttl: u8,
        seq: u64,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> MtrResult<ProbeResult>;

    /// Release the sockets. Idempotent.
    fn close(&mut self) -> MtrResult<()>;
}

/// The closed set of probe variants
#[derive(Debug)]
pub enum AnyProber {
    Echo(EchoProber),
    Datagram(DatagramProber),
}

impl AnyProber {
    pub fn new(protocol: ProbeProtocol, family: IpFamily, timeout: Duration) -> Self {
        match protocol {
            ProbeProtocol::Icmp => AnyProber::Echo(EchoProber::new(family, timeout)),
            ProbeProtocol::Udp => AnyProber::Datagram(DatagramProber::new(family, timeout)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.protocol, config.family, config.timeout)
    }

    pub fn protocol(&self) -> ProbeProtocol {
        match self {
            AnyProber::Echo(_) => ProbeProtocol::Icmp,
            AnyProber::Datagram(_) => ProbeProtocol::Udp,
        }
    }
}

#[async_trait]
impl Prober for AnyProber {
    fn open(&mut self) -> MtrResult<()> {
        match self {
            AnyProber::Echo(p) => p.open(),
            AnyProber::Datagram(p) => p.open(),
        }
    }

    fn set_target(&mut self, addr: IpAddr) -> MtrResult<()> {
        match self {
            AnyProber::Echo(p) => p.set_target(addr),
            AnyProber::Datagram(p) => p.set_target(addr),
        }
    }

    async fn probe(
        &mut self,
        ttl: u8,
        seq: u64,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> MtrResult<ProbeResult> {
        match self {
            AnyProber::Echo(p) => p.probe(ttl, seq, cancel, deadline).await,
            AnyProber::Datagram(p) => p.probe(ttl, seq, cancel, deadline).await,
        }
    }

    fn close(&mut self) -> MtrResult<()> {
        match self {
            AnyProber::Echo(p) => p.close(),
            AnyProber::Datagram(p) => p.close(),
        }
    }
}

/// Reject a target whose family differs from the prober's sockets
pub(crate) fn check_family(family: IpFamily, addr: IpAddr) -> MtrResult<()> {
    if family.matches(&addr) {
        Ok(())
    } else {
        Err(MtrError::FamilyMismatch { addr, family })
    }
}

pub(crate) fn not_open() -> MtrError {
    MtrError::Internal("probe sent on a prober that is not open".to_string())
}

/// A matched response as seen by the receive loop
pub(crate) type Matched = (IpAddr, ResponseKind, Instant);

pub(crate) fn join_error(e: tokio::task::JoinError) -> MtrError {
    MtrError::Internal(format!("receive task failed: {e}"))
}

/// Turn the receive loop outcome into a result
pub(crate) fn finish(
    ttl: u8,
    seq: u64,
    sent_at: DateTime<Utc>,
    started: Instant,
    matched: Option<Matched>,
) -> ProbeResult {
    match matched {
        Some((responder, kind, received)) => ProbeResult::response(
            ttl,
            seq,
            responder,
            received.saturating_duration_since(started),
            kind,
            sent_at,
        ),
        None => ProbeResult::timeout(ttl, seq, sent_at),
    }
}
