use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// How a single probe ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseKind {
    /// No matching response before the deadline (or the run was cancelled)
    Timeout,
    /// The destination answered
    EchoReply,
    /// An intermediate hop reported TTL expiry
    TimeExceeded,
    /// A hop reported the destination unreachable
    DestinationUnreachable,
}

impl ResponseKind {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ResponseKind::Timeout)
    }

    /// The sweep stops after a result of this kind
    pub fn reaches_destination(&self) -> bool {
        matches!(self, ResponseKind::EchoReply)
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub ttl: u8,
    pub seq: u64,
    pub responder: Option<IpAddr>,
    pub rtt: Duration,
    pub kind: ResponseKind,
    /// When the probe was sent
    pub timestamp: DateTime<Utc>,
}

impl ProbeResult {
    pub fn timeout(ttl: u8, seq: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            ttl,
            seq,
            responder: None,
            rtt: Duration::ZERO,
            kind: ResponseKind::Timeout,
            timestamp,
        }
    }

    pub fn response(
        ttl: u8,
        seq: u64,
        responder: IpAddr,
        rtt: Duration,
        kind: ResponseKind,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            ttl,
            seq,
            responder: Some(responder),
            rtt,
            kind,
            timestamp,
        }
    }
}

/// Sequence number for the probe at `ttl` in `round` (0-based).
///
/// Distinct for every (round, ttl) pair of a run with a fixed `max_hops`.
pub fn sequence_for(round: u64, ttl: u8, max_hops: u8) -> u64 {
    round * max_hops as u64 + ttl as u64
}

/// Low 16 bits of a sequence, as carried in the ICMP header
pub fn wire_sequence(seq: u64) -> u16 {
    (seq & 0xFFFF) as u16
}
