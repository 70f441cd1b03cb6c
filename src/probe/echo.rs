use async_trait::async_trait;
use chrono::Utc;
use socket2::Socket;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::correlate::{looks_like_icmp, match_echo};
use super::icmp::{DEFAULT_PAYLOAD_SIZE, build_echo_request, get_identifier};
use super::socket::{
    ReadDeadline, create_raw_icmp_socket, probe_deadline, receive_until, send_icmp, set_ttl,
};
use super::{Prober, check_family, finish, join_error, not_open};
use crate::config::IpFamily;
use crate::error::{MtrError, MtrResult};
use crate::state::{ProbeResult, wire_sequence};

/// ICMP Echo prober
///
/// One raw ICMP socket serves both directions. Probes carry the process
/// identifier and the low 16 bits of the logical sequence.
#[derive(Debug)]
pub struct EchoProber {
    family: IpFamily,
    timeout: Duration,
    identifier: u16,
    payload_size: usize,
    socket: Option<Arc<Socket>>,
    target: Option<IpAddr>,
}

impl EchoProber {
    pub fn new(family: IpFamily, timeout: Duration) -> Self {
        Self {
            family,
            timeout,
            identifier: get_identifier(),
            payload_size: DEFAULT_PAYLOAD_SIZE,
            socket: None,
            target: None,
        }
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }
}

#[async_trait]
impl Prober for EchoProber {
    fn open(&mut self) -> MtrResult<()> {
        if self.socket.is_none() {
            self.socket = Some(Arc::new(create_raw_icmp_socket(self.family)?));
            debug!(family = %self.family, identifier = self.identifier, "echo prober opened");
        }
        Ok(())
    }

    fn set_target(&mut self, addr: IpAddr) -> MtrResult<()> {
        check_family(self.family, addr)?;
        self.target = Some(addr);
        Ok(())
    }

    async fn probe(
        &mut self,
        ttl: u8,
        seq: u64,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> MtrResult<ProbeResult> {
        let target = self.target.ok_or(MtrError::TargetNotSet)?;
        let socket = self.socket.clone().ok_or_else(not_open)?;

        let family = self.family;
        let identifier = self.identifier;
        let wire_seq = wire_sequence(seq);
        let packet = build_echo_request(identifier, wire_seq, self.payload_size, family.is_ipv6());

        set_ttl(&socket, family, ttl)?;
        let sent_at = Utc::now();
        let started = Instant::now();
        send_icmp(&socket, &packet, target)?;
        trace!(ttl, seq, wire_seq, %target, "echo request sent");

        let deadline = ReadDeadline::new(probe_deadline(self.timeout, deadline));
        let _waiter = deadline.collapse_on_cancel(cancel);

        let matched = tokio::task::spawn_blocking(move || {
            receive_until(&socket, &deadline, |data, from| {
                let Some(kind) = match_echo(data, family, identifier, wire_seq) else {
                    if looks_like_icmp(data, family) {
                        trace!(%from, "ignoring unrelated icmp");
                    }
                    return None;
                };
                Some((from, kind, Instant::now()))
            })
        })
        .await
        .map_err(join_error)??;

        let result = finish(ttl, seq, sent_at, started, matched);
        trace!(
            ttl,
            seq,
            kind = ?result.kind,
            responder = ?result.responder,
            rtt = ?result.rtt,
            "echo probe finished"
        );
        Ok(result)
    }

    fn close(&mut self) -> MtrResult<()> {
        if self.socket.take().is_some() {
            debug!("echo prober closed");
        }
        Ok(())
    }
}
