use async_trait::async_trait;
use chrono::Utc;
use socket2::Socket;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::correlate::{PORT_UNREACHABLE_KIND, looks_like_icmp, match_datagram};
use super::socket::{
    ReadDeadline, create_connected_udp_socket, create_raw_icmp_socket, local_port, probe_deadline,
    receive_until, set_ttl,
};
use super::udp::{DEFAULT_UDP_PAYLOAD, build_udp_payload, destination_port};
use super::{Prober, check_family, finish, join_error, not_open};
use crate::config::IpFamily;
use crate::error::{MtrError, MtrResult};
use crate::state::{ProbeResult, ResponseKind};

/// UDP datagram prober
///
/// Each probe goes out on a fresh UDP socket connected to a destination port
/// derived from the sequence; a long-lived raw ICMP socket collects the
/// resulting Time Exceeded and Destination Unreachable messages.
#[derive(Debug)]
pub struct DatagramProber {
    family: IpFamily,
    timeout: Duration,
    payload_size: usize,
    listener: Option<Arc<Socket>>,
    target: Option<IpAddr>,
}

impl DatagramProber {
    /// A port-unreachable from the destination is reported as
    /// [`ResponseKind::EchoReply`], ending the sweep for that round.
    ///
    /// This is a heuristic: it assumes nothing listens on the probed ports
    /// (33434 and up). Callers that need to tell "reached" from "refused"
    /// apart should use the Echo variant instead.
    pub const PORT_UNREACHABLE_MEANS_REACHED: bool =
        matches!(PORT_UNREACHABLE_KIND, ResponseKind::EchoReply);

    pub fn new(family: IpFamily, timeout: Duration) -> Self {
        Self {
            family,
            timeout,
            payload_size: DEFAULT_UDP_PAYLOAD,
            listener: None,
            target: None,
        }
    }
}

/// Per-probe sender. The run is past setup here, so failures are transport
/// errors, never permission or setup errors.
fn open_sender(target: IpAddr, port: u16) -> MtrResult<Socket> {
    create_connected_udp_socket(target, port).map_err(MtrError::Send)
}

#[async_trait]
impl Prober for DatagramProber {
    fn open(&mut self) -> MtrResult<()> {
        if self.listener.is_none() {
            self.listener = Some(Arc::new(create_raw_icmp_socket(self.family)?));
            debug!(family = %self.family, "datagram prober opened");
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
        let listener = self.listener.clone().ok_or_else(not_open)?;

        let family = self.family;
        let port = destination_port(seq);
        let sender = open_sender(target, port)?;
        set_ttl(&sender, family, ttl)?;
        let local = local_port(&sender);

        let payload = build_udp_payload(seq, self.payload_size);
        let sent_at = Utc::now();
        let started = Instant::now();
        sender.send(&payload).map_err(MtrError::Send)?;
        trace!(ttl, seq, port, local, %target, "datagram sent");

        let deadline = ReadDeadline::new(probe_deadline(self.timeout, deadline));
        let _waiter = deadline.collapse_on_cancel(cancel);

        let matched = tokio::task::spawn_blocking(move || {
            receive_until(&listener, &deadline, |data, from| {
                let Some(kind) = match_datagram(data, family, local, port) else {
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
        // The sending socket stays bound until the response is in
        drop(sender);

        let result = finish(ttl, seq, sent_at, started, matched);
        trace!(
            ttl,
            seq,
            kind = ?result.kind,
            responder = ?result.responder,
            rtt = ?result.rtt,
            "datagram probe finished"
        );
        Ok(result)
    }

    fn close(&mut self) -> MtrResult<()> {
        if self.listener.take().is_some() {
            debug!("datagram prober closed");
        }
        Ok(())
    }
}
