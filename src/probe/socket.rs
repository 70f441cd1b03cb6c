use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::trace;

use crate::config::IpFamily;
use crate::error::{MtrError, MtrResult};

/// Receive buffer size, large enough for any ICMP error we parse
pub const RECV_BUFFER_SIZE: usize = 1500;

/// Upper bound on a single blocking read, so deadline changes are noticed
const READ_SLICE: Duration = Duration::from_millis(50);

/// Smallest read timeout handed to the kernel; a zero timeout means "block forever"
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

fn domain(family: IpFamily) -> Domain {
    match family {
        IpFamily::V4 => Domain::IPV4,
        IpFamily::V6 => Domain::IPV6,
    }
}

fn icmp_protocol(family: IpFamily) -> Protocol {
    match family {
        IpFamily::V4 => Protocol::ICMPV4,
        IpFamily::V6 => Protocol::ICMPV6,
    }
}

/// Create a raw ICMP (or ICMPv6) socket
///
/// Fails with [`MtrError::InsufficientPermissions`] when the process lacks
/// CAP_NET_RAW.
pub fn create_raw_icmp_socket(family: IpFamily) -> MtrResult<Socket> {
    let socket = Socket::new(domain(family), Type::RAW, Some(icmp_protocol(family)))
        .map_err(MtrError::from_socket_creation)?;
    socket
        .set_nonblocking(false)
        .map_err(MtrError::SocketCreation)?;
    if let Err(e) = socket.set_recv_buffer_size(1024 * 1024) {
        trace!(error = %e, "could not grow receive buffer");
    }
    Ok(socket)
}

/// Create a UDP socket connected to `target:port`
///
/// Used per probe, after setup; callers decide how failures are classified.
pub fn create_connected_udp_socket(target: IpAddr, port: u16) -> io::Result<Socket> {
    let family = IpFamily::of(&target);
    let socket = Socket::new(domain(family), Type::DGRAM, Some(Protocol::UDP))?;

    let unspecified = match family {
        IpFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    socket.bind(&SockAddr::from(SocketAddr::new(unspecified, 0)))?;
    socket.connect(&SockAddr::from(SocketAddr::new(target, port)))?;
    Ok(socket)
}

/// Local port a socket is bound to, or 0 when unknown
pub fn local_port(socket: &Socket) -> u16 {
    socket
        .local_addr()
        .ok()
        .and_then(|addr| addr.as_socket())
        .map(|addr| addr.port())
        .unwrap_or(0)
}

/// Set the TTL (IPv4) or unicast hop limit (IPv6) for outgoing packets
pub fn set_ttl(socket: &Socket, family: IpFamily, ttl: u8) -> MtrResult<()> {
    let result = match family {
        IpFamily::V4 => socket.set_ttl(ttl as u32),
        IpFamily::V6 => socket.set_unicast_hops_v6(ttl as u32),
    };
    result.map_err(MtrError::Send)
}

/// Send an ICMP packet to target
pub fn send_icmp(socket: &Socket, packet: &[u8], target: IpAddr) -> MtrResult<usize> {
    let addr = SockAddr::from(SocketAddr::new(target, 0));
    socket.send_to(packet, &addr).map_err(MtrError::Send)
}

/// Read deadline shared between a blocking receive loop and its
/// cancellation waiter.
///
/// The waiter collapses the deadline to "now" when the run is cancelled;
/// the receive loop re-reads it between short blocking reads.
#[derive(Debug, Clone)]
pub struct ReadDeadline(Arc<Mutex<Instant>>);

impl ReadDeadline {
    pub fn new(at: Instant) -> Self {
        Self(Arc::new(Mutex::new(at)))
    }

    pub fn get(&self) -> Instant {
        *self.0.lock()
    }

    /// Make the deadline expire immediately
    pub fn collapse(&self) {
        *self.0.lock() = Instant::now();
    }

    /// Time left, or None once expired
    pub fn remaining(&self) -> Option<Duration> {
        let left = self.get().saturating_duration_since(Instant::now());
        (!left.is_zero()).then_some(left)
    }

    /// Spawn the auxiliary task that collapses this deadline on cancellation.
    ///
    /// The task exits when the returned guard is dropped, so it never
    /// outlives the probe it serves.
    pub fn collapse_on_cancel(&self, cancel: &CancellationToken) -> DropGuard {
        let done = CancellationToken::new();
        let guard = done.clone().drop_guard();
        let cancel = cancel.clone();
        let deadline = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = done.cancelled() => {}
                _ = cancel.cancelled() => deadline.collapse(),
            }
        });

        guard
    }
}

/// Effective deadline: the probe timeout, capped by the caller's deadline
pub fn probe_deadline(timeout: Duration, caller: Option<Instant>) -> Instant {
    let own = Instant::now() + timeout;
    match caller {
        Some(caller) => own.min(caller),
        None => own,
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Blocking receive loop: read packets until `accept` returns a value or the
/// deadline expires.
///
/// `accept` sees the raw packet and its source address. Returns `Ok(None)`
/// on expiry (including cancellation via [`ReadDeadline::collapse`]).
pub fn receive_until<T, F>(
    socket: &Socket,
    deadline: &ReadDeadline,
    mut accept: F,
) -> MtrResult<Option<T>>
where
    F: FnMut(&[u8], IpAddr) -> Option<T>,
{
    let mut buffer = [MaybeUninit::<u8>::uninit(); RECV_BUFFER_SIZE];

    loop {
        let Some(remaining) = deadline.remaining() else {
            return Ok(None);
        };
        socket
            .set_read_timeout(Some(remaining.min(READ_SLICE).max(MIN_READ_TIMEOUT)))
            .map_err(MtrError::Receive)?;

        match socket.recv_from(&mut buffer) {
            Ok((len, from)) => {
                // SAFETY: recv_from initialized the first `len` bytes
                let data = unsafe { std::slice::from_raw_parts(buffer.as_ptr().cast::<u8>(), len) };
                let Some(source) = from.as_socket().map(|addr| addr.ip()) else {
                    continue;
                };
                if let Some(found) = accept(data, source) {
                    return Ok(Some(found));
                }
            }
            Err(e) if is_timeout(&e) => continue,
            Err(e) => return Err(MtrError::Receive(e)),
        }
    }
}
