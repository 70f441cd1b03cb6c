//! Matching inbound ICMP messages to the probe in flight.
//!
//! Raw IPv4 sockets deliver the outer IPv4 header; raw ICMPv6 sockets do
//! not. Error messages (Time Exceeded, Destination Unreachable) quote the
//! original datagram: one IP header followed by at least 8 bytes of the
//! transport header, which is all we inspect.

use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;

use crate::config::IpFamily;
use crate::state::ResponseKind;

// IP protocol numbers
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

// ICMPv6 type codes
const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_TIME_EXCEEDED: u8 = 3;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

// Port unreachable codes
const ICMP_PORT_UNREACHABLE: u8 = 3;
const ICMPV6_PORT_UNREACHABLE: u8 = 4;

const ICMP_ECHO_REQUEST: u8 = 8;

/// How a quoted port-unreachable is reported in datagram mode.
///
/// Nothing listens on the probed high ports, so the destination itself
/// answers with port unreachable. A target that does run a service there
/// would swallow the probe and look like a timeout instead.
pub const PORT_UNREACHABLE_KIND: ResponseKind = ResponseKind::EchoReply;

const ICMP_HEADER_LEN: usize = 8;
const IPV4_MIN_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
/// Transport bytes every quoted datagram must carry
const QUOTED_TRANSPORT_LEN: usize = 8;

/// Family-independent view of the ICMP messages we care about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpMessage {
    EchoReply,
    TimeExceeded,
    DestUnreachable { port: bool },
    Other,
}

impl IcmpMessage {
    pub fn classify(family: IpFamily, icmp_type: u8, code: u8) -> Self {
        match family {
            IpFamily::V4 => match icmp_type {
                t if t == IcmpTypes::EchoReply.0 => IcmpMessage::EchoReply,
                t if t == IcmpTypes::TimeExceeded.0 => IcmpMessage::TimeExceeded,
                t if t == IcmpTypes::DestinationUnreachable.0 => IcmpMessage::DestUnreachable {
                    port: code == ICMP_PORT_UNREACHABLE,
                },
                _ => IcmpMessage::Other,
            },
            IpFamily::V6 => match icmp_type {
                ICMPV6_ECHO_REPLY => IcmpMessage::EchoReply,
                ICMPV6_TIME_EXCEEDED => IcmpMessage::TimeExceeded,
                ICMPV6_DEST_UNREACHABLE => IcmpMessage::DestUnreachable {
                    port: code == ICMPV6_PORT_UNREACHABLE,
                },
                _ => IcmpMessage::Other,
            },
        }
    }
}

/// Validate an ICMP checksum (RFC 1071)
///
/// Valid data folds to 0xFFFF (or 0x0000 for an all-zero message).
pub fn validate_icmp_checksum(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }

    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [odd] = chunks.remainder() {
        sum += (*odd as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum == 0xFFFF || sum == 0x0000
}

/// Strip whatever the socket put in front of the ICMP message
pub fn icmp_payload(packet: &[u8], family: IpFamily) -> Option<&[u8]> {
    let icmp = match family {
        IpFamily::V4 => {
            let ip = Ipv4Packet::new(packet)?;
            if ip.get_version() != 4 {
                return None;
            }
            let header_len = ip.get_header_length() as usize * 4;
            if header_len < IPV4_MIN_HEADER_LEN {
                return None;
            }
            packet.get(header_len..)?
        }
        IpFamily::V6 => packet,
    };

    if icmp.len() < ICMP_HEADER_LEN {
        return None;
    }
    Some(icmp)
}

/// Locate the quoted transport header inside an ICMP error message.
///
/// Returns the quoted protocol number and the bytes after the quoted IP
/// header (at least [`QUOTED_TRANSPORT_LEN`] of them).
pub fn quoted_transport(icmp: &[u8], family: IpFamily) -> Option<(u8, &[u8])> {
    let quoted = icmp.get(ICMP_HEADER_LEN..)?;

    let (protocol, header_len) = match family {
        IpFamily::V4 => {
            let ip = Ipv4Packet::new(quoted)?;
            if ip.get_version() != 4 {
                return None;
            }
            let header_len = ip.get_header_length() as usize * 4;
            if header_len < IPV4_MIN_HEADER_LEN {
                return None;
            }
            (ip.get_next_level_protocol().0, header_len)
        }
        IpFamily::V6 => {
            if quoted.len() < IPV6_HEADER_LEN || quoted[0] >> 4 != 6 {
                return None;
            }
            // Extension headers are not walked
            (quoted[6], IPV6_HEADER_LEN)
        }
    };

    let transport = quoted.get(header_len..)?;
    if transport.len() < QUOTED_TRANSPORT_LEN {
        return None;
    }
    Some((protocol, transport))
}

/// Match a packet against an outstanding Echo Request.
///
/// Echo Replies must carry our identifier and sequence directly; Time
/// Exceeded must quote an Echo Request carrying them. Everything else,
/// including Destination Unreachable, is ignored.
pub fn match_echo(
    packet: &[u8],
    family: IpFamily,
    identifier: u16,
    sequence: u16,
) -> Option<ResponseKind> {
    let icmp = icmp_payload(packet, family)?;
    let icmp_type = icmp[0];
    let code = icmp[1];

    match IcmpMessage::classify(family, icmp_type, code) {
        IcmpMessage::EchoReply => {
            // The kernel verifies ICMPv6 checksums for us
            if family == IpFamily::V4 && !validate_icmp_checksum(icmp) {
                return None;
            }
            echo_ids_match(&icmp[4..8], identifier, sequence).then_some(ResponseKind::EchoReply)
        }
        IcmpMessage::TimeExceeded => {
            let (protocol, inner) = quoted_transport(icmp, family)?;
            let (want_protocol, want_type) = match family {
                IpFamily::V4 => (IPPROTO_ICMP, ICMP_ECHO_REQUEST),
                IpFamily::V6 => (IPPROTO_ICMPV6, ICMPV6_ECHO_REQUEST),
            };
            if protocol != want_protocol || inner[0] != want_type {
                return None;
            }
            echo_ids_match(&inner[4..8], identifier, sequence).then_some(ResponseKind::TimeExceeded)
        }
        IcmpMessage::DestUnreachable { .. } | IcmpMessage::Other => None,
    }
}

fn echo_ids_match(ids: &[u8], identifier: u16, sequence: u16) -> bool {
    u16::from_be_bytes([ids[0], ids[1]]) == identifier
        && u16::from_be_bytes([ids[2], ids[3]]) == sequence
}

/// Match a packet against an outstanding UDP datagram.
///
/// Correlation is by the quoted destination port. The quoted source port is
/// only compared when `local_port` is known (non-zero). Port Unreachable is
/// taken to mean the datagram reached the destination.
pub fn match_datagram(
    packet: &[u8],
    family: IpFamily,
    local_port: u16,
    dest_port: u16,
) -> Option<ResponseKind> {
    let icmp = icmp_payload(packet, family)?;
    let kind = match IcmpMessage::classify(family, icmp[0], icmp[1]) {
        IcmpMessage::TimeExceeded => ResponseKind::TimeExceeded,
        IcmpMessage::DestUnreachable { port: true } => PORT_UNREACHABLE_KIND,
        IcmpMessage::DestUnreachable { port: false } => ResponseKind::DestinationUnreachable,
        IcmpMessage::EchoReply | IcmpMessage::Other => return None,
    };

    let (protocol, udp) = quoted_transport(icmp, family)?;
    if protocol != IPPROTO_UDP {
        return None;
    }

    let quoted_src = u16::from_be_bytes([udp[0], udp[1]]);
    let quoted_dst = u16::from_be_bytes([udp[2], udp[3]]);
    if quoted_dst != dest_port {
        return None;
    }
    if local_port != 0 && quoted_src != local_port {
        return None;
    }
    Some(kind)
}

/// Check whether a raw packet could possibly be an ICMP message at all.
///
/// Cheap pre-filter used before logging unmatched traffic.
pub fn looks_like_icmp(packet: &[u8], family: IpFamily) -> bool {
    icmp_payload(packet, family)
        .and_then(IcmpPacket::new)
        .is_some()
}
