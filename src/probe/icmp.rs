use pnet::packet::MutablePacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpType, IcmpTypes};
use pnet::packet::util::checksum;

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;
/// Default payload size
pub const DEFAULT_PAYLOAD_SIZE: usize = 24;
/// Minimum payload size (identifier + sequence copy)
pub const MIN_PAYLOAD_SIZE: usize = 4;

/// ICMPv6 Echo Request type
pub const ICMPV6_ECHO_REQUEST: u8 = 128;

const PAYLOAD_TAG: &[u8] = b"hopwatch";

/// Get process identifier for ICMP identification field
pub fn get_identifier() -> u16 {
    (std::process::id() & 0xFFFF) as u16
}

/// Build an ICMP (or ICMPv6) Echo Request
///
/// Payload layout:
/// - Bytes 0-1: identifier
/// - Bytes 2-3: sequence
/// - Bytes 4+: repeating tag
///
/// The ICMPv6 checksum is left zero; the kernel fills it in for raw ICMPv6
/// sockets since it depends on the IPv6 pseudo-header.
pub fn build_echo_request(
    identifier: u16,
    sequence: u16,
    payload_size: usize,
    ipv6: bool,
) -> Vec<u8> {
    let payload_size = payload_size.max(MIN_PAYLOAD_SIZE);
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + payload_size];

    if let Some(mut packet) = MutableEchoRequestPacket::new(&mut buffer) {
        if ipv6 {
            packet.set_icmp_type(IcmpType::new(ICMPV6_ECHO_REQUEST));
        } else {
            packet.set_icmp_type(IcmpTypes::EchoRequest);
        }
        packet.set_icmp_code(IcmpCode::new(0));
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);

        let payload = packet.payload_mut();
        payload[0..2].copy_from_slice(&identifier.to_be_bytes());
        payload[2..4].copy_from_slice(&sequence.to_be_bytes());
        for (i, byte) in payload[4..].iter_mut().enumerate() {
            *byte = PAYLOAD_TAG[i % PAYLOAD_TAG.len()];
        }
    }

    if !ipv6 {
        // Word 1 (bytes 2-3) is the checksum field itself
        let cksum = checksum(&buffer, 1);
        buffer[2..4].copy_from_slice(&cksum.to_be_bytes());
    }

    buffer
}
