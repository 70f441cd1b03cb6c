/// First destination port of the classic traceroute range
pub const BASE_PORT: u16 = 33434;
/// Number of ports the destination cycles through
pub const PORT_SPAN: u64 = 10_000;

/// Minimum UDP payload size (magic + sequence)
pub const MIN_UDP_PAYLOAD: usize = 8;
/// Default UDP payload size
pub const DEFAULT_UDP_PAYLOAD: usize = 32;

const PAYLOAD_MAGIC: &[u8; 4] = b"hopw";

/// Destination port for a probe sequence
///
/// Ports stay inside `BASE_PORT..BASE_PORT + PORT_SPAN` so a run that wraps
/// the range never lands on a well-known service port.
pub fn destination_port(seq: u64) -> u16 {
    BASE_PORT + (seq % PORT_SPAN) as u16
}

/// Build a UDP probe payload
///
/// Layout:
/// - Bytes 0-3: magic
/// - Bytes 4-7: low 32 bits of the sequence, big-endian
/// - Bytes 8+: counting pattern
pub fn build_udp_payload(seq: u64, size: usize) -> Vec<u8> {
    let size = size.max(MIN_UDP_PAYLOAD);
    let mut payload = vec![0u8; size];

    payload[0..4].copy_from_slice(PAYLOAD_MAGIC);
    payload[4..8].copy_from_slice(&(seq as u32).to_be_bytes());

    for (i, byte) in payload[8..].iter_mut().enumerate() {
        *byte = (i & 0xFF) as u8;
    }

    payload
}
