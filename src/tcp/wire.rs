use etherparse::{TcpHeader, TcpHeaderSlice};

use super::Quad;

/// Largest application payload carried by a single segment.
pub const MSS: usize = 1460;

/// Receive window advertised on every outbound segment. Flow control is
/// not implemented, so the value never shrinks.
const WINDOW_SIZE: u16 = 64240;

/// Control flags of an outbound segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
}

impl Flags {
    pub const ACK: Flags = Flags {
        syn: false,
        ack: true,
        fin: false,
    };
    pub const SYN_ACK: Flags = Flags {
        syn: true,
        ack: true,
        fin: false,
    };
    pub const FIN_ACK: Flags = Flags {
        syn: false,
        ack: true,
        fin: true,
    };
}

/// Serializes one segment of `quad`'s connection, checksum in place. The
/// pseudo header uses the quad's local address as source and its remote
/// address as destination.
pub fn build_segment(quad: &Quad, seq: u32, ack: u32, flags: Flags, payload: &[u8]) -> Vec<u8> {
    let mut tcph = TcpHeader::new(quad.local.port, quad.remote.port, seq, WINDOW_SIZE);

    tcph.syn = flags.syn;
    tcph.ack = flags.ack;
    tcph.fin = flags.fin;
    tcph.acknowledgment_number = ack;
    tcph.checksum = tcph
        .calc_checksum_ipv4_raw(quad.local.addr.octets(), quad.remote.addr.octets(), payload)
        .unwrap();

    let mut segment = Vec::with_capacity(tcph.header_len() as usize + payload.len());
    tcph.write(&mut segment).unwrap();
    segment.extend_from_slice(payload);

    segment
}

/// Recomputes an inbound segment's checksum over the pseudo header and
/// compares it with the transmitted one.
pub fn verify_checksum(
    tcph: &TcpHeaderSlice,
    src: std::net::Ipv4Addr,
    dst: std::net::Ipv4Addr,
    payload: &[u8],
) -> bool {
    match tcph
        .to_header()
        .calc_checksum_ipv4_raw(src.octets(), dst.octets(), payload)
    {
        Ok(expected) => expected == tcph.checksum(),
        Err(_) => false,
    }
}
