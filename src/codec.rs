//! TCP header pack/unpack, checksum, and MSS option handling (spec.md §4.3,
//! §6 "Wire format"), built on `etherparse` the way the teacher's
//! `tcp/ioutil.rs` and `tcp/tcb.rs` build and parse headers with
//! `etherparse::TcpHeader`/`TcpHeaderSlice`. `Addr` here is IPv6 rather than
//! the teacher's IPv4, so the `*_ipv6_raw` checksum entry points stand in
//! for the teacher's `calc_checksum_ipv4` — there's no full IP header to
//! hand in either case, since the link layer that would own one is out of
//! scope (§1).

use etherparse::{TcpHeader as EpTcpHeader, TcpHeaderSlice, TcpOptionElement};

use crate::address::Addr;

pub const BASE_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub ns: bool,
    pub cwr: bool,
    pub ece: bool,
    pub urg: bool,
    pub ack: bool,
    pub psh: bool,
    pub rst: bool,
    pub syn: bool,
    pub fin: bool,
}

impl Flags {
    pub fn syn() -> Self {
        Self {
            syn: true,
            ..Default::default()
        }
    }
    pub fn syn_ack() -> Self {
        Self {
            syn: true,
            ack: true,
            ..Default::default()
        }
    }
    pub fn ack_only() -> Self {
        Self {
            ack: true,
            ..Default::default()
        }
    }
    pub fn psh_ack() -> Self {
        Self {
            psh: true,
            ack: true,
            ..Default::default()
        }
    }
    pub fn fin_ack() -> Self {
        Self {
            fin: true,
            ack: true,
            ..Default::default()
        }
    }
    pub fn rst_only() -> Self {
        Self {
            rst: true,
            ..Default::default()
        }
    }

    fn from_etherparse(ep: &EpTcpHeader) -> Self {
        Self {
            ns: ep.ns,
            cwr: ep.cwr,
            ece: ep.ece,
            urg: ep.urg,
            ack: ep.ack,
            psh: ep.psh,
            rst: ep.rst,
            syn: ep.syn,
            fin: ep.fin,
        }
    }
}

/// A parsed TCP option. Unknown kinds are skipped per spec.md §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOption {
    Mss(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: Flags,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
    pub options: Vec<TcpOption>,
}

impl TcpHeader {
    pub fn new(src_port: u16, dst_port: u16, seq: u32, window: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq,
            ack: 0,
            flags: Flags::default(),
            window,
            checksum: 0,
            urgent: 0,
            options: Vec::new(),
        }
    }

    pub fn mss(&self) -> Option<u16> {
        self.options.iter().find_map(|o| match o {
            TcpOption::Mss(v) => Some(*v),
        })
    }

    fn to_etherparse(&self) -> EpTcpHeader {
        let mut ep = EpTcpHeader::new(self.src_port, self.dst_port, self.seq, self.window);
        ep.acknowledgment_number = self.ack;
        ep.ns = self.flags.ns;
        ep.cwr = self.flags.cwr;
        ep.ece = self.flags.ece;
        ep.urg = self.flags.urg;
        ep.ack = self.flags.ack;
        ep.psh = self.flags.psh;
        ep.rst = self.flags.rst;
        ep.syn = self.flags.syn;
        ep.fin = self.flags.fin;
        ep.urgent_pointer = self.urgent;

        let elements: Vec<TcpOptionElement> = self
            .options
            .iter()
            .map(|o| match o {
                TcpOption::Mss(v) => TcpOptionElement::MaximumSegmentSize(*v),
            })
            .collect();
        ep.set_options(&elements)
            .expect("a lone MSS option always fits etherparse's option buffer");
        ep
    }
}

/// The pseudo-header fields the checksum is computed over (spec.md §6):
/// source and destination address, zero byte, protocol (6 = TCP), and TCP
/// length (header + payload). `etherparse`'s raw checksum entry points take
/// the two addresses directly rather than a full IP header.
pub struct PseudoHeader {
    pub src: Addr,
    pub dst: Addr,
}

/// Packs `hdr` and `payload` into a segment, computing and writing the
/// checksum over `pseudo` as spec.md §4.3 directs.
pub fn encode(hdr: &TcpHeader, payload: &[u8], pseudo: &PseudoHeader) -> Vec<u8> {
    let mut ep = hdr.to_etherparse();
    ep.checksum = ep
        .calc_checksum_ipv6_raw(pseudo.src.octets(), pseudo.dst.octets(), payload)
        .expect("segment length fits the 16-bit TCP length the checksum covers");

    let mut out = Vec::with_capacity(ep.header_len() as usize + payload.len());
    ep.write(&mut out)
        .expect("writing a TCP header into a Vec<u8> cannot fail");
    out.extend_from_slice(payload);
    out
}

/// Unpacks a segment. Returns `None` if the header is malformed or the
/// checksum doesn't match — per spec.md §4.3 such segments are silently
/// dropped and never reach the FSM.
pub fn decode<'a>(bytes: &'a [u8], pseudo: &PseudoHeader) -> Option<(TcpHeader, &'a [u8])> {
    let slice = TcpHeaderSlice::from_slice(bytes).ok()?;
    let header_len = slice.slice().len();
    let payload = &bytes[header_len..];

    let owned = slice.to_header();
    let expected = owned
        .calc_checksum_ipv6_raw(pseudo.src.octets(), pseudo.dst.octets(), payload)
        .ok()?;
    if expected != slice.checksum() {
        return None;
    }

    let mut options = Vec::new();
    for opt in slice.options_iterator() {
        // Unknown/malformed option entries are skipped rather than failing
        // the whole decode, per spec.md §4.3.
        if let Ok(TcpOptionElement::MaximumSegmentSize(v)) = opt {
            options.push(TcpOption::Mss(v));
        }
    }

    Some((
        TcpHeader {
            src_port: slice.source_port(),
            dst_port: slice.destination_port(),
            seq: slice.sequence_number(),
            ack: slice.acknowledgment_number(),
            flags: Flags::from_etherparse(&owned),
            window: slice.window_size(),
            checksum: slice.checksum(),
            urgent: slice.urgent_pointer(),
            options,
        },
        payload,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo() -> PseudoHeader {
        PseudoHeader {
            src: "::1".parse().unwrap(),
            dst: "::2".parse().unwrap(),
        }
    }

    #[test]
    fn round_trips_header_with_no_options() {
        let mut hdr = TcpHeader::new(1234, 80, 100, 4096);
        hdr.flags = Flags::syn_ack();
        hdr.ack = 101;
        let bytes = encode(&hdr, b"hello", &pseudo());
        let (decoded, payload) = decode(&bytes, &pseudo()).unwrap();
        assert_eq!(decoded.src_port, hdr.src_port);
        assert_eq!(decoded.dst_port, hdr.dst_port);
        assert_eq!(decoded.seq, hdr.seq);
        assert_eq!(decoded.ack, hdr.ack);
        assert_eq!(decoded.flags, hdr.flags);
        assert_eq!(decoded.window, hdr.window);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn round_trips_mss_option() {
        let mut hdr = TcpHeader::new(1, 2, 0, 0);
        hdr.flags = Flags::syn();
        hdr.options.push(TcpOption::Mss(1460));
        let bytes = encode(&hdr, &[], &pseudo());
        let (decoded, _) = decode(&bytes, &pseudo()).unwrap();
        assert_eq!(decoded.mss(), Some(1460));
    }

    #[test]
    fn bad_checksum_is_dropped() {
        let hdr = TcpHeader::new(1, 2, 0, 0);
        let mut bytes = encode(&hdr, b"x", &pseudo());
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(decode(&bytes, &pseudo()).is_none());
    }

    #[test]
    fn short_data_offset_is_dropped() {
        let mut bytes = vec![0u8; BASE_HEADER_LEN];
        bytes[12] = 4 << 4; // offset of 4 words, below the minimum of 5
        assert!(decode(&bytes, &pseudo()).is_none());
    }

    #[test]
    fn unknown_option_is_skipped() {
        let mut hdr = TcpHeader::new(1, 2, 0, 0);
        hdr.options.push(TcpOption::Mss(1200));
        let bytes = encode(&hdr, &[], &pseudo());
        let (decoded, _) = decode(&bytes, &pseudo()).unwrap();
        assert_eq!(decoded.mss(), Some(1200));
    }
}
