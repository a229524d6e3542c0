//! Bounded Ethernet → IPv4 → TCP/UDP header walk over a received frame.
//!
//! Mirrors the XDP program step for step: a fixed sequence of bounds checks,
//! no loops, no recursion. Anything the walk cannot interpret is reported as
//! `None`, which callers treat as "pass, uninteresting".

use netinsight_common::{ETH_P_IPV4, IPPROTO_TCP, IPPROTO_UDP};
use network_types::{eth::EthHdr, ip::Ipv4Hdr, tcp::TcpHdr, udp::UdpHdr};

const ETHER_TYPE_OFFSET: usize = 12;
const IP_PROTO_OFFSET: usize = 9;
const IP_SRC_OFFSET: usize = 12;
const IP_DST_OFFSET: usize = 16;

/// Header fields of a frame that passed validation. Addresses and ports are
/// in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeaders {
    pub ether_type: u16,
    pub src_addr: u32,
    pub dst_addr: u32,
    pub protocol: u8,
    /// `(source, destination)`; present only for TCP and UDP.
    pub ports: Option<(u16, u16)>,
    /// Length of the whole frame, Ethernet header included.
    pub frame_len: u64,
}

/// Walk the headers of `frame`.
///
/// The transport header is expected right after the fixed 20-byte IPv4
/// header; IP options are not skipped.
pub fn walk(frame: &[u8]) -> Option<ParsedHeaders> {
    // -- Ethernet ----------------------------------------------------------
    let eth = frame.get(..EthHdr::LEN)?;
    let ether_type = be_u16(eth, ETHER_TYPE_OFFSET)?;
    if ether_type != ETH_P_IPV4 {
        return None;
    }

    // -- IPv4 --------------------------------------------------------------
    let ip_end = EthHdr::LEN + Ipv4Hdr::LEN;
    let ip = frame.get(EthHdr::LEN..ip_end)?;
    let protocol = ip[IP_PROTO_OFFSET];
    let src_addr = be_u32(ip, IP_SRC_OFFSET)?;
    let dst_addr = be_u32(ip, IP_DST_OFFSET)?;

    // -- Transport ---------------------------------------------------------
    let ports = match protocol {
        IPPROTO_TCP => Some(ports_at(frame.get(ip_end..ip_end + TcpHdr::LEN)?)?),
        IPPROTO_UDP => Some(ports_at(frame.get(ip_end..ip_end + UdpHdr::LEN)?)?),
        _ => None,
    };

    Some(ParsedHeaders {
        ether_type,
        src_addr,
        dst_addr,
        protocol,
        ports,
        frame_len: frame.len() as u64,
    })
}

/// Both TCP and UDP start with the source and destination port.
fn ports_at(transport: &[u8]) -> Option<(u16, u16)> {
    Some((be_u16(transport, 0)?, be_u16(transport, 2)?))
}

fn be_u16(buf: &[u8], at: usize) -> Option<u16> {
    let bytes = buf.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn be_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
