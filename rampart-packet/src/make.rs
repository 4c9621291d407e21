//! Factory module for making all kinds of packets, as raw frames.

use crate::IpFamily;
use anyhow::{Context as _, Result, bail};
use etherparse::{
    Icmpv4Type, Icmpv6Type, IpFragOffset, IpNumber, Ipv4Dscp, Ipv4Ecn, Ipv4Header,
    Ipv4HeaderSlice, Ipv4Options, Ipv6HeaderSlice, PacketBuilder, icmpv4, icmpv6,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Helper macro to turn a [`PacketBuilder`] into a raw frame.
macro_rules! build {
    ($packet:expr, $payload:expr) => {{
        let payload = $payload;
        let mut buf = Vec::with_capacity($packet.size(payload.len()));

        $packet
            .write(&mut buf, payload)
            .context("Failed to write packet")?;

        anyhow::Ok(buf)
    }};
}

pub fn udp_packet<SIP, DIP>(
    saddr: SIP,
    daddr: DIP,
    sport: u16,
    dport: u16,
    payload: Vec<u8>,
) -> Result<Vec<u8>>
where
    SIP: Into<IpAddr>,
    DIP: Into<IpAddr>,
{
    match (saddr.into(), daddr.into()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let packet = PacketBuilder::ipv4(src.octets(), dst.octets(), 64).udp(sport, dport);

            build!(packet, &payload)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let packet = PacketBuilder::ipv6(src.octets(), dst.octets(), 64).udp(sport, dport);

            build!(packet, &payload)
        }
        _ => bail!(IpVersionMismatch),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

pub fn tcp_packet<SIP, DIP>(
    saddr: SIP,
    daddr: DIP,
    sport: u16,
    dport: u16,
    flags: TcpFlags,
    payload: Vec<u8>,
) -> Result<Vec<u8>>
where
    SIP: Into<IpAddr>,
    DIP: Into<IpAddr>,
{
    let TcpFlags { syn, fin, rst } = flags;

    match (saddr.into(), daddr.into()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let mut packet =
                PacketBuilder::ipv4(src.octets(), dst.octets(), 64).tcp(sport, dport, 0, 128);

            if syn {
                packet = packet.syn();
            }
            if fin {
                packet = packet.fin();
            }
            if rst {
                packet = packet.rst();
            }

            build!(packet, &payload)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let mut packet =
                PacketBuilder::ipv6(src.octets(), dst.octets(), 64).tcp(sport, dport, 0, 128);

            if syn {
                packet = packet.syn();
            }
            if fin {
                packet = packet.fin();
            }
            if rst {
                packet = packet.rst();
            }

            build!(packet, &payload)
        }
        _ => bail!(IpVersionMismatch),
    }
}

pub fn icmp_request_packet(
    src: IpAddr,
    dst: impl Into<IpAddr>,
    seq: u16,
    identifier: u16,
    payload: &[u8],
) -> Result<Vec<u8>> {
    match (src, dst.into()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let packet = PacketBuilder::ipv4(src.octets(), dst.octets(), 64)
                .icmpv4_echo_request(identifier, seq);

            build!(packet, payload)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let packet = PacketBuilder::ipv6(src.octets(), dst.octets(), 64)
                .icmpv6_echo_request(identifier, seq);

            build!(packet, payload)
        }
        _ => bail!(IpVersionMismatch),
    }
}

pub fn icmp_reply_packet(
    src: IpAddr,
    dst: impl Into<IpAddr>,
    seq: u16,
    identifier: u16,
    payload: &[u8],
) -> Result<Vec<u8>> {
    match (src, dst.into()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let packet = PacketBuilder::ipv4(src.octets(), dst.octets(), 64)
                .icmpv4_echo_reply(identifier, seq);

            build!(packet, payload)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let packet = PacketBuilder::ipv6(src.octets(), dst.octets(), 64)
                .icmpv6_echo_reply(identifier, seq);

            build!(packet, payload)
        }
        _ => bail!(IpVersionMismatch),
    }
}

pub fn icmp_timestamp_request(src: Ipv4Addr, dst: Ipv4Addr, identifier: u16) -> Result<Vec<u8>> {
    let packet = PacketBuilder::ipv4(src.octets(), dst.octets(), 64).icmpv4(
        Icmpv4Type::TimestampRequest(icmpv4::TimestampMessage {
            id: identifier,
            seq: 0,
            originate_timestamp: 0,
            receive_timestamp: 0,
            transmit_timestamp: 0,
        }),
    );
    let payload: &[u8] = &[];

    build!(packet, payload)
}

/// An ICMPv4 message of an arbitrary type, e.g. one the classifier does not
/// handle.
pub fn icmpv4_raw(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    type_u8: u8,
    code_u8: u8,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let packet = PacketBuilder::ipv4(src.octets(), dst.octets(), 64).icmpv4(Icmpv4Type::Unknown {
        type_u8,
        code_u8,
        bytes5to8: [0u8; 4],
    });

    build!(packet, payload)
}

/// A destination-unreachable error complaining about `original`, sent from
/// the original destination back to the original source, embedding the
/// original IP header plus 8 bytes of its L4 header.
pub fn icmp_dest_unreachable(original: &[u8], family: IpFamily) -> Result<Vec<u8>> {
    match family {
        IpFamily::V4 => {
            let header = Ipv4HeaderSlice::from_slice(original)
                .context("Not an IPv4 packet")?
                .to_header();
            let embed_len = std::cmp::min(original.len(), header.header_len() + 8);

            let packet = PacketBuilder::ipv4(header.destination, header.source, 20).icmpv4(
                Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::Port),
            );

            build!(packet, &original[..embed_len])
        }
        IpFamily::V6 => {
            let header = Ipv6HeaderSlice::from_slice(original)
                .context("Not an IPv6 packet")?
                .to_header();
            let embed_len = std::cmp::min(original.len(), etherparse::Ipv6Header::LEN + 8);

            let packet = PacketBuilder::ipv6(header.destination, header.source, 20).icmpv6(
                Icmpv6Type::DestinationUnreachable(icmpv6::DestUnreachableCode::Port),
            );

            build!(packet, &original[..embed_len])
        }
    }
}

/// Splits a UDP datagram into IPv4 fragments of `frag_payload_len` bytes of
/// L3 payload each (must be a multiple of 8).
pub fn udp_fragments(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    payload: &[u8],
    frag_payload_len: usize,
    identification: u16,
) -> Result<Vec<Vec<u8>>> {
    if frag_payload_len == 0 || frag_payload_len % 8 != 0 {
        bail!("fragment payload length must be a positive multiple of 8");
    }

    let datagram = udp_packet(src, dst, sport, dport, payload.to_vec())?;
    let l3_payload = &datagram[Ipv4Header::MIN_LEN..];

    let mut fragments = Vec::new();
    for (index, chunk) in l3_payload.chunks(frag_payload_len).enumerate() {
        let offset = index * frag_payload_len;
        let more_fragments = offset + chunk.len() < l3_payload.len();

        let header = Ipv4Header {
            dscp: Ipv4Dscp::ZERO,
            ecn: Ipv4Ecn::default(),
            total_len: (Ipv4Header::MIN_LEN + chunk.len()) as u16,
            identification,
            dont_fragment: false,
            more_fragments,
            fragment_offset: IpFragOffset::try_new((offset / 8) as u16)
                .context("Fragment offset out of range")?,
            time_to_live: 64,
            protocol: IpNumber::UDP,
            header_checksum: 0,
            source: src.octets(),
            destination: dst.octets(),
            options: Ipv4Options::default(),
        };

        let mut frame = Vec::with_capacity(Ipv4Header::MIN_LEN + chunk.len());
        header.write(&mut frame).context("Failed to write header")?;
        frame.extend_from_slice(chunk);

        fragments.push(frame);
    }

    Ok(fragments)
}

/// A raw UDP header plus payload, for embedding behind hand-rolled IPv6
/// extension chains. The checksum is left at zero.
pub fn udp_payload(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&sport.to_be_bytes());
    buf.extend_from_slice(&dport.to_be_bytes());
    buf.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(payload);
    buf
}

/// An IPv6 packet with a hand-rolled chain of minimal (8-byte) extension
/// headers of the given types, terminated by `final_proto` and `l4`.
pub fn ipv6_with_extensions(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    ext_types: &[u8],
    final_proto: IpNumber,
    l4: &[u8],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(ext_types.len() * 8 + l4.len());
    for index in 0..ext_types.len() {
        let next = ext_types
            .get(index + 1)
            .copied()
            .unwrap_or(final_proto.0);
        payload.extend_from_slice(&[next, 0, 0, 0, 0, 0, 0, 0]);
    }
    payload.extend_from_slice(l4);

    let next_header = ext_types.first().copied().unwrap_or(final_proto.0);

    ipv6_frame(src, dst, next_header, &payload)
}

/// An IPv6 packet consisting of a single fragment header and opaque payload.
pub fn ipv6_fragment(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    next: IpNumber,
    offset_bytes: u16,
    more_fragments: bool,
    identification: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut frag_and_payload = Vec::with_capacity(8 + payload.len());
    let raw = (offset_bytes & 0xFFF8) | u16::from(more_fragments);

    frag_and_payload.extend_from_slice(&[next.0, 0]);
    frag_and_payload.extend_from_slice(&raw.to_be_bytes());
    frag_and_payload.extend_from_slice(&identification.to_be_bytes());
    frag_and_payload.extend_from_slice(payload);

    ipv6_frame(src, dst, 44, &frag_and_payload)
}

/// Prepends an Ethernet header to an IP frame.
pub fn with_ethernet(frame: &[u8], family: IpFamily) -> Vec<u8> {
    let ether_type: u16 = match family {
        IpFamily::V4 => 0x0800,
        IpFamily::V6 => 0x86DD,
    };

    let mut buf = Vec::with_capacity(14 + frame.len());
    buf.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    buf.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    buf.extend_from_slice(&ether_type.to_be_bytes());
    buf.extend_from_slice(frame);
    buf
}

fn ipv6_frame(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(40 + payload.len());
    buf.extend_from_slice(&[0x60, 0, 0, 0]);
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.push(next_header);
    buf.push(64); // hop limit
    buf.extend_from_slice(&src.octets());
    buf.extend_from_slice(&dst.octets());
    buf.extend_from_slice(payload);
    buf
}

#[derive(thiserror::Error, Debug)]
#[error("IPs must be of the same version")]
pub struct IpVersionMismatch;
