use crate::{
    DissectError, FragmentKind, IpContext, IpFamily, PacketContext, PacketType,
};
use etherparse::{
    Icmpv4Slice, Icmpv4Type, Icmpv6Slice, Icmpv6Type, IpNumber, Ipv4HeaderSlice, Ipv6HeaderSlice,
    TcpHeaderSlice, UdpHeaderSlice,
};
use std::net::IpAddr;

/// Upper bound on the number of IPv6 extension headers walked before the
/// packet is handed to the next classifier. Bounds worst-case parse time.
pub const MAX_IPV6_EXT_NUM: usize = 8;

/// The fixed part of an ICMP header; error messages embed the offending IP
/// header right after it.
const ICMP_HEADER_LEN: usize = 8;

/// Only the first 8 bytes of the embedded L4 header are guaranteed to be
/// present in an ICMP error message.
const ICMP_ERROR_L4_LEN: usize = 8;

/// Offset mask and MF bit of the IPv6 fragment header, in header byte order.
const IPV6_FRAG_OFFSET: u16 = 0xFFF8;
const IPV6_FRAG_MF: u16 = 0x0001;

/// Outcome of a successful dissection.
#[derive(Debug)]
pub enum Dissected {
    Packet(PacketContext),
    /// The packet is valid but not ours to classify (IPsec, unknown L4,
    /// unhandled ICMP type, extension chain too long).
    PassThrough,
}

enum HeaderOutcome {
    Header(IpContext),
    PassThrough,
}

enum IcmpClass {
    Query(u16),
    Error,
    Unspec,
}

enum IcmpOutcome {
    Classified,
    Error { inner_l4_offset: usize },
    PassThrough,
}

/// Dissects a raw frame into a [`PacketContext`].
///
/// `eth_net_offset` is the size of the L2 header (0 for L3 devices, 14 for
/// Ethernet). The caller determines the family up front, see
/// [`crate::detect_family`].
///
/// Errors mean the packet is malformed and must be dropped;
/// [`Dissected::PassThrough`] means it is well-formed but outside our policy.
pub fn dissect(
    frame: &[u8],
    eth_net_offset: usize,
    family: IpFamily,
) -> Result<Dissected, DissectError> {
    let mut cursor = eth_net_offset;

    let mut ip = match extract_ip_header(frame, &mut cursor, family)? {
        HeaderOutcome::Header(ip) => ip,
        HeaderOutcome::PassThrough => return Ok(Dissected::PassThrough),
    };

    // Not the first fragment: the whole payload is L4 data and there is no
    // L4 header to read. The fragment tracker supplies the ports.
    if ip.fragment != FragmentKind::None && ip.fragment_offset != 0 {
        return Ok(Dissected::Packet(PacketContext {
            ip,
            l4_offset: None,
            icmp_error_offset: None,
        }));
    }

    let l4_offset = cursor;
    let mut icmp_error_offset = None;

    match ip.protocol {
        IpNumber::TCP => {
            let tcp = TcpHeaderSlice::from_slice(
                frame.get(cursor..).ok_or(DissectError::Truncated("TCP header"))?,
            )
            .map_err(|e| malformed("TCP", e))?;

            ip.pair.src_port = tcp.source_port();
            ip.pair.dst_port = tcp.destination_port();
            ip.pkt_type = if tcp.fin() {
                PacketType::TcpFin
            } else if tcp.rst() {
                PacketType::TcpRst
            } else if tcp.syn() {
                PacketType::TcpSyn
            } else {
                PacketType::TcpData
            };
        }
        IpNumber::UDP => {
            let udp = UdpHeaderSlice::from_slice(
                frame.get(cursor..).ok_or(DissectError::Truncated("UDP header"))?,
            )
            .map_err(|e| malformed("UDP", e))?;

            ip.pair.src_port = udp.source_port();
            ip.pair.dst_port = udp.destination_port();
        }
        IpNumber::ICMP if family == IpFamily::V4 => {
            match extract_icmpv4(frame, &mut ip, cursor)? {
                IcmpOutcome::Classified => {}
                IcmpOutcome::Error { inner_l4_offset } => {
                    icmp_error_offset = Some(inner_l4_offset)
                }
                IcmpOutcome::PassThrough => return Ok(Dissected::PassThrough),
            }
        }
        IpNumber::IPV6_ICMP if family == IpFamily::V6 => {
            match extract_icmpv6(frame, &mut ip, cursor)? {
                IcmpOutcome::Classified => {}
                IcmpOutcome::Error { inner_l4_offset } => {
                    icmp_error_offset = Some(inner_l4_offset)
                }
                IcmpOutcome::PassThrough => return Ok(Dissected::PassThrough),
            }
        }
        _ => return Ok(Dissected::PassThrough), // unknown L4 is not our policy
    }

    Ok(Dissected::Packet(PacketContext {
        ip,
        l4_offset: Some(l4_offset),
        icmp_error_offset,
    }))
}

fn extract_ip_header(
    frame: &[u8],
    cursor: &mut usize,
    family: IpFamily,
) -> Result<HeaderOutcome, DissectError> {
    match family {
        IpFamily::V4 => extract_ipv4_header(frame, cursor).map(HeaderOutcome::Header),
        IpFamily::V6 => extract_ipv6_header(frame, cursor),
    }
}

fn extract_ipv4_header(frame: &[u8], cursor: &mut usize) -> Result<IpContext, DissectError> {
    let slice = frame
        .get(*cursor..)
        .ok_or(DissectError::Truncated("IPv4 header"))?;
    let header = Ipv4HeaderSlice::from_slice(slice)
        .map_err(|e| malformed("IPv4", e))?
        .to_header();

    let mut ip = IpContext::new(
        IpAddr::from(header.source),
        IpAddr::from(header.destination),
        header.protocol,
    );

    ip.fragment_offset = header.fragment_offset.value() << 3;
    ip.fragment = if header.more_fragments {
        FragmentKind::More
    } else if ip.fragment_offset != 0 {
        FragmentKind::End
    } else {
        FragmentKind::None
    };
    ip.fragment_id = u32::from(header.identification);

    *cursor += header.header_len();

    Ok(ip)
}

fn extract_ipv6_header(
    frame: &[u8],
    cursor: &mut usize,
) -> Result<HeaderOutcome, DissectError> {
    let slice = frame
        .get(*cursor..)
        .ok_or(DissectError::Truncated("IPv6 header"))?;
    let header = Ipv6HeaderSlice::from_slice(slice)
        .map_err(|e| malformed("IPv6", e))?
        .to_header();

    let start = *cursor;
    let mut len = etherparse::Ipv6Header::LEN;
    let mut next_header = header.next_header;
    let mut fragment_header = None;

    for _ in 0..MAX_IPV6_EXT_NUM {
        match next_header {
            // IPsec passes through unclassified.
            IpNumber::AUTHENTICATION_HEADER => return Ok(HeaderOutcome::PassThrough),
            IpNumber::IPV6_FRAGMENTATION_HEADER
            | IpNumber::IPV6_HEADER_HOP_BY_HOP
            | IpNumber::IPV6_ROUTE_HEADER
            | IpNumber::IPV6_DESTINATION_OPTIONS => {
                if next_header == IpNumber::IPV6_FRAGMENTATION_HEADER {
                    fragment_header = Some(start + len);
                }

                let opt = frame
                    .get(start + len..start + len + 2)
                    .ok_or(DissectError::Truncated("IPv6 extension header"))?;
                next_header = IpNumber(opt[0]);
                len += (usize::from(opt[1]) + 1) * 8;
            }
            _ => break,
        }
    }

    // Either the walk limit was reached mid-chain or the upper layer is one
    // we do not classify.
    match next_header {
        IpNumber::TCP | IpNumber::UDP | IpNumber::IPV6_ICMP => {}
        _ => return Ok(HeaderOutcome::PassThrough),
    }

    let mut ip = IpContext::new(
        IpAddr::from(header.source),
        IpAddr::from(header.destination),
        next_header,
    );

    if let Some(offset) = fragment_header {
        let bytes = frame
            .get(offset..offset + 8)
            .ok_or(DissectError::Truncated("IPv6 fragment header"))?;
        let raw = u16::from_be_bytes([bytes[2], bytes[3]]);

        ip.fragment_id = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        ip.fragment_offset = raw & IPV6_FRAG_OFFSET;
        ip.fragment = if raw & IPV6_FRAG_MF != 0 {
            FragmentKind::More
        } else if ip.fragment_offset != 0 {
            FragmentKind::End
        } else {
            FragmentKind::None
        };
    }

    *cursor = start + len;

    Ok(HeaderOutcome::Header(ip))
}

fn extract_icmpv4(
    frame: &[u8],
    ip: &mut IpContext,
    l4_offset: usize,
) -> Result<IcmpOutcome, DissectError> {
    let icmp = Icmpv4Slice::from_slice(
        frame
            .get(l4_offset..)
            .ok_or(DissectError::Truncated("ICMP header"))?,
    )
    .map_err(|e| malformed("ICMPv4", e))?;

    ip.icmp_type = icmp.type_u8();

    match classify_icmpv4(&icmp.icmp_type()) {
        IcmpClass::Query(id) => {
            ip.pair.src_port = id;
            ip.pair.dst_port = id;
            Ok(IcmpOutcome::Classified)
        }
        IcmpClass::Error => {
            extract_icmp_error(frame, ip, l4_offset + ICMP_HEADER_LEN, IpFamily::V4)
        }
        IcmpClass::Unspec => Ok(IcmpOutcome::PassThrough),
    }
}

fn extract_icmpv6(
    frame: &[u8],
    ip: &mut IpContext,
    l4_offset: usize,
) -> Result<IcmpOutcome, DissectError> {
    let icmp = Icmpv6Slice::from_slice(
        frame
            .get(l4_offset..)
            .ok_or(DissectError::Truncated("ICMPv6 header"))?,
    )
    .map_err(|e| malformed("ICMPv6", e))?;

    ip.icmp_type = icmp.type_u8();

    match classify_icmpv6(&icmp.icmp_type()) {
        IcmpClass::Query(id) => {
            ip.pair.src_port = id;
            ip.pair.dst_port = id;
            Ok(IcmpOutcome::Classified)
        }
        IcmpClass::Error => {
            extract_icmp_error(frame, ip, l4_offset + ICMP_HEADER_LEN, IpFamily::V6)
        }
        IcmpClass::Unspec => Ok(IcmpOutcome::PassThrough),
    }
}

/// Parses the packet embedded in an ICMP error message and swaps the outer
/// tuple with the inner one, so that the error keys to the conntrack entry
/// of the flow it complains about.
fn extract_icmp_error(
    frame: &[u8],
    outer: &mut IpContext,
    inner_l3_offset: usize,
    family: IpFamily,
) -> Result<IcmpOutcome, DissectError> {
    let mut cursor = inner_l3_offset;

    let mut inner = match extract_ip_header(frame, &mut cursor, family)? {
        HeaderOutcome::Header(inner) => inner,
        // An embedded packet we cannot even walk is not worth forgiving.
        HeaderOutcome::PassThrough => {
            return Err(DissectError::Malformed {
                layer: "ICMP error payload",
                message: "embedded packet is not classifiable".to_owned(),
            });
        }
    };

    // Errors about non-first fragments cannot be attributed to a flow.
    if inner.fragment_offset != 0 {
        return Err(DissectError::FragmentedIcmpError);
    }

    if !extract_icmp_error_l4(frame, &mut inner, cursor)? {
        return Ok(IcmpOutcome::PassThrough);
    }

    if outer.pair.dst_addr != inner.pair.src_addr {
        return Err(DissectError::IcmpErrorAddressMismatch);
    }

    outer.pair.src_addr = inner.pair.dst_addr;
    outer.pair.src_port = inner.pair.dst_port;
    outer.pair.dst_port = inner.pair.src_port;
    outer.protocol = inner.protocol;

    Ok(IcmpOutcome::Error {
        inner_l4_offset: cursor,
    })
}

/// Reads the guaranteed first 8 bytes of the embedded L4 header.
///
/// Returns `false` when the embedded protocol is not one we classify
/// (including nested ICMP errors).
fn extract_icmp_error_l4(
    frame: &[u8],
    inner: &mut IpContext,
    l4_offset: usize,
) -> Result<bool, DissectError> {
    let bytes = frame
        .get(l4_offset..l4_offset + ICMP_ERROR_L4_LEN)
        .ok_or(DissectError::Truncated("ICMP error payload"))?;

    match inner.protocol {
        IpNumber::TCP | IpNumber::UDP => {
            inner.pair.src_port = u16::from_be_bytes([bytes[0], bytes[1]]);
            inner.pair.dst_port = u16::from_be_bytes([bytes[2], bytes[3]]);

            Ok(true)
        }
        // Only 8 bytes of the embedded message are guaranteed, which is too
        // short for the typed ICMP slices; the type and the query identifier
        // sit at fixed offsets.
        IpNumber::ICMP => match icmpv4_type_class(bytes[0]) {
            RawIcmpClass::Query => {
                let id = u16::from_be_bytes([bytes[4], bytes[5]]);
                inner.pair.src_port = id;
                inner.pair.dst_port = id;

                Ok(true)
            }
            // Nested ICMP errors are not parsed.
            RawIcmpClass::Error | RawIcmpClass::Unspec => Ok(false),
        },
        IpNumber::IPV6_ICMP => match icmpv6_type_class(bytes[0]) {
            RawIcmpClass::Query => {
                let id = u16::from_be_bytes([bytes[4], bytes[5]]);
                inner.pair.src_port = id;
                inner.pair.dst_port = id;

                Ok(true)
            }
            RawIcmpClass::Error | RawIcmpClass::Unspec => Ok(false),
        },
        _ => Ok(false),
    }
}

enum RawIcmpClass {
    Query,
    Error,
    Unspec,
}

// ICMP type numbers per RFC 792.
fn icmpv4_type_class(icmp_type: u8) -> RawIcmpClass {
    match icmp_type {
        3 | 11 | 12 => RawIcmpClass::Error,       // unreachable, time exceeded, param problem
        0 | 8 | 13 | 14 => RawIcmpClass::Query,   // echo and timestamp, both directions
        _ => RawIcmpClass::Unspec,
    }
}

// ICMPv6 type numbers per RFC 4443.
fn icmpv6_type_class(icmp_type: u8) -> RawIcmpClass {
    match icmp_type {
        1 | 2 | 3 | 4 => RawIcmpClass::Error,     // unreachable, too big, time exceeded, param problem
        128 | 129 => RawIcmpClass::Query,
        _ => RawIcmpClass::Unspec,
    }
}

fn classify_icmpv4(icmp_type: &Icmpv4Type) -> IcmpClass {
    #[expect(
        clippy::wildcard_enum_match_arm,
        reason = "Everything else is not our policy"
    )]
    match icmp_type {
        Icmpv4Type::DestinationUnreachable(_)
        | Icmpv4Type::TimeExceeded(_)
        | Icmpv4Type::ParameterProblem(_) => IcmpClass::Error,
        Icmpv4Type::EchoRequest(header) | Icmpv4Type::EchoReply(header) => {
            IcmpClass::Query(header.id)
        }
        Icmpv4Type::TimestampRequest(message) | Icmpv4Type::TimestampReply(message) => {
            IcmpClass::Query(message.id)
        }
        _ => IcmpClass::Unspec,
    }
}

fn classify_icmpv6(icmp_type: &Icmpv6Type) -> IcmpClass {
    #[expect(
        clippy::wildcard_enum_match_arm,
        reason = "Everything else (NDP in particular) is not our policy"
    )]
    match icmp_type {
        Icmpv6Type::DestinationUnreachable(_)
        | Icmpv6Type::PacketTooBig { .. }
        | Icmpv6Type::TimeExceeded(_)
        | Icmpv6Type::ParameterProblem(_) => IcmpClass::Error,
        Icmpv6Type::EchoRequest(header) | Icmpv6Type::EchoReply(header) => {
            IcmpClass::Query(header.id)
        }
        _ => IcmpClass::Unspec,
    }
}

fn malformed(layer: &'static str, error: impl std::fmt::Display) -> DissectError {
    DissectError::Malformed {
        layer,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::make;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const DST: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 9);
    const SRC6: Ipv6Addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
    const DST6: Ipv6Addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2);

    fn packet(frame: &[u8], family: IpFamily) -> PacketContext {
        match dissect(frame, 0, family).unwrap() {
            Dissected::Packet(p) => p,
            Dissected::PassThrough => panic!("expected a classified packet"),
        }
    }

    #[test]
    fn udp_tuple() {
        let frame = make::udp_packet(SRC, DST, 5000, 53, b"hello".to_vec()).unwrap();

        let p = packet(&frame, IpFamily::V4);

        assert_eq!(p.ip.pair.src_addr, IpAddr::from(SRC));
        assert_eq!(p.ip.pair.dst_addr, IpAddr::from(DST));
        assert_eq!(p.ip.pair.src_port, 5000);
        assert_eq!(p.ip.pair.dst_port, 53);
        assert_eq!(p.ip.protocol, IpNumber::UDP);
        assert_eq!(p.ip.pkt_type, PacketType::Connless);
        assert_eq!(p.ip.fragment, FragmentKind::None);
        assert!(!p.is_icmp_error());
    }

    #[test]
    fn tcp_flag_precedence() {
        for (flags, expected) in [
            (make::TcpFlags { syn: true, ..Default::default() }, PacketType::TcpSyn),
            (make::TcpFlags { fin: true, ..Default::default() }, PacketType::TcpFin),
            (make::TcpFlags { rst: true, ..Default::default() }, PacketType::TcpRst),
            (make::TcpFlags::default(), PacketType::TcpData),
            (
                // FIN wins over SYN, mirroring the header walk order.
                make::TcpFlags { syn: true, fin: true, rst: false },
                PacketType::TcpFin,
            ),
        ] {
            let frame = make::tcp_packet(SRC, DST, 40000, 443, flags, vec![]).unwrap();

            assert_eq!(packet(&frame, IpFamily::V4).ip.pkt_type, expected);
        }
    }

    #[test]
    fn icmp_echo_keys_on_identifier() {
        let frame = make::icmp_request_packet(SRC.into(), DST, 1, 7, b"ping").unwrap();

        let p = packet(&frame, IpFamily::V4);

        assert_eq!(p.ip.pair.src_port, 7);
        assert_eq!(p.ip.pair.dst_port, 7);
        assert_eq!(p.ip.icmp_type, 8);
    }

    #[test]
    fn icmpv6_echo_keys_on_identifier() {
        let frame = make::icmp_reply_packet(SRC6.into(), DST6, 1, 9, b"pong").unwrap();

        let p = packet(&frame, IpFamily::V6);

        assert_eq!(p.ip.pair.src_port, 9);
        assert_eq!(p.ip.pair.dst_port, 9);
        assert_eq!(p.ip.icmp_type, 129);
    }

    #[test]
    fn icmp_timestamp_is_a_query() {
        let frame = make::icmp_timestamp_request(SRC, DST, 21).unwrap();

        let p = packet(&frame, IpFamily::V4);

        assert_eq!(p.ip.pair.src_port, 21);
        assert_eq!(p.ip.pair.dst_port, 21);
    }

    #[test]
    fn icmp_error_swaps_tuple_with_inner_packet() {
        let original = make::udp_packet(SRC, DST, 5000, 4000, b"probe".to_vec()).unwrap();
        let frame = make::icmp_dest_unreachable(&original, IpFamily::V4).unwrap();

        let p = packet(&frame, IpFamily::V4);

        assert!(p.is_icmp_error());
        // The error now keys like a reply of the original flow.
        assert_eq!(p.ip.pair.src_addr, IpAddr::from(DST));
        assert_eq!(p.ip.pair.dst_addr, IpAddr::from(SRC));
        assert_eq!(p.ip.pair.src_port, 4000);
        assert_eq!(p.ip.pair.dst_port, 5000);
        assert_eq!(p.ip.protocol, IpNumber::UDP);
    }

    #[test]
    fn icmp_error_with_mismatching_inner_source_is_malformed() {
        let original = make::udp_packet(SRC, DST, 5000, 4000, vec![]).unwrap();
        let mut frame = make::icmp_dest_unreachable(&original, IpFamily::V4).unwrap();

        // Corrupt the embedded source address so it no longer matches the
        // outer destination.
        let inner_src = frame.len() - original.len() + 12;
        frame[inner_src] ^= 0xff;

        assert!(matches!(
            dissect(&frame, 0, IpFamily::V4),
            Err(DissectError::IcmpErrorAddressMismatch)
        ));
    }

    #[test]
    fn unknown_icmp_type_passes_through() {
        // Type 9 is a router advertisement.
        let frame = make::icmpv4_raw(SRC, DST, 9, 0, &[0u8; 4]).unwrap();

        assert!(matches!(
            dissect(&frame, 0, IpFamily::V4).unwrap(),
            Dissected::PassThrough
        ));
    }

    #[test]
    fn first_fragment_carries_ports() {
        let fragments =
            make::udp_fragments(SRC, DST, 5000, 4000, &[0xab; 64], 32, 0x1234).unwrap();

        let p = packet(&fragments[0], IpFamily::V4);

        assert_eq!(p.ip.fragment, FragmentKind::More);
        assert_eq!(p.ip.fragment_offset, 0);
        assert_eq!(p.ip.fragment_id, 0x1234);
        assert_eq!(p.ip.pair.src_port, 5000);
        assert!(p.l4_offset.is_some());
    }

    #[test]
    fn later_fragment_has_no_l4_header() {
        let fragments =
            make::udp_fragments(SRC, DST, 5000, 4000, &[0xab; 64], 32, 0x1234).unwrap();

        let p = packet(&fragments[1], IpFamily::V4);

        assert_ne!(p.ip.fragment, FragmentKind::None);
        assert_ne!(p.ip.fragment_offset, 0);
        assert_eq!(p.ip.fragment_id, 0x1234);
        assert_eq!(p.ip.pair.src_port, 0);
        assert_eq!(p.ip.pair.dst_port, 0);
        assert!(p.l4_offset.is_none());
    }

    #[test]
    fn ipv6_hop_by_hop_chain_is_walked() {
        let udp = make::udp_payload(5000, 4000, b"x");
        let frame = make::ipv6_with_extensions(SRC6, DST6, &[0, 60], IpNumber::UDP, &udp);

        let p = packet(&frame, IpFamily::V6);

        assert_eq!(p.ip.protocol, IpNumber::UDP);
        assert_eq!(p.ip.pair.src_port, 5000);
        assert_eq!(p.ip.pair.dst_port, 4000);
    }

    #[test]
    fn ipv6_auth_header_passes_through() {
        let udp = make::udp_payload(5000, 4000, b"x");
        let frame = make::ipv6_with_extensions(SRC6, DST6, &[51], IpNumber::UDP, &udp);

        assert!(matches!(
            dissect(&frame, 0, IpFamily::V6).unwrap(),
            Dissected::PassThrough
        ));
    }

    #[test]
    fn ipv6_extension_walk_is_bounded() {
        let udp = make::udp_payload(5000, 4000, b"x");
        let exts = vec![0u8; MAX_IPV6_EXT_NUM + 1];
        let frame = make::ipv6_with_extensions(SRC6, DST6, &exts, IpNumber::UDP, &udp);

        assert!(matches!(
            dissect(&frame, 0, IpFamily::V6).unwrap(),
            Dissected::PassThrough
        ));
    }

    #[test]
    fn ipv6_fragment_header_is_parsed() {
        let frame = make::ipv6_fragment(SRC6, DST6, IpNumber::UDP, 1024, true, 0xdead_beef, &[0u8; 16]);

        let p = packet(&frame, IpFamily::V6);

        assert_eq!(p.ip.fragment, FragmentKind::More);
        assert_eq!(p.ip.fragment_offset, 1024);
        assert_eq!(p.ip.fragment_id, 0xdead_beef);
        assert!(p.l4_offset.is_none());
    }

    #[test]
    fn truncated_packet_is_malformed() {
        let frame = make::udp_packet(SRC, DST, 5000, 53, vec![]).unwrap();

        assert!(dissect(&frame[..10], 0, IpFamily::V4).is_err());
    }

    #[test]
    fn ethernet_header_is_skipped() {
        let frame = make::with_ethernet(
            &make::udp_packet(SRC, DST, 5000, 53, vec![]).unwrap(),
            IpFamily::V4,
        );

        let p = match dissect(&frame, 14, IpFamily::V4).unwrap() {
            Dissected::Packet(p) => p,
            Dissected::PassThrough => panic!("expected a classified packet"),
        };

        assert_eq!(p.ip.pair.src_port, 5000);
    }
}
