#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Packet dissection for the rampart classifier: L2 family detection and
//! extraction of the L3/L4 tuple, fragment information and ICMP semantics
//! from raw frames.

pub mod make;

mod dissect;

pub use dissect::{MAX_IPV6_EXT_NUM, Dissected, dissect};
pub use etherparse;

use etherparse::IpNumber;
use std::net::{IpAddr, Ipv4Addr};

const ETH_P_IPV4: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86DD;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

/// Coarse classification of a packet, used by the conntrack state machine to
/// decide whether the packet may initiate a new flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Anything that is not TCP: UDP, ICMP queries, fragments without an L4 header.
    Connless,
    TcpSyn,
    TcpFin,
    TcpRst,
    TcpData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    /// Not fragmented.
    None,
    /// More fragments follow (MF set).
    More,
    /// The terminal fragment of a chain (MF clear, offset != 0).
    End,
}

/// The canonical L3 + L4 tuple after dissection.
///
/// Ports hold the L4 ports for TCP/UDP and the query identifier for ICMP
/// echo/timestamp messages so that request and reply key symmetrically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InetPair {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct IpContext {
    pub pair: InetPair,
    pub protocol: IpNumber,
    pub pkt_type: PacketType,
    pub fragment: FragmentKind,
    /// Fragment offset in bytes.
    pub fragment_offset: u16,
    pub fragment_id: u32,
    /// The outer ICMP type for ICMP/ICMPv6 packets, 0 otherwise.
    pub icmp_type: u8,
}

impl IpContext {
    fn new(src_addr: IpAddr, dst_addr: IpAddr, protocol: IpNumber) -> Self {
        Self {
            pair: InetPair {
                src_addr,
                dst_addr,
                src_port: 0,
                dst_port: 0,
            },
            protocol,
            pkt_type: PacketType::Connless,
            fragment: FragmentKind::None,
            fragment_offset: 0,
            fragment_id: 0,
            icmp_type: 0,
        }
    }
}

impl Default for IpContext {
    fn default() -> Self {
        Self::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpNumber(0),
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PacketContext {
    pub ip: IpContext,
    /// Offset of the L4 header within the frame.
    ///
    /// `None` when the packet is a non-first fragment and carries no L4
    /// header; the fragment tracker fills the ports in from its cache.
    pub l4_offset: Option<usize>,
    /// Offset of the embedded L4 header when the packet is an ICMP error.
    pub icmp_error_offset: Option<usize>,
}

impl PacketContext {
    pub fn is_icmp_error(&self) -> bool {
        self.l4_offset.is_some() && self.icmp_error_offset.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DissectError {
    #[error("truncated packet reading {0}")]
    Truncated(&'static str),
    #[error("malformed {layer} header: {message}")]
    Malformed {
        layer: &'static str,
        message: String,
    },
    #[error("IP destination address does not match source address inside ICMP error message")]
    IcmpErrorAddressMismatch,
    #[error("ICMP error payload is itself fragmented")]
    FragmentedIcmpError,
}

/// Determines the address family of a frame, from the EtherType when an L2
/// header is present and from the version nibble otherwise.
///
/// `None` means the frame is not IP and is none of our business.
pub fn detect_family(frame: &[u8], eth_net_offset: usize) -> Option<IpFamily> {
    if eth_net_offset == 0 {
        match frame.first()? >> 4 {
            4 => Some(IpFamily::V4),
            6 => Some(IpFamily::V6),
            _ => None,
        }
    } else {
        let raw = frame.get(eth_net_offset - 2..eth_net_offset)?;
        match u16::from_be_bytes([raw[0], raw[1]]) {
            ETH_P_IPV4 => Some(IpFamily::V4),
            ETH_P_IPV6 => Some(IpFamily::V6),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_from_version_nibble() {
        assert_eq!(detect_family(&[0x45, 0x00], 0), Some(IpFamily::V4));
        assert_eq!(detect_family(&[0x60, 0x00], 0), Some(IpFamily::V6));
        assert_eq!(detect_family(&[0x12, 0x00], 0), None);
        assert_eq!(detect_family(&[], 0), None);
    }

    #[test]
    fn family_from_ether_type() {
        let mut frame = [0u8; 14];

        frame[12..14].copy_from_slice(&ETH_P_IPV4.to_be_bytes());
        assert_eq!(detect_family(&frame, 14), Some(IpFamily::V4));

        frame[12..14].copy_from_slice(&ETH_P_IPV6.to_be_bytes());
        assert_eq!(detect_family(&frame, 14), Some(IpFamily::V6));

        frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes()); // ARP
        assert_eq!(detect_family(&frame, 14), None);

        assert_eq!(detect_family(&frame[..10], 14), None);
    }
}
