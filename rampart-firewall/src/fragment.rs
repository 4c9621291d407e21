use lru::LruCache;
use parking_lot::Mutex;
use rampart_packet::{FragmentKind, IpContext};
use std::net::IpAddr;
use std::num::NonZeroUsize;

/// Capacity of the first-fragment port cache. Overflow evicts the least
/// recently used datagram.
const FRAGMENT_CACHE_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    protocol: u8,
    id: u32,
    src_addr: IpAddr,
    dst_addr: IpAddr,
}

#[derive(Debug, Clone, Copy)]
struct FragmentPorts {
    sport: u16,
    dport: u16,
}

#[derive(Debug, thiserror::Error)]
#[error("fragmentation session of this packet was not tracked")]
pub struct UntrackedFragment;

/// Remembers the L4 ports carried in first fragments so that later fragments
/// of the same datagram can be classified.
///
/// Entries are never explicitly deleted; LRU eviction is the sole removal
/// path.
pub(crate) struct FragmentCache {
    inner: Mutex<LruCache<FragmentKey, FragmentPorts>>,
}

impl FragmentCache {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(FRAGMENT_CACHE_SIZE).expect("cache size is non-zero"),
            )),
        }
    }

    /// Records first fragments and resolves the ports of later ones.
    ///
    /// An untracked non-first fragment cannot be classified and must be
    /// dropped.
    pub(crate) fn track(&self, ip: &mut IpContext) -> Result<(), UntrackedFragment> {
        // Unfragmented packets need no bookkeeping. An END fragment at
        // offset 0 cannot occur but would carry its own L4 header.
        if ip.fragment == FragmentKind::None
            || (ip.fragment == FragmentKind::End && ip.fragment_offset == 0)
        {
            return Ok(());
        }

        let key = FragmentKey {
            protocol: ip.protocol.0,
            id: ip.fragment_id,
            src_addr: ip.pair.src_addr,
            dst_addr: ip.pair.dst_addr,
        };

        let mut cache = self.inner.lock();

        if ip.fragment == FragmentKind::More && ip.fragment_offset == 0 {
            cache.put(
                key,
                FragmentPorts {
                    sport: ip.pair.src_port,
                    dport: ip.pair.dst_port,
                },
            );

            return Ok(());
        }

        match cache.get(&key) {
            Some(ports) => {
                ip.pair.src_port = ports.sport;
                ip.pair.dst_port = ports.dport;

                Ok(())
            }
            None => {
                tracing::warn!("fragmentation session of this packet was not tracked");

                Err(UntrackedFragment)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_packet::etherparse::IpNumber;
    use rampart_packet::{InetPair, PacketType};
    use std::net::Ipv4Addr;

    fn fragment(offset: u16, kind: FragmentKind, id: u32) -> IpContext {
        IpContext {
            pair: InetPair {
                src_addr: Ipv4Addr::new(10, 0, 0, 5).into(),
                dst_addr: Ipv4Addr::new(192, 0, 2, 9).into(),
                src_port: 0,
                dst_port: 0,
            },
            protocol: IpNumber::UDP,
            pkt_type: PacketType::Connless,
            fragment: kind,
            fragment_offset: offset,
            fragment_id: id,
            icmp_type: 0,
        }
    }

    #[test]
    fn later_fragment_inherits_first_fragment_ports() {
        let cache = FragmentCache::new();

        let mut first = fragment(0, FragmentKind::More, 7);
        first.pair.src_port = 5000;
        first.pair.dst_port = 4000;
        cache.track(&mut first).unwrap();

        let mut second = fragment(32, FragmentKind::End, 7);
        cache.track(&mut second).unwrap();

        assert_eq!(second.pair.src_port, 5000);
        assert_eq!(second.pair.dst_port, 4000);
    }

    #[test]
    fn untracked_fragment_is_an_error() {
        let cache = FragmentCache::new();

        let mut second = fragment(32, FragmentKind::End, 7);

        assert!(cache.track(&mut second).is_err());
    }

    #[test]
    fn unfragmented_packets_are_ignored() {
        let cache = FragmentCache::new();

        let mut packet = fragment(0, FragmentKind::None, 7);
        packet.pair.src_port = 5000;
        cache.track(&mut packet).unwrap();

        // Nothing was cached under this id.
        let mut second = fragment(32, FragmentKind::End, 7);
        assert!(cache.track(&mut second).is_err());
    }

    #[test]
    fn capacity_overflow_evicts_least_recently_used() {
        let cache = FragmentCache::new();

        for id in 0..=FRAGMENT_CACHE_SIZE as u32 {
            let mut first = fragment(0, FragmentKind::More, id);
            first.pair.src_port = 1;
            cache.track(&mut first).unwrap();
        }

        // Datagram 0 was the least recently used and fell out.
        let mut second = fragment(32, FragmentKind::End, 0);
        assert!(cache.track(&mut second).is_err());

        let mut second = fragment(32, FragmentKind::End, 1);
        assert!(cache.track(&mut second).is_ok());
    }
}
