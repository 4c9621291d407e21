use ip_network::IpNetwork;
use ip_network_table::IpNetworkTable;
use parking_lot::RwLock;
use rampart_packet::IpContext;
use rampart_packet::etherparse::IpNumber;
use std::collections::HashMap;
use std::net::IpAddr;

/// Value of a block-list entry. The mark is opaque to the classifier;
/// existence alone means drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockAction {
    pub mark: u32,
}

/// Longest-prefix-match deny-list, one trie per family.
pub(crate) struct BlockList {
    inner: RwLock<IpNetworkTable<BlockAction>>,
}

impl BlockList {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(IpNetworkTable::new()),
        }
    }

    pub(crate) fn insert(&self, network: IpNetwork, action: BlockAction) {
        self.inner.write().insert(network, action);
    }

    pub(crate) fn remove(&self, network: IpNetwork) -> Option<BlockAction> {
        self.inner.write().remove(network)
    }

    pub(crate) fn contains(&self, addr: IpAddr) -> bool {
        self.inner.read().longest_match(addr).is_some()
    }
}

/// Identifies the local half of a static allow rule.
///
/// For TCP/UDP `local_port` is the endpoint's own port; for ICMP and ICMPv6
/// it is the ICMP type shifted into the high byte, see [`icmp_rule_port`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllowRuleKey {
    pub protocol: u8,
    pub local_port: u16,
}

/// Static allow rules: exact match on `{protocol, local_port}`, then
/// longest-prefix match on the remote address.
///
/// A hit admits the packet outright, without touching conntrack.
pub(crate) struct StaticRules {
    inner: RwLock<HashMap<AllowRuleKey, IpNetworkTable<()>>>,
}

impl StaticRules {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, key: AllowRuleKey, remote: IpNetwork) {
        self.inner
            .write()
            .entry(key)
            .or_insert_with(IpNetworkTable::new)
            .insert(remote, ());
    }

    pub(crate) fn remove(&self, key: AllowRuleKey, remote: IpNetwork) -> bool {
        let mut rules = self.inner.write();

        let Some(table) = rules.get_mut(&key) else {
            return false;
        };

        let removed = table.remove(remote).is_some();

        let (num_v4, num_v6) = table.len();
        if num_v4 == 0 && num_v6 == 0 {
            rules.remove(&key);
        }

        removed
    }

    pub(crate) fn matches(&self, key: AllowRuleKey, remote: IpAddr) -> bool {
        self.inner
            .read()
            .get(&key)
            .is_some_and(|table| table.longest_match(remote).is_some())
    }
}

/// Encodes an ICMP type into the `local_port` field of an allow rule, so an
/// administrator can admit e.g. echo requests specifically. The low byte is
/// zero, the high byte is the type.
pub fn icmp_rule_port(icmp_type: u8) -> u16 {
    u16::from(icmp_type) << 8
}

/// The `local_port` half of the rule key for a dissected packet.
pub(crate) fn rule_local_port(ip: &IpContext, local_port: u16) -> u16 {
    if ip.protocol == IpNumber::ICMP || ip.protocol == IpNumber::IPV6_ICMP {
        icmp_rule_port(ip.icmp_type)
    } else {
        local_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn network(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn block_list_matches_longest_prefix() {
        let block = BlockList::new();
        block.insert(network("198.51.100.0/24"), BlockAction { mark: 1 });

        assert!(block.contains(Ipv4Addr::new(198, 51, 100, 7).into()));
        assert!(!block.contains(Ipv4Addr::new(198, 51, 101, 7).into()));
    }

    #[test]
    fn removing_a_block_rule_unblocks() {
        let block = BlockList::new();
        block.insert(network("198.51.100.0/24"), BlockAction::default());

        assert!(block.remove(network("198.51.100.0/24")).is_some());
        assert!(!block.contains(Ipv4Addr::new(198, 51, 100, 7).into()));
    }

    #[test]
    fn allow_rule_requires_protocol_port_and_prefix() {
        let rules = StaticRules::new();
        let key = AllowRuleKey {
            protocol: 6,
            local_port: 443,
        };
        rules.insert(key, network("203.0.113.0/24"));

        let remote = IpAddr::from(Ipv4Addr::new(203, 0, 113, 9));

        assert!(rules.matches(key, remote));
        assert!(!rules.matches(
            AllowRuleKey {
                protocol: 17,
                local_port: 443
            },
            remote
        ));
        assert!(!rules.matches(
            AllowRuleKey {
                protocol: 6,
                local_port: 80
            },
            remote
        ));
        assert!(!rules.matches(key, IpAddr::from(Ipv4Addr::new(203, 0, 114, 9))));
    }

    #[test]
    fn allow_rules_are_removable() {
        let rules = StaticRules::new();
        let key = AllowRuleKey {
            protocol: 6,
            local_port: 443,
        };
        rules.insert(key, network("0.0.0.0/0"));

        assert!(rules.remove(key, network("0.0.0.0/0")));
        assert!(!rules.matches(key, IpAddr::from(Ipv4Addr::new(203, 0, 113, 9))));
        assert!(!rules.remove(key, network("0.0.0.0/0")));
    }

    #[test]
    fn icmp_type_lands_in_the_high_byte() {
        assert_eq!(icmp_rule_port(8), 0x0800);
        assert_eq!(icmp_rule_port(0), 0x0000);
        assert_eq!(icmp_rule_port(128), 0x8000);
    }
}
