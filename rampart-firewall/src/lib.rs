#![cfg_attr(test, allow(clippy::unwrap_used))]

//! A stateful, connection-tracking L3/L4 packet classifier.
//!
//! Every frame crossing the interface is dissected and run through three
//! policies: a longest-prefix-match deny-list, a static allow-rule table for
//! unsolicited inbound traffic, and a dynamic allow policy where outbound
//! flows create conntrack entries that admit their return traffic.
//!
//! The engine is sans-IO: handlers are plain synchronous functions safe to
//! call from many threads in parallel, and conntrack aging is driven by the
//! embedder through [`Firewall::poll_timeout`] / [`Firewall::handle_timeout`].

mod conntrack;
mod events;
mod fragment;
mod metrics;
mod rules;


pub use conntrack::{ConnEntry, ConnKey, ConnStatus};
pub use events::{ConnEvent, ConnEventKind, ConnMetricEvent};
pub use rules::{AllowRuleKey, BlockAction, icmp_rule_port};

use conntrack::{ConnTable, CtLookup};
use fragment::FragmentCache;
use ip_network::IpNetwork;
use rampart_packet::etherparse::IpNumber;
use rampart_packet::{
    Dissected, IpContext, IpFamily, PacketContext, PacketType, detect_family, dissect,
};
use rules::{BlockList, StaticRules, rule_local_port};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Echo reply type numbers, RFC 792 / RFC 4443.
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// The only synchronous output of the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Accept the packet and stop evaluating.
    Pass,
    /// Discard the packet.
    Drop,
    /// Not our policy; defer to the next classifier.
    Unspec,
}

impl Verdict {
    /// Whether the packet survives this classifier.
    pub fn allows(&self) -> bool {
        !matches!(self, Verdict::Drop)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

/// Read-only runtime configuration, supplied at load time.
#[derive(Debug, Clone)]
pub struct Config {
    /// L2 header bytes in front of the IP header: 0 for L3 devices, 14 for
    /// Ethernet.
    pub eth_net_offset: usize,
    /// Minimum spacing between metric reports of one connection.
    pub report_interval: Duration,
    /// Duration of one stage of the timeout escalator; also the refresh
    /// timeout armed on every accepted packet.
    pub conn_est_timeout: Duration,
    /// Final-release stage duration for TCP connections.
    pub tcp_release_timeout: Duration,
    /// Final-release stage duration for everything else.
    pub udp_release_timeout: Duration,
    pub conntrack_capacity: usize,
    pub conn_event_capacity: usize,
    pub metric_event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            eth_net_offset: 14,
            report_interval: Duration::from_secs(5),
            conn_est_timeout: Duration::from_secs(30),
            tcp_release_timeout: Duration::from_secs(120),
            udp_release_timeout: Duration::from_secs(60),
            conntrack_capacity: 64 * 1024,
            conn_event_capacity: 1024,
            metric_event_capacity: 4096,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidConfig {
    #[error("release timeout {release:?} must not be below the establish timeout {establish:?}")]
    ReleaseBelowEstablish {
        release: Duration,
        establish: Duration,
    },
    #[error("the L2 offset must be 0 (L3 device) or 14 (Ethernet), got {0}")]
    UnsupportedL2Offset(usize),
    #[error("capacities must be non-zero")]
    ZeroCapacity,
}

// Slots of the family/direction dispatch table.
const IPV4_EGRESS_PROG_INDEX: usize = 0;
const IPV4_INGRESS_PROG_INDEX: usize = 1;
const IPV6_EGRESS_PROG_INDEX: usize = 2;
const IPV6_INGRESS_PROG_INDEX: usize = 3;

type Classifier = fn(&Firewall, &[u8], u32, Instant) -> Verdict;

/// The four family/direction-specialized entry points. The pre-classifier
/// detects the family and jumps through this table.
static PROG_ARRAY: [Classifier; 4] = [
    ipv4_egress_classifier,
    ipv4_ingress_classifier,
    ipv6_egress_classifier,
    ipv6_ingress_classifier,
];

fn ipv4_egress_classifier(firewall: &Firewall, frame: &[u8], mark: u32, now: Instant) -> Verdict {
    firewall.classify(IpFamily::V4, Direction::Egress, frame, mark, now)
}

fn ipv4_ingress_classifier(firewall: &Firewall, frame: &[u8], mark: u32, now: Instant) -> Verdict {
    firewall.classify(IpFamily::V4, Direction::Ingress, frame, mark, now)
}

fn ipv6_egress_classifier(firewall: &Firewall, frame: &[u8], mark: u32, now: Instant) -> Verdict {
    firewall.classify(IpFamily::V6, Direction::Egress, frame, mark, now)
}

fn ipv6_ingress_classifier(firewall: &Firewall, frame: &[u8], mark: u32, now: Instant) -> Verdict {
    firewall.classify(IpFamily::V6, Direction::Ingress, frame, mark, now)
}

/// The classifier engine. All methods take `&self`; packet handlers may run
/// concurrently from any number of threads.
pub struct Firewall {
    config: Config,
    block_list: BlockList,
    allow_rules: StaticRules,
    fragments: FragmentCache,
    conntrack: ConnTable,
}

impl Firewall {
    pub fn new(config: Config) -> Result<Self, InvalidConfig> {
        if config.eth_net_offset != 0 && config.eth_net_offset != 14 {
            return Err(InvalidConfig::UnsupportedL2Offset(config.eth_net_offset));
        }

        for release in [config.tcp_release_timeout, config.udp_release_timeout] {
            if release < config.conn_est_timeout {
                return Err(InvalidConfig::ReleaseBelowEstablish {
                    release,
                    establish: config.conn_est_timeout,
                });
            }
        }

        if config.conntrack_capacity == 0
            || config.conn_event_capacity == 0
            || config.metric_event_capacity == 0
        {
            return Err(InvalidConfig::ZeroCapacity);
        }

        Ok(Self {
            block_list: BlockList::new(),
            allow_rules: StaticRules::new(),
            fragments: FragmentCache::new(),
            conntrack: ConnTable::new(&config),
            config,
        })
    }

    /// Classifies a frame leaving the host.
    ///
    /// `mark` is the upstream classification tag of the frame; it is copied
    /// into the conntrack entry as the flow id.
    pub fn handle_egress(&self, frame: &[u8], mark: u32, now: Instant) -> Verdict {
        self.dispatch(Direction::Egress, frame, mark, now)
    }

    /// Classifies a frame arriving at the host.
    pub fn handle_ingress(&self, frame: &[u8], mark: u32, now: Instant) -> Verdict {
        self.dispatch(Direction::Ingress, frame, mark, now)
    }

    fn dispatch(&self, direction: Direction, frame: &[u8], mark: u32, now: Instant) -> Verdict {
        // Not IP at all: the next classifier's problem.
        let Some(family) = detect_family(frame, self.config.eth_net_offset) else {
            return Verdict::Unspec;
        };

        let index = match (family, direction) {
            (IpFamily::V4, Direction::Egress) => IPV4_EGRESS_PROG_INDEX,
            (IpFamily::V4, Direction::Ingress) => IPV4_INGRESS_PROG_INDEX,
            (IpFamily::V6, Direction::Egress) => IPV6_EGRESS_PROG_INDEX,
            (IpFamily::V6, Direction::Ingress) => IPV6_INGRESS_PROG_INDEX,
        };

        PROG_ARRAY[index](self, frame, mark, now)
    }

    fn classify(
        &self,
        family: IpFamily,
        direction: Direction,
        frame: &[u8],
        mark: u32,
        now: Instant,
    ) -> Verdict {
        let mut packet = match dissect(frame, self.config.eth_net_offset, family) {
            Ok(Dissected::Packet(packet)) => packet,
            Ok(Dissected::PassThrough) => return Verdict::Unspec,
            Err(e) => {
                tracing::debug!("invalid packet: {e}");

                return Verdict::Drop;
            }
        };

        // ICMP errors carry the offending flow's tuple, not fragment state.
        if !packet.is_icmp_error() && self.fragments.track(&mut packet.ip).is_err() {
            return Verdict::Drop;
        }

        let remote_addr = match direction {
            Direction::Egress => packet.ip.pair.dst_addr,
            Direction::Ingress => packet.ip.pair.src_addr,
        };

        if self.block_list.contains(remote_addr) {
            return Verdict::Drop;
        }

        let now = self.conntrack.now_ns(now);

        match direction {
            Direction::Egress => self.egress_policy(&packet, frame.len() as u64, mark, now),
            Direction::Ingress => self.ingress_policy(&packet, frame.len() as u64, now),
        }
    }

    fn egress_policy(&self, packet: &PacketContext, bytes: u64, mark: u32, now: u64) -> Verdict {
        let ip = &packet.ip;

        // A static rule admits the flow without tracking it.
        let rule = AllowRuleKey {
            protocol: ip.protocol.0,
            local_port: rule_local_port(ip, ip.pair.src_port),
        };
        if self.allow_rules.matches(rule, ip.pair.dst_addr) {
            return Verdict::Pass;
        }

        let key = ConnKey {
            protocol: ip.protocol.0,
            local: SocketAddr::new(ip.pair.src_addr, ip.pair.src_port),
        };
        let remote = SocketAddr::new(ip.pair.dst_addr, ip.pair.dst_port);

        let is_icmp_error = packet.is_icmp_error();
        let echo_reply = is_icmp_echo_reply(ip);
        let allow_create = !is_icmp_error && !echo_reply && allows_initiating(ip.pkt_type);

        match self.conntrack.lookup_or_create(key, allow_create, remote, mark, now) {
            CtLookup::Exist(entry) | CtLookup::Created(entry) => {
                self.conntrack.transition_on_packet(&key, &entry, now);
                self.conntrack.record_packet(&key, &entry, false, bytes, now);

                Verdict::Pass
            }
            // An unsolicited echo reply is not ours to police.
            CtLookup::NotFound if echo_reply => Verdict::Unspec,
            CtLookup::NotFound | CtLookup::Error => Verdict::Drop,
        }
    }

    fn ingress_policy(&self, packet: &PacketContext, bytes: u64, now: u64) -> Verdict {
        let ip = &packet.ip;

        let key = ConnKey {
            protocol: ip.protocol.0,
            local: SocketAddr::new(ip.pair.dst_addr, ip.pair.dst_port),
        };

        // Return traffic of a tracked flow. Ingress never creates entries.
        if let Some(entry) = self.conntrack.lookup(&key) {
            self.conntrack.transition_on_packet(&key, &entry, now);
            self.conntrack.record_packet(&key, &entry, true, bytes, now);

            return Verdict::Pass;
        }

        let rule = AllowRuleKey {
            protocol: ip.protocol.0,
            local_port: rule_local_port(ip, ip.pair.dst_port),
        };
        if self.allow_rules.matches(rule, ip.pair.src_addr) {
            return Verdict::Pass;
        }

        Verdict::Drop
    }

    /// Denies all traffic from/to the prefix. The mark is opaque and handed
    /// back on removal.
    pub fn insert_block_rule(&self, network: IpNetwork, mark: u32) {
        self.block_list.insert(network, BlockAction { mark });
    }

    pub fn remove_block_rule(&self, network: IpNetwork) -> Option<BlockAction> {
        self.block_list.remove(network)
    }

    /// Admits unsolicited traffic for `{protocol, local_port}` from the
    /// remote prefix. For ICMP rules encode the type with [`icmp_rule_port`].
    pub fn insert_allow_rule(&self, protocol: IpNumber, local_port: u16, remote: IpNetwork) {
        self.allow_rules
            .insert(AllowRuleKey { protocol: protocol.0, local_port }, remote);
    }

    pub fn remove_allow_rule(&self, protocol: IpNumber, local_port: u16, remote: IpNetwork) -> bool {
        self.allow_rules
            .remove(AllowRuleKey { protocol: protocol.0, local_port }, remote)
    }

    pub fn connection(&self, key: &ConnKey) -> Option<Arc<ConnEntry>> {
        self.conntrack.lookup(key)
    }

    pub fn connection_count(&self) -> usize {
        self.conntrack.len()
    }

    /// The next instant at which [`Firewall::handle_timeout`] should run.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.conntrack.poll_timeout()
    }

    /// Fires all conntrack timers due at `now`.
    pub fn handle_timeout(&self, now: Instant) {
        self.conntrack.handle_timeout(now);
    }

    pub fn next_conn_event(&self) -> Option<ConnEvent> {
        self.conntrack.events().pop_conn()
    }

    pub fn next_metric_event(&self) -> Option<ConnMetricEvent> {
        self.conntrack.events().pop_metric()
    }

    /// Unload path: drops every tracked connection and cancels all timers.
    pub fn drain(&self) {
        self.conntrack.drain();
    }
}

fn allows_initiating(pkt_type: PacketType) -> bool {
    matches!(pkt_type, PacketType::Connless | PacketType::TcpSyn)
}

fn is_icmp_echo_reply(ip: &IpContext) -> bool {
    (ip.protocol == IpNumber::ICMP && ip.icmp_type == ICMPV4_ECHO_REPLY)
        || (ip.protocol == IpNumber::IPV6_ICMP && ip.icmp_type == ICMPV6_ECHO_REPLY)
}
