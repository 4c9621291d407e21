//! The connection-tracking table.
//!
//! Entries are keyed on the host's own endpoint only, so any remote may
//! reuse an established outbound flow. Lifetime is governed by a per-entry
//! timer that escalates through `Active -> Timeout1 -> Timeout2 -> Release`
//! and finally deletes the entry; any accepted packet resets the escalator.
//!
//! Timers are realized as an atomic per-entry deadline plus a shared wheel
//! of wakeups. The callback operates on keys and re-looks the entry up, so
//! there is no entry <-> timer pointer cycle; a wakeup that finds the
//! deadline moved simply re-schedules itself.

use crate::Config;
use crate::events::{ConnEvent, ConnEventKind, EventChannels};
use crate::metrics::{self, ReportOutcome};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rampart_packet::etherparse::IpNumber;
use std::collections::BTreeMap;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Reserved value of the per-side statuses.
const CONN_CLOSED: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnStatus {
    Init = 0,
    Active = 1,
    Timeout1 = 2,
    Timeout2 = 3,
    Release = 4,
}

impl ConnStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnStatus::Init,
            1 => ConnStatus::Active,
            2 => ConnStatus::Timeout1,
            3 => ConnStatus::Timeout2,
            _ => ConnStatus::Release,
        }
    }
}

/// Identifies a tracked connection by the host's endpoint.
///
/// The remote endpoint deliberately does not participate: return traffic
/// from any remote matches the flow it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub protocol: u8,
    pub local: SocketAddr,
}

/// A tracked connection. All mutable state is atomic; packet paths on
/// different CPUs and the timer callback mutate entries concurrently.
pub struct ConnEntry {
    pub(crate) trigger: SocketAddr,
    pub(crate) flow_id: u32,
    pub(crate) create_time: u64,
    pub(crate) conn_status: AtomicU8,
    pub(crate) local_status: AtomicU8,
    pub(crate) remote_status: AtomicU8,
    pub(crate) last_upload_ts: AtomicU64,
    pub(crate) ingress_bytes: AtomicU64,
    pub(crate) ingress_packets: AtomicU64,
    pub(crate) egress_bytes: AtomicU64,
    pub(crate) egress_packets: AtomicU64,
    timer_deadline: AtomicU64,
}

impl ConnEntry {
    fn new(trigger: SocketAddr, flow_id: u32, now: u64) -> Self {
        Self {
            trigger,
            flow_id,
            create_time: now,
            conn_status: AtomicU8::new(ConnStatus::Init as u8),
            local_status: AtomicU8::new(CONN_CLOSED),
            remote_status: AtomicU8::new(CONN_CLOSED),
            last_upload_ts: AtomicU64::new(0),
            ingress_bytes: AtomicU64::new(0),
            ingress_packets: AtomicU64::new(0),
            egress_bytes: AtomicU64::new(0),
            egress_packets: AtomicU64::new(0),
            timer_deadline: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> ConnStatus {
        ConnStatus::from_u8(self.conn_status.load(Ordering::Acquire))
    }

    /// The remote endpoint whose packet created this entry.
    pub fn trigger(&self) -> SocketAddr {
        self.trigger
    }

    pub fn flow_id(&self) -> u32 {
        self.flow_id
    }

    /// Engine-relative monotonic nanoseconds.
    pub fn create_time(&self) -> u64 {
        self.create_time
    }

    /// Reserved per-side status, unused by the current state machine.
    pub fn local_status(&self) -> u8 {
        self.local_status.load(Ordering::Acquire)
    }

    /// Reserved per-side status, unused by the current state machine.
    pub fn remote_status(&self) -> u8 {
        self.remote_status.load(Ordering::Acquire)
    }

    /// Bytes accepted on ingress since the last metric report.
    pub fn ingress_bytes(&self) -> u64 {
        self.ingress_bytes.load(Ordering::Acquire)
    }

    pub fn ingress_packets(&self) -> u64 {
        self.ingress_packets.load(Ordering::Acquire)
    }

    /// Bytes accepted on egress since the last metric report.
    pub fn egress_bytes(&self) -> u64 {
        self.egress_bytes.load(Ordering::Acquire)
    }

    pub fn egress_packets(&self) -> u64 {
        self.egress_packets.load(Ordering::Acquire)
    }
}

pub(crate) enum CtLookup {
    Exist(Arc<ConnEntry>),
    Created(Arc<ConnEntry>),
    NotFound,
    /// The table is full; the packet cannot be tracked and must be dropped.
    Error,
}

pub(crate) struct ConnTable {
    base: Instant,
    est_timeout: u64,
    tcp_release: u64,
    udp_release: u64,
    report_interval: u64,
    capacity: usize,
    entries: DashMap<ConnKey, Arc<ConnEntry>>,
    timers: Mutex<BTreeMap<u64, Vec<ConnKey>>>,
    events: EventChannels,
}

impl ConnTable {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            base: Instant::now(),
            est_timeout: config.conn_est_timeout.as_nanos() as u64,
            tcp_release: config.tcp_release_timeout.as_nanos() as u64,
            udp_release: config.udp_release_timeout.as_nanos() as u64,
            report_interval: config.report_interval.as_nanos() as u64,
            capacity: config.conntrack_capacity,
            entries: DashMap::new(),
            timers: Mutex::new(BTreeMap::new()),
            events: EventChannels::new(config.conn_event_capacity, config.metric_event_capacity),
        }
    }

    pub(crate) fn events(&self) -> &EventChannels {
        &self.events
    }

    pub(crate) fn now_ns(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.base).as_nanos() as u64
    }

    pub(crate) fn lookup(&self, key: &ConnKey) -> Option<Arc<ConnEntry>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Create-if-absent: losing an insertion race adopts the winner's entry,
    /// so exactly one entry per key exists at all times.
    pub(crate) fn lookup_or_create(
        &self,
        key: ConnKey,
        allow_create: bool,
        remote: SocketAddr,
        flow_id: u32,
        now: u64,
    ) -> CtLookup {
        if let Some(entry) = self.lookup(&key) {
            return CtLookup::Exist(entry);
        }

        if !allow_create {
            return CtLookup::NotFound;
        }

        if self.entries.len() >= self.capacity {
            tracing::error!("failed to insert conntrack entry, table is full");
            return CtLookup::Error;
        }

        let (entry, created) = match self.entries.entry(key) {
            Entry::Occupied(occupied) => (Arc::clone(occupied.get()), false),
            Entry::Vacant(vacant) => {
                let entry = Arc::new(ConnEntry::new(remote, flow_id, now));
                vacant.insert(Arc::clone(&entry));

                (entry, true)
            }
        };

        if !created {
            return CtLookup::Exist(entry);
        }

        self.arm(&key, &entry, now.saturating_add(self.est_timeout));

        self.events.emit_conn(ConnEvent {
            kind: ConnEventKind::Created,
            local: key.local,
            remote,
            protocol: key.protocol,
            flow_id,
            create_time: now,
            report_time: now,
        });

        CtLookup::Created(entry)
    }

    /// Any accepted packet refreshes the entry into `Active` and restarts
    /// its timer. Flag-sensitive transitions (SYN/RST) are a deliberate
    /// extension point; activity is activity.
    pub(crate) fn transition_on_packet(&self, key: &ConnKey, entry: &ConnEntry, now: u64) {
        entry
            .conn_status
            .store(ConnStatus::Active as u8, Ordering::Release);
        self.restart(key, entry, now.saturating_add(self.est_timeout));
    }

    pub(crate) fn record_packet(
        &self,
        key: &ConnKey,
        entry: &ConnEntry,
        ingress: bool,
        bytes: u64,
        now: u64,
    ) {
        metrics::accumulate(entry, ingress, bytes);
        metrics::try_report(key, entry, &self.events, self.report_interval, now);
    }

    pub(crate) fn poll_timeout(&self) -> Option<Instant> {
        let deadline = *self.timers.lock().keys().next()?;

        Some(self.base + Duration::from_nanos(deadline))
    }

    pub(crate) fn handle_timeout(&self, now: Instant) {
        let now = self.now_ns(now);

        let due: Vec<ConnKey> = {
            let mut timers = self.timers.lock();
            let later = timers.split_off(&now.saturating_add(1));

            mem::replace(&mut *timers, later)
                .into_values()
                .flatten()
                .collect()
        };

        for key in due {
            self.timer_fired(key, now);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Unload path: releases every entry and cancels all pending timers.
    pub(crate) fn drain(&self) {
        self.entries.clear();
        self.timers.lock().clear();
    }

    /// The per-entry timer callback. Operates on the key and re-looks the
    /// entry up; it may have been refreshed or deleted concurrently.
    fn timer_fired(&self, key: ConnKey, now: u64) {
        let Some(entry) = self.lookup(&key) else {
            return;
        };

        let deadline = entry.timer_deadline.load(Ordering::Acquire);
        if deadline > now {
            // A packet moved the deadline; fire again then.
            self.schedule(deadline, key);
            return;
        }

        let status = entry.status();

        if status == ConnStatus::Release {
            self.events.emit_conn(ConnEvent {
                kind: ConnEventKind::Deleted,
                local: key.local,
                remote: entry.trigger,
                protocol: key.protocol,
                flow_id: entry.flow_id,
                create_time: entry.create_time,
                report_time: now,
            });
            self.entries.remove(&key);
            return;
        }

        // Either the window is not due or another agent won the reporter
        // race; push the timeout out without aging the entry.
        if metrics::try_report(&key, &entry, &self.events, self.report_interval, now)
            != ReportOutcome::Reported
        {
            self.arm(&key, &entry, now.saturating_add(self.est_timeout));
            return;
        }

        let (next, timeout) = match status {
            ConnStatus::Active => (ConnStatus::Timeout1, self.est_timeout),
            ConnStatus::Timeout1 => (ConnStatus::Timeout2, self.est_timeout),
            ConnStatus::Timeout2 => {
                let release = if key.protocol == IpNumber::TCP.0 {
                    self.tcp_release
                } else {
                    self.udp_release
                };

                (ConnStatus::Release, release)
            }
            // A freshly created entry ages like an active one.
            ConnStatus::Init | ConnStatus::Release => (status, self.est_timeout),
        };

        if entry
            .conn_status
            .compare_exchange(status as u8, next as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // A packet refreshed the entry while we were aging it.
            self.arm(&key, &entry, now.saturating_add(self.est_timeout));
            return;
        }

        self.arm(&key, &entry, now.saturating_add(timeout));
    }

    fn arm(&self, key: &ConnKey, entry: &ConnEntry, deadline: u64) {
        entry.timer_deadline.store(deadline, Ordering::Release);
        self.schedule(deadline, *key);
    }

    /// Packet-path restart: the wheel is only touched when the new deadline
    /// is earlier than the previous one. A later deadline is picked up
    /// lazily when the stale wheel slot fires.
    fn restart(&self, key: &ConnKey, entry: &ConnEntry, deadline: u64) {
        let previous = entry.timer_deadline.swap(deadline, Ordering::AcqRel);

        if deadline < previous {
            self.schedule(deadline, *key);
        }
    }

    fn schedule(&self, deadline: u64, key: ConnKey) {
        self.timers.lock().entry(deadline).or_default().push(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ConnEventKind;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn table() -> ConnTable {
        ConnTable::new(&Config {
            conn_est_timeout: Duration::from_secs(30),
            tcp_release_timeout: Duration::from_secs(120),
            udp_release_timeout: Duration::from_secs(60),
            report_interval: Duration::from_secs(5),
            ..Config::default()
        })
    }

    fn udp_key() -> ConnKey {
        ConnKey {
            protocol: IpNumber::UDP.0,
            local: (Ipv4Addr::new(10, 0, 0, 5), 40000).into(),
        }
    }

    fn remote() -> SocketAddr {
        (Ipv4Addr::new(93, 184, 216, 34), 443).into()
    }

    fn create(table: &ConnTable, key: ConnKey, now: u64) -> Arc<ConnEntry> {
        match table.lookup_or_create(key, true, remote(), 0, now) {
            CtLookup::Created(entry) => {
                table.transition_on_packet(&key, &entry, now);
                entry
            }
            _ => panic!("expected a fresh entry"),
        }
    }

    /// Drives all timers up to (and including) `until`.
    fn advance(table: &ConnTable, until: Instant) {
        while let Some(deadline) = table.poll_timeout() {
            if deadline > until {
                break;
            }

            table.handle_timeout(deadline);
        }
    }

    #[test]
    fn creation_is_idempotent_under_racing_creators() {
        let table = table();

        let first = create(&table, udp_key(), 0);
        let second = match table.lookup_or_create(udp_key(), true, remote(), 0, 1) {
            CtLookup::Exist(entry) => entry,
            _ => panic!("expected the existing entry"),
        };

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn lookup_without_create_finds_nothing() {
        let table = table();

        assert!(matches!(
            table.lookup_or_create(udp_key(), false, remote(), 0, 0),
            CtLookup::NotFound
        ));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn capacity_overflow_is_an_error() {
        let table = ConnTable::new(&Config {
            conntrack_capacity: 1,
            ..Config::default()
        });

        create(&table, udp_key(), 0);

        let other = ConnKey {
            protocol: IpNumber::UDP.0,
            local: (Ipv4Addr::new(10, 0, 0, 5), 40001).into(),
        };

        assert!(matches!(
            table.lookup_or_create(other, true, remote(), 0, 0),
            CtLookup::Error
        ));
    }

    #[test]
    fn idle_entry_escalates_to_release_and_is_deleted() {
        let table = table();
        let entry = create(&table, udp_key(), 0);

        assert_eq!(entry.status(), ConnStatus::Active);

        // Three establish windows age the entry into Release, one release
        // window deletes it.
        advance(&table, table.base + Duration::from_secs(89));
        assert_eq!(entry.status(), ConnStatus::Timeout2);

        advance(&table, table.base + Duration::from_secs(90));
        assert_eq!(entry.status(), ConnStatus::Release);
        assert_eq!(table.len(), 1);

        advance(&table, table.base + Duration::from_secs(3 * 30 + 60));
        assert_eq!(table.len(), 0);

        let deleted = std::iter::from_fn(|| table.events().pop_conn())
            .find(|event| event.kind == ConnEventKind::Deleted)
            .expect("a deletion event");
        assert_eq!(deleted.local, udp_key().local);
        assert_eq!(deleted.report_time, Duration::from_secs(150).as_nanos() as u64);
    }

    #[test]
    fn traffic_keeps_an_entry_active_indefinitely() {
        let table = table();
        let key = udp_key();
        let entry = create(&table, key, 0);

        for step in 1..=20u64 {
            let now = table.base + Duration::from_secs(step * 15);

            advance(&table, now);

            let now = table.now_ns(now);
            table.transition_on_packet(&key, &entry, now);
            table.record_packet(&key, &entry, false, 100, now);
        }

        assert!(table.lookup(&key).is_some());
        assert_eq!(entry.status(), ConnStatus::Active);
    }

    #[test]
    fn tcp_release_stage_uses_the_tcp_timeout() {
        let table = table();
        let key = ConnKey {
            protocol: IpNumber::TCP.0,
            local: (Ipv4Addr::new(10, 0, 0, 5), 40000).into(),
        };
        create(&table, key, 0);

        advance(&table, table.base + Duration::from_secs(90));

        // Release fires only after the longer TCP release window.
        advance(&table, table.base + Duration::from_secs(90 + 119));
        assert_eq!(table.len(), 1);

        advance(&table, table.base + Duration::from_secs(90 + 120));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn creation_emits_a_created_event() {
        let table = table();
        create(&table, udp_key(), 0);

        let event = table.events().pop_conn().expect("a creation event");

        assert_eq!(event.kind, ConnEventKind::Created);
        assert_eq!(event.local, udp_key().local);
        assert_eq!(event.remote, remote());
        assert_eq!(event.create_time, event.report_time);
    }

    #[test]
    fn drain_cancels_all_timers() {
        let table = table();
        create(&table, udp_key(), 0);

        table.drain();

        assert_eq!(table.len(), 0);
        assert_eq!(table.poll_timeout(), None);
    }
}
