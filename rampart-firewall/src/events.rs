use crossbeam_queue::ArrayQueue;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEventKind {
    Created,
    Deleted,
}

/// Lifecycle event of a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnEvent {
    pub kind: ConnEventKind,
    /// The host's own endpoint, i.e. the conntrack key.
    pub local: SocketAddr,
    /// The remote endpoint that triggered the entry.
    pub remote: SocketAddr,
    pub protocol: u8,
    pub flow_id: u32,
    /// Monotonic nanoseconds, relative to engine start.
    pub create_time: u64,
    pub report_time: u64,
}

/// Periodic byte/packet counter snapshot of a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnMetricEvent {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub protocol: u8,
    pub flow_id: u32,
    pub time: u64,
    pub create_time: u64,
    pub ingress_bytes: u64,
    pub ingress_packets: u64,
    pub egress_bytes: u64,
    pub egress_packets: u64,
}

/// Bounded, lock-free channels towards the control plane.
///
/// Emission is best-effort: a full ring drops the event, never the packet.
pub(crate) struct EventChannels {
    conn: ArrayQueue<ConnEvent>,
    metric: ArrayQueue<ConnMetricEvent>,
}

impl EventChannels {
    pub(crate) fn new(conn_capacity: usize, metric_capacity: usize) -> Self {
        Self {
            conn: ArrayQueue::new(conn_capacity),
            metric: ArrayQueue::new(metric_capacity),
        }
    }

    pub(crate) fn emit_conn(&self, event: ConnEvent) {
        if self.conn.push(event).is_err() {
            tracing::trace!("conn event ring is full, dropping event");
        }
    }

    pub(crate) fn emit_metric(&self, event: ConnMetricEvent) {
        if self.metric.push(event).is_err() {
            tracing::trace!("metric event ring is full, dropping event");
        }
    }

    pub(crate) fn pop_conn(&self) -> Option<ConnEvent> {
        self.conn.pop()
    }

    pub(crate) fn pop_metric(&self) -> Option<ConnMetricEvent> {
        self.metric.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn overflowing_ring_drops_events() {
        let channels = EventChannels::new(2, 2);
        let event = ConnEvent {
            kind: ConnEventKind::Created,
            local: (Ipv4Addr::LOCALHOST, 1).into(),
            remote: (Ipv4Addr::LOCALHOST, 2).into(),
            protocol: 17,
            flow_id: 0,
            create_time: 0,
            report_time: 0,
        };

        for _ in 0..5 {
            channels.emit_conn(event);
        }

        assert!(channels.pop_conn().is_some());
        assert!(channels.pop_conn().is_some());
        assert!(channels.pop_conn().is_none());
    }
}
