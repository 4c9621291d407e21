//! Per-connection counter accumulation and upload.
//!
//! Counters are plain atomics bumped from every accepting packet path.
//! Uploading snapshots them onto the metric ring and subtracts the snapshot,
//! so the live counters only ever hold the unreported delta. A CAS on
//! `last_upload_ts` elects exactly one reporter per window.

use crate::conntrack::{ConnEntry, ConnKey};
use crate::events::{ConnMetricEvent, EventChannels};
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReportOutcome {
    /// The reporting window has not elapsed yet.
    NotDue,
    /// Another agent won the reporter race for this window.
    Conflict,
    Reported,
}

pub(crate) fn accumulate(entry: &ConnEntry, ingress: bool, bytes: u64) {
    if ingress {
        entry.ingress_bytes.fetch_add(bytes, Ordering::AcqRel);
        entry.ingress_packets.fetch_add(1, Ordering::AcqRel);
    } else {
        entry.egress_bytes.fetch_add(bytes, Ordering::AcqRel);
        entry.egress_packets.fetch_add(1, Ordering::AcqRel);
    }
}

pub(crate) fn try_report(
    key: &ConnKey,
    entry: &ConnEntry,
    events: &EventChannels,
    report_interval: u64,
    now: u64,
) -> ReportOutcome {
    let last = entry.last_upload_ts.load(Ordering::SeqCst);

    if now.saturating_sub(last) <= report_interval {
        return ReportOutcome::NotDue;
    }

    if entry
        .last_upload_ts
        .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return ReportOutcome::Conflict;
    }

    // We are the sole reporter for this window.
    let ingress_bytes = entry.ingress_bytes.load(Ordering::Acquire);
    let ingress_packets = entry.ingress_packets.load(Ordering::Acquire);
    let egress_bytes = entry.egress_bytes.load(Ordering::Acquire);
    let egress_packets = entry.egress_packets.load(Ordering::Acquire);

    events.emit_metric(ConnMetricEvent {
        local: key.local,
        remote: entry.trigger,
        protocol: key.protocol,
        flow_id: entry.flow_id,
        time: now,
        create_time: entry.create_time,
        ingress_bytes,
        ingress_packets,
        egress_bytes,
        egress_packets,
    });

    // Keep only what accumulated since the snapshot.
    entry.ingress_bytes.fetch_sub(ingress_bytes, Ordering::AcqRel);
    entry.ingress_packets.fetch_sub(ingress_packets, Ordering::AcqRel);
    entry.egress_bytes.fetch_sub(egress_bytes, Ordering::AcqRel);
    entry.egress_packets.fetch_sub(egress_packets, Ordering::AcqRel);

    ReportOutcome::Reported
}
