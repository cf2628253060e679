//! # Protocol statistics
//!
//! Counters for each component plus the interval throughput meter behind
//! the trace points. Everything serializes to JSON for export.

use std::time::Duration;

use serde::Serialize;

// ─── Worker Stats ───────────────────────────────────────────────────────────

/// Aggregate worker-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    /// Data packets emitted (including every retransmission).
    pub packets_sent: u64,
    /// Payload bytes emitted.
    pub bytes_sent: u64,
    /// ACKs that matched a pending buffer entry.
    pub packets_acked: u64,
    /// Timeout-driven retransmissions.
    pub retransmissions: u64,
    /// Front-entry resends triggered by consecutive out-of-order ACKs.
    pub fast_retransmits: u64,
    /// Timeout events that fired with at least one entry still pending.
    pub timeouts_fired: u64,
    /// ACKs that matched no pending entry.
    pub duplicate_acks: u64,
    /// Total bytes on the wire, header included.
    pub total_tx_bytes: u64,
    /// Total bytes received, header included.
    pub total_rx_bytes: u64,
}

impl WorkerStats {
    /// Retransmission overhead ratio.
    pub fn retransmit_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            (self.retransmissions + self.fast_retransmits) as f64 / self.packets_sent as f64
        }
    }
}

// ─── Aggregator Stats ───────────────────────────────────────────────────────

/// Aggregate switch-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatorStats {
    /// Packets forwarded upstream (first arrivals, collisions, overflows).
    pub forwarded: u64,
    /// Slots whose bitmap filled, emitting an aggregated reply.
    pub completed: u64,
    /// Aggregated replies regenerated for a retransmission into a complete slot.
    pub regenerated: u64,
    /// Duplicate contributions dropped.
    pub duplicates_dropped: u64,
    /// Contributions folded into a slot without completing it.
    pub partials_folded: u64,
    /// Packets bounced with the collision bit.
    pub collisions: u64,
    /// Slots evicted after exhausting the retry budget.
    pub overflows: u64,
    /// Reply copies fanned out to registered workers.
    pub acks_multicast: u64,
    /// Slots freed by a reflected reply.
    pub slots_freed: u64,
    /// Packets referencing a slot index outside the table.
    pub out_of_range_dropped: u64,
}

// ─── Coordinator Stats ──────────────────────────────────────────────────────

/// Aggregate coordinator-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStats {
    /// Every protocol packet that reached the coordinator.
    pub packets_received: u64,
    /// Bytes received, header included.
    pub bytes_received: u64,
    /// Complete packets that advanced the expected-sequence cursor.
    pub delivered_in_order: u64,
    /// Complete packets ahead of the cursor, buffered as markers.
    pub out_of_order: u64,
    /// Packets behind the cursor, re-ACKed without state change.
    pub duplicates: u64,
    /// Partial first-arrival carrier copies absorbed without an ACK.
    pub partials_absorbed: u64,
    /// Delivered packets that bypassed aggregation.
    pub overflow_packets: u64,
    /// Forwarded packets observed with the collision bit set.
    pub collision_packets: u64,
}

// ─── Throughput Meter ───────────────────────────────────────────────────────

/// Byte counter sampled per reporting interval, feeding the throughput
/// trace point. The sink holds no reference back to the component.
#[derive(Debug, Clone, Default)]
pub struct ThroughputMeter {
    bytes: u64,
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account bytes toward the current interval.
    #[inline]
    pub fn add(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
    }

    /// Gigabits per second over `interval`, resetting the counter.
    pub fn sample_gbps(&mut self, interval: Duration) -> f64 {
        let bits = (self.bytes * 8) as f64;
        self.bytes = 0;
        let secs = interval.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            bits / 1e9 / secs
        }
    }
}
