//! # Coordinator Assembler
//!
//! Terminates the aggregated stream. Pure logic — no I/O. Complete packets
//! (full bitmap, or overflow bypass) are sequenced against a per-job
//! expected-sequence cursor and always acknowledged — the switch frees its
//! slot on the reflected reply. Partial first-arrival carrier copies at or
//! ahead of the cursor are absorbed without a reply; anything behind the
//! cursor is a straggler retransmission and gets a duplicate ACK so its
//! sender can retire it.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tracing::trace;

use crate::seq::SeqNum;
use crate::stats::{CoordinatorStats, ThroughputMeter};
use crate::wire::{FragmentHeader, PACKET_SIZE};

// ─── Disposition ────────────────────────────────────────────────────────────

/// How one arriving packet related to the job's cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Complete and exactly at the cursor; the cursor advanced.
    InOrder,
    /// Complete but ahead of the cursor; buffered as a marker.
    Ahead,
    /// Behind the cursor (or an already-buffered marker); re-ACKed only.
    Duplicate,
    /// Partial carrier copy; absorbed without a reply.
    Partial,
}

/// Result of processing one packet from the switch.
#[derive(Debug, Clone)]
pub struct CoordinatorOutput {
    pub disposition: Disposition,
    /// Reply to send back through the switch, when one is owed.
    pub ack: Option<FragmentHeader>,
}

// ─── Per-job state ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct JobCursor {
    next_expected: SeqNum,
    /// Complete sequences received ahead of the cursor.
    ahead: BTreeSet<u16>,
    delivered: u64,
}

impl JobCursor {
    /// Advance past `next_expected` and drain any buffered markers that
    /// became contiguous.
    fn advance(&mut self) {
        self.next_expected = self.next_expected.next();
        self.delivered += 1;
        while self.ahead.remove(&self.next_expected.value()) {
            self.next_expected = self.next_expected.next();
            self.delivered += 1;
        }
    }
}

// ─── Coordinator ────────────────────────────────────────────────────────────

/// The stream-terminating coordinator.
#[derive(Debug, Default)]
pub struct Coordinator {
    jobs: HashMap<u32, JobCursor>,
    stats: CoordinatorStats,
    rx_meter: ThroughputMeter,
    tx_meter: ThroughputMeter,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    /// Sequences delivered in order for a job so far.
    pub fn delivered(&self, job_id: u32) -> u64 {
        self.jobs.get(&job_id).map_or(0, |j| j.delivered)
    }

    /// The sequence the job's cursor is waiting for.
    pub fn next_expected(&self, job_id: u32) -> SeqNum {
        self.jobs
            .get(&job_id)
            .map_or(SeqNum::new(0), |j| j.next_expected)
    }

    /// Process one packet arriving from the switch.
    pub fn on_packet(&mut self, pkt: &FragmentHeader) -> CoordinatorOutput {
        self.stats.packets_received += 1;
        self.stats.bytes_received += PACKET_SIZE as u64;
        self.rx_meter.add(PACKET_SIZE);
        if pkt.collision {
            self.stats.collision_packets += 1;
        }

        let cursor = self.jobs.entry(pkt.job_id).or_default();
        let offset = pkt.seq.distance(cursor.next_expected);
        let complete = pkt.is_complete() || pkt.overflow;

        let disposition = if offset < 0 {
            // Straggler retransmission of an already-delivered sequence.
            self.stats.duplicates += 1;
            Disposition::Duplicate
        } else if !complete {
            self.stats.partials_absorbed += 1;
            return CoordinatorOutput {
                disposition: Disposition::Partial,
                ack: None,
            };
        } else if offset == 0 {
            cursor.advance();
            self.stats.delivered_in_order += 1;
            if pkt.overflow {
                self.stats.overflow_packets += 1;
            }
            trace!(job = pkt.job_id, seq = pkt.seq.value(), "delivered in order");
            Disposition::InOrder
        } else if cursor.ahead.insert(pkt.seq.value()) {
            self.stats.out_of_order += 1;
            if pkt.overflow {
                self.stats.overflow_packets += 1;
            }
            Disposition::Ahead
        } else {
            self.stats.duplicates += 1;
            Disposition::Duplicate
        };

        let ack = (*pkt).into_ack(pkt.bitmap, pkt.seq);
        self.tx_meter.add(PACKET_SIZE);
        CoordinatorOutput {
            disposition,
            ack: Some(ack),
        }
    }

    /// Gigabits per second (tx, rx) over the reporting interval.
    pub fn throughput_sample(&mut self, interval: Duration) -> (f64, f64) {
        (
            self.tx_meter.sample_gbps(interval),
            self.rx_meter.sample_gbps(interval),
        )
    }
}
