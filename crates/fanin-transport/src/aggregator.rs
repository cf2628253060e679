//! # Aggregator Engine
//!
//! Switch-resident slot table. Pure logic — no I/O. Every data packet
//! traversing the switch is judged against the slot its header selects:
//! first arrivals occupy and travel upstream as the carrier copy,
//! follow-up contributions fold into the bitmap, the completing
//! contribution is rewritten into the aggregated reply, and epoch
//! conflicts bounce with the collision bit until the slot's retry budget
//! runs out and it is evicted with the overflow bit.
//!
//! The engine keeps no state between packets except the slot table and
//! the registered worker addresses; packets addressing the same slot are
//! serialized by the single-threaded switch loop.

use bytes::Bytes;
use tracing::{debug, trace};

use crate::seq::SeqNum;
use crate::stats::AggregatorStats;
use crate::wire::{FragmentHeader, MAX_SLOT_COUNT};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Aggregator configuration parameters.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Number of physical slots in the table.
    pub capacity: usize,
    /// Collision bounces a stuck slot absorbs before eviction.
    pub max_slot_retries: u8,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            capacity: MAX_SLOT_COUNT,
            max_slot_retries: 5,
        }
    }
}

// ─── Address ────────────────────────────────────────────────────────────────

/// Opaque worker address — produced and consumed only by the substrate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(Bytes);

impl Address {
    pub fn new(bytes: Bytes) -> Self {
        Address(bytes)
    }

    pub fn from_static(bytes: &'static [u8]) -> Self {
        Address(Bytes::from_static(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// ─── Slot ───────────────────────────────────────────────────────────────────

/// One aggregation slot: participation state for a single `(job, seq)` epoch.
#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    occupied: bool,
    /// All contributions accounted; awaiting the reflected reply to free.
    complete: bool,
    bitmap: u32,
    seq: SeqNum,
    job_id: u32,
    fan_in: u8,
    retries: u8,
}

impl Slot {
    fn occupy(&mut self, pkt: &FragmentHeader) {
        self.occupied = true;
        self.bitmap = pkt.bitmap;
        self.seq = pkt.seq;
        self.job_id = pkt.job_id;
        self.fan_in = pkt.fan_in;
        self.retries = 0;
        self.complete = pkt.is_complete();
    }

    fn free(&mut self) {
        *self = Slot::default();
    }

    fn same_epoch(&self, pkt: &FragmentHeader) -> bool {
        self.job_id == pkt.job_id && self.seq == pkt.seq
    }
}

// ─── Verdicts ───────────────────────────────────────────────────────────────

/// Why a data packet was swallowed at the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The slot already accounts this worker for this epoch.
    DuplicateContribution,
    /// Folded into the slot; the epoch is still accumulating.
    PartialAccumulation,
    /// The header's slot index is outside the table.
    SlotOutOfRange,
}

/// Outcome of judging one data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchVerdict {
    /// Forward the (possibly rewritten) packet upstream to the coordinator.
    Forward(FragmentHeader),
    /// Swallow the packet.
    Drop(DropReason),
}

/// Outcome of reflecting a coordinator reply back toward the workers.
#[derive(Debug, Clone)]
pub struct ReflectOutcome {
    /// One reply copy per registered worker, ECN preserved.
    pub deliveries: Vec<(Address, FragmentHeader)>,
    /// Slot index freed by this reply, if its epoch matched.
    pub freed_slot: Option<u16>,
}

// ─── Aggregator ─────────────────────────────────────────────────────────────

/// The switch-resident aggregation engine.
pub struct Aggregator {
    config: AggregatorConfig,
    table: Vec<Slot>,
    workers: Vec<Address>,
    stats: AggregatorStats,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let table = vec![Slot::default(); config.capacity];
        Aggregator {
            config,
            table,
            workers: Vec::new(),
            stats: AggregatorStats::default(),
        }
    }

    /// Register a worker address for reply fan-out.
    pub fn add_worker(&mut self, addr: Address) {
        self.workers.push(addr);
    }

    /// Registered participant set.
    pub fn workers(&self) -> &[Address] {
        &self.workers
    }

    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    /// Number of currently occupied slots.
    pub fn occupied_slots(&self) -> usize {
        self.table.iter().filter(|s| s.occupied).count()
    }

    /// Judge a data packet against the slot its header selects.
    pub fn on_data(&mut self, mut pkt: FragmentHeader) -> SwitchVerdict {
        let Some(slot) = self.table.get_mut(usize::from(pkt.slot)) else {
            self.stats.out_of_range_dropped += 1;
            return SwitchVerdict::Drop(DropReason::SlotOutOfRange);
        };

        if !slot.occupied {
            slot.occupy(&pkt);
            self.stats.forwarded += 1;
            if slot.complete {
                self.stats.completed += 1;
            }
            trace!(slot = pkt.slot, seq = pkt.seq.value(), "first arrival");
            return SwitchVerdict::Forward(pkt);
        }

        if slot.same_epoch(&pkt) {
            if slot.bitmap & pkt.bitmap != 0 {
                // Contribution already accounted. A retransmission into a
                // complete slot means the aggregated reply was lost:
                // regenerate it.
                if slot.complete && pkt.resend {
                    let ack = pkt.into_ack(slot.bitmap, slot.seq);
                    self.stats.regenerated += 1;
                    debug!(slot = ack.slot, seq = ack.seq.value(), "reply regenerated");
                    return SwitchVerdict::Forward(ack);
                }
                self.stats.duplicates_dropped += 1;
                return SwitchVerdict::Drop(DropReason::DuplicateContribution);
            }

            slot.bitmap |= pkt.bitmap;
            if slot.bitmap.count_ones() == u32::from(slot.fan_in) {
                slot.complete = true;
                let ack = pkt.into_ack(slot.bitmap, slot.seq);
                self.stats.completed += 1;
                trace!(slot = ack.slot, seq = ack.seq.value(), "epoch complete");
                return SwitchVerdict::Forward(ack);
            }
            self.stats.partials_folded += 1;
            return SwitchVerdict::Drop(DropReason::PartialAccumulation);
        }

        // Different epoch owns the slot.
        if slot.retries < self.config.max_slot_retries {
            slot.retries += 1;
            pkt.collision = true;
            self.stats.collisions += 1;
            return SwitchVerdict::Forward(pkt);
        }

        slot.free();
        pkt.overflow = true;
        self.stats.overflows += 1;
        debug!(slot = pkt.slot, seq = pkt.seq.value(), "slot evicted, aggregation bypassed");
        SwitchVerdict::Forward(pkt)
    }

    /// Reflect a coordinator reply back toward the workers.
    ///
    /// The fan-out always happens — a worker that missed an earlier copy
    /// recovers through retransmission and re-reflection. The slot is
    /// freed only when the reply matches its occupied epoch.
    pub fn on_reflected_ack(&mut self, pkt: FragmentHeader) -> ReflectOutcome {
        let freed_slot = match self.table.get_mut(usize::from(pkt.slot)) {
            Some(slot) if slot.occupied && slot.same_epoch(&pkt) => {
                slot.free();
                self.stats.slots_freed += 1;
                Some(pkt.slot)
            }
            _ => None,
        };

        let deliveries: Vec<(Address, FragmentHeader)> = self
            .workers
            .iter()
            .map(|addr| (addr.clone(), pkt))
            .collect();
        self.stats.acks_multicast += deliveries.len() as u64;

        ReflectOutcome {
            deliveries,
            freed_slot,
        }
    }
}
