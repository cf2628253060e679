//! # Worker Transport State Machine
//!
//! Pure logic — no I/O. Produces the fragment stream, assigns sequence
//! numbers, selects aggregator slots through the per-application slot map,
//! and drives the sliding window: retirement on in-order ACKs, fast
//! retransmit on consecutive out-of-order ACKs, range timeouts, and
//! ECN-driven AIMD growth.
//!
//! ## Responsibilities
//!
//! 1. **Packetisation**: one header per fragment, `bitmap = 1 << worker_id`
//! 2. **Slot selection**: initial burst walks the slot map by index,
//!    steady state uses `slot_of[seq mod used_slots]`
//! 3. **Window management**: retire an ACKed contiguous prefix, track the
//!    window shift so timeout ranges survive retirement
//! 4. **Retransmission**: front-entry fast retransmit, timeout sweeps over
//!    captured ranges, per-packet retry budget
//! 5. **Congestion feedback**: feed the echoed ECN bit to AIMD, publish
//!    the window trace
//!
//! The worker does NOT manage sockets or timers — each handler returns the
//! events the substrate must act on.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::congestion::{AimdConfig, AimdController};
use crate::error::FaninError;
use crate::seq::{SeqGen, SeqNum};
use crate::slotmap::SlotMap;
use crate::stats::{ThroughputMeter, WorkerStats};
use crate::wire::{FragmentHeader, FRAGMENT_PAYLOAD, MAX_FAN_IN, MAX_SLOT_COUNT, PACKET_SIZE};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Worker configuration parameters.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Payload bytes to deliver; fragments = ⌈total_size / payload⌉.
    pub total_size: u64,
    /// Logical aggregator slots this application cycles through.
    pub used_slots: usize,
    /// Physical slot table capacity at the switch.
    pub capacity: usize,
    /// Initial burst size and AIMD starting window, in packets.
    pub initial_window: u32,
    /// Retransmission timeout for a captured range.
    pub timeout: Duration,
    /// Consecutive out-of-order ACKs that trigger a front resend.
    pub fast_retx_threshold: u16,
    /// Per-packet retry budget; an exhausted packet is abandoned.
    pub max_retransmissions: u8,
    /// Application identity fed to the slot hash.
    pub app_id: u16,
    /// Job identity carried on the wire.
    pub job_id: u32,
    /// This worker's bit index in the participation bitmap.
    pub worker_id: u8,
    /// Expected number of contributors per aggregated packet.
    pub fan_in: u8,
    /// Congestion control parameters.
    pub aimd: AimdConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            total_size: 1024 * 1024,
            used_slots: 1200,
            capacity: MAX_SLOT_COUNT,
            initial_window: 64,
            timeout: Duration::from_micros(100),
            fast_retx_threshold: 3,
            max_retransmissions: 10,
            app_id: 0,
            job_id: 0,
            worker_id: 0,
            fan_in: 2,
            aimd: AimdConfig::default(),
        }
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// A timeout covering buffer positions `[pos_start, pos_end]` captured at
/// `window_shift`. Retirement moves entries toward the front; the capture
/// lets the handler translate back and skip entries that already left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutToken {
    pub pos_start: u64,
    pub pos_end: u64,
    pub window_shift: u64,
}

/// What the substrate must do after a handler ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Put this header (plus the opaque payload) on the wire.
    Send(FragmentHeader),
    /// Schedule `on_timeout(token)` after `delay`.
    ArmTimeout { token: TimeoutToken, delay: Duration },
    /// Window trace point: the window changed on an ACK.
    WindowTrace { window: u32, ecn: bool },
    /// Every fragment is acknowledged; the stream is done.
    Finished,
}

/// How an ACK related to the TxRx buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    /// Matched the head; `retired` entries left the buffer.
    InOrder { retired: usize },
    /// Matched an interior pending entry.
    OutOfOrder,
    /// Matched nothing still pending.
    Duplicate,
}

// ─── TxRx buffer entry ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct TxRecord {
    header: FragmentHeader,
    retransmissions: u8,
    acked: bool,
}

// ─── Worker ─────────────────────────────────────────────────────────────────

/// Worker transport state machine.
pub struct Worker {
    config: WorkerConfig,
    slot_map: SlotMap,
    seq_gen: SeqGen,
    aimd: AimdController,
    buffer: VecDeque<TxRecord>,
    /// Entries retired from the head since startup (monotonic).
    window_shift: u64,
    /// Consecutive out-of-order ACKs since the last in-order retirement.
    consecutive_ood: u16,
    total_fragments: u64,
    /// Fragments not yet handed a sequence number.
    pending: u64,
    finished: bool,
    stats: WorkerStats,
    tx_meter: ThroughputMeter,
    rx_meter: ThroughputMeter,
}

impl Worker {
    /// Build the worker: validates identity, constructs the slot map once.
    pub fn new(config: WorkerConfig) -> Result<Self, FaninError> {
        if config.worker_id >= MAX_FAN_IN {
            return Err(FaninError::WorkerIdOutOfRange(config.worker_id));
        }
        if config.fan_in == 0 || config.fan_in > MAX_FAN_IN {
            return Err(FaninError::FanInOutOfRange(config.fan_in));
        }
        let slot_map = SlotMap::build(config.app_id, config.used_slots, config.capacity)?;
        let total_fragments = config.total_size.div_ceil(FRAGMENT_PAYLOAD as u64);
        let aimd = AimdController::new(config.initial_window, config.aimd.clone());

        Ok(Worker {
            config,
            slot_map,
            seq_gen: SeqGen::new(),
            aimd,
            buffer: VecDeque::new(),
            window_shift: 0,
            consecutive_ood: 0,
            total_fragments,
            pending: total_fragments,
            finished: false,
            stats: WorkerStats::default(),
            tx_meter: ThroughputMeter::new(),
            rx_meter: ThroughputMeter::new(),
        })
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Entries retired from the buffer head so far.
    pub fn window_shift(&self) -> u64 {
        self.window_shift
    }

    /// Fragments awaiting a sequence number.
    pub fn pending(&self) -> u64 {
        self.pending
    }

    /// Buffered entries not yet acknowledged.
    pub fn inflight(&self) -> usize {
        self.buffer.iter().filter(|r| !r.acked).count()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    // ─── Startup ────────────────────────────────────────────────────────

    /// Emit the initial burst and arm a timeout covering it.
    pub fn start(&mut self) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        let burst = self.total_fragments.min(u64::from(self.config.initial_window));
        self.pending = self.total_fragments - burst;
        self.consecutive_ood = 0;

        info!(
            worker = self.config.worker_id,
            total = self.total_fragments,
            burst,
            "stream start"
        );
        events.push(WorkerEvent::WindowTrace {
            window: self.config.initial_window,
            ecn: false,
        });

        for i in 0..burst {
            let seq = self.seq_gen.next();
            let slot = self.slot_map.slot_for_index(i as usize);
            events.push(self.emit_fresh(slot, seq));
        }

        if burst > 0 {
            events.push(WorkerEvent::ArmTimeout {
                token: TimeoutToken {
                    pos_start: 0,
                    pos_end: burst - 1,
                    window_shift: self.window_shift,
                },
                delay: self.config.timeout,
            });
        } else {
            self.finished = true;
            events.push(WorkerEvent::Finished);
        }
        events
    }

    // ─── Receive path ───────────────────────────────────────────────────

    /// Process one packet from the substrate's receive callback.
    pub fn on_ack(&mut self, pkt: &FragmentHeader) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        if !pkt.ack {
            debug!(seq = pkt.seq.value(), "non-reply packet ignored");
            return events;
        }
        if pkt.job_id != self.config.job_id {
            trace!(job = pkt.job_id, "reply for another job ignored");
            return events;
        }

        self.stats.total_rx_bytes += PACKET_SIZE as u64;
        self.rx_meter.add(FRAGMENT_PAYLOAD);

        match self.recv_ack(pkt.seq) {
            AckDisposition::Duplicate => {
                self.stats.duplicate_acks += 1;
                return events;
            }
            AckDisposition::InOrder { retired } => {
                self.stats.packets_acked += 1;
                trace!(seq = pkt.seq.value(), retired, "in-order ack");
            }
            AckDisposition::OutOfOrder => {
                self.stats.packets_acked += 1;
                trace!(
                    seq = pkt.seq.value(),
                    count = self.consecutive_ood,
                    "out-of-order ack"
                );
            }
        }

        // Fast retransmit: the head is presumed lost once enough ACKs land
        // past it. At most one resend per triggering ACK.
        if self.consecutive_ood >= self.config.fast_retx_threshold {
            if let Some(front) = self.buffer.front_mut() {
                if front.retransmissions < self.config.max_retransmissions {
                    front.retransmissions += 1;
                    let mut header = front.header;
                    header.resend = true;
                    self.consecutive_ood = 0;
                    self.stats.fast_retransmits += 1;
                    self.account_tx();
                    debug!(seq = header.seq.value(), "fast retransmit");
                    events.push(WorkerEvent::Send(header));
                }
            }
        }

        if self.pending == 0 {
            if self.buffer.is_empty() {
                self.finished = true;
                info!(
                    worker = self.config.worker_id,
                    total_tx = self.stats.total_tx_bytes,
                    total_rx = self.stats.total_rx_bytes,
                    "stream complete"
                );
                events.push(WorkerEvent::Finished);
            }
            return events;
        }

        let window = self.aimd.on_ack(pkt.ecn);
        events.push(WorkerEvent::WindowTrace {
            window,
            ecn: pkt.ecn,
        });

        let available = i64::from(window) - self.inflight() as i64;
        if available <= 0 {
            return events;
        }

        let sending = self.pending.min(available as u64);
        self.pending -= sending;
        let pos_start = self.buffer.len() as u64;
        for _ in 0..sending {
            let seq = self.seq_gen.next();
            let slot = self.slot_map.slot_for_seq(seq);
            events.push(self.emit_fresh(slot, seq));
        }
        events.push(WorkerEvent::ArmTimeout {
            token: TimeoutToken {
                pos_start,
                pos_end: pos_start + sending - 1,
                window_shift: self.window_shift,
            },
            delay: self.config.timeout,
        });
        events
    }

    // ─── Timeout path ───────────────────────────────────────────────────

    /// Sweep a captured range: resend what is still pending, skip what
    /// retired, and rearm only if something was resent. A fully-retired
    /// range sends nothing and dies quietly.
    pub fn on_timeout(&mut self, token: TimeoutToken) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        let max_retx = self.config.max_retransmissions;
        let mut resent = 0u64;
        for pos in token.pos_start..=token.pos_end {
            let absolute = token.window_shift + pos;
            if absolute < self.window_shift {
                continue; // retired from the head
            }
            let idx = (absolute - self.window_shift) as usize;
            if idx >= self.buffer.len() {
                break;
            }
            let rec = &mut self.buffer[idx];
            if rec.acked {
                continue;
            }
            if rec.retransmissions >= max_retx {
                continue; // retry budget spent — abandoned
            }
            rec.retransmissions += 1;
            let mut header = rec.header;
            header.resend = true;
            self.stats.retransmissions += 1;
            self.account_tx();
            trace!(seq = header.seq.value(), "timeout retransmit");
            events.push(WorkerEvent::Send(header));
            resent += 1;
        }

        if resent > 0 {
            self.stats.timeouts_fired += 1;
            events.push(WorkerEvent::ArmTimeout {
                token,
                delay: self.config.timeout,
            });
        }
        events
    }

    // ─── Trace points ───────────────────────────────────────────────────

    /// Gigabits per second (tx, rx) over the reporting interval.
    pub fn throughput_sample(&mut self, interval: Duration) -> (f64, f64) {
        (
            self.tx_meter.sample_gbps(interval),
            self.rx_meter.sample_gbps(interval),
        )
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn recv_ack(&mut self, seq: SeqNum) -> AckDisposition {
        let Some(front) = self.buffer.front() else {
            return AckDisposition::Duplicate;
        };
        let offset = seq.distance(front.header.seq);
        if offset < 0 || offset as usize >= self.buffer.len() {
            return AckDisposition::Duplicate;
        }
        let idx = offset as usize;
        debug_assert_eq!(
            self.buffer[idx].header.seq,
            seq,
            "TxRx buffer must stay sequence-contiguous"
        );

        if idx == 0 {
            debug_assert!(!self.buffer[0].acked, "head must be pending");
            self.buffer[0].acked = true;
            let mut retired = 0;
            while self.buffer.front().is_some_and(|r| r.acked) {
                self.buffer.pop_front();
                self.window_shift += 1;
                retired += 1;
            }
            self.consecutive_ood = 0;
            AckDisposition::InOrder { retired }
        } else if !self.buffer[idx].acked {
            self.buffer[idx].acked = true;
            self.consecutive_ood = self.consecutive_ood.saturating_add(1);
            AckDisposition::OutOfOrder
        } else {
            AckDisposition::Duplicate
        }
    }

    fn emit_fresh(&mut self, slot: u16, seq: SeqNum) -> WorkerEvent {
        let header = FragmentHeader::data(
            self.config.worker_id,
            self.config.fan_in,
            slot,
            self.config.job_id,
            seq,
        );
        self.buffer.push_back(TxRecord {
            header,
            retransmissions: 0,
            acked: false,
        });
        self.account_tx();
        WorkerEvent::Send(header)
    }

    fn account_tx(&mut self) {
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += FRAGMENT_PAYLOAD as u64;
        self.stats.total_tx_bytes += PACKET_SIZE as u64;
        self.tx_meter.add(FRAGMENT_PAYLOAD);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(fragments: u64, window: u32) -> WorkerConfig {
        WorkerConfig {
            total_size: fragments * FRAGMENT_PAYLOAD as u64,
            used_slots: 16,
            capacity: 64,
            initial_window: window,
            fast_retx_threshold: 3,
            max_retransmissions: 4,
            fan_in: 2,
            ..WorkerConfig::default()
        }
    }

    fn sends(events: &[WorkerEvent]) -> Vec<FragmentHeader> {
        events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Send(h) => Some(*h),
                _ => None,
            })
            .collect()
    }

    fn ack(worker: &Worker, seq: u16) -> FragmentHeader {
        let mut h = FragmentHeader::data(0, 2, 0, worker.config().job_id, SeqNum::new(seq));
        h.bitmap = 0b11;
        h.ack = true;
        h
    }

    #[test]
    fn start_emits_initial_burst_with_timeout() {
        let mut w = Worker::new(config(10, 4)).unwrap();
        let events = w.start();
        let out = sends(&events);
        assert_eq!(out.len(), 4);
        assert_eq!(w.pending(), 6);
        assert!(events.iter().any(|e| matches!(
            e,
            WorkerEvent::ArmTimeout {
                token: TimeoutToken {
                    pos_start: 0,
                    pos_end: 3,
                    window_shift: 0
                },
                ..
            }
        )));
        // Sequence numbers are assigned monotonically from zero.
        for (i, h) in out.iter().enumerate() {
            assert_eq!(h.seq.value(), i as u16);
            assert!(!h.resend);
            assert_eq!(h.bitmap, 1);
        }
    }

    #[test]
    fn burst_walks_the_slot_map_by_index() {
        let mut w = Worker::new(config(4, 4)).unwrap();
        let map = SlotMap::build(0, 16, 64).unwrap();
        let out = sends(&w.start());
        for (i, h) in out.iter().enumerate() {
            assert_eq!(h.slot, map.slot_for_index(i));
        }
    }

    #[test]
    fn in_order_ack_retires_head_and_sends_more() {
        let mut w = Worker::new(config(10, 4)).unwrap();
        w.start();
        let events = w.on_ack(&ack(&w, 0));
        assert_eq!(w.window_shift(), 1);
        assert_eq!(w.inflight(), 4, "window refills after retirement");
        assert!(!sends(&events).is_empty());
    }

    #[test]
    fn out_of_order_ack_leaves_the_head() {
        let mut w = Worker::new(config(10, 4)).unwrap();
        w.start();
        w.on_ack(&ack(&w, 2));
        assert_eq!(w.window_shift(), 0);
        assert!(w.inflight() < w.buffered());
    }

    #[test]
    fn retirement_skips_through_acked_interior() {
        let mut w = Worker::new(config(4, 4)).unwrap();
        w.start();
        w.on_ack(&ack(&w, 1));
        w.on_ack(&ack(&w, 2));
        assert_eq!(w.window_shift(), 0);
        w.on_ack(&ack(&w, 0));
        // 0 retires, then the acked 1 and 2 drain with it.
        assert_eq!(w.window_shift(), 3);
    }

    #[test]
    fn duplicate_ack_changes_nothing() {
        let mut w = Worker::new(config(10, 4)).unwrap();
        w.start();
        w.on_ack(&ack(&w, 0));
        let before = w.stats().packets_sent;
        let events = w.on_ack(&ack(&w, 0));
        assert!(events.is_empty());
        assert_eq!(w.stats().packets_sent, before);
        assert_eq!(w.stats().duplicate_acks, 1);
    }

    #[test]
    fn three_out_of_order_acks_trigger_one_front_resend() {
        let mut w = Worker::new(config(4, 4)).unwrap();
        w.start();
        assert!(sends(&w.on_ack(&ack(&w, 1))).is_empty());
        assert!(sends(&w.on_ack(&ack(&w, 2))).is_empty());
        let events = w.on_ack(&ack(&w, 3));
        let out = sends(&events);
        assert_eq!(out.len(), 1, "exactly one resend per triggering ack");
        assert_eq!(out[0].seq.value(), 0);
        assert!(out[0].resend);
        assert_eq!(w.stats().fast_retransmits, 1);
    }

    #[test]
    fn fast_retransmit_respects_retry_budget() {
        let mut cfg = config(4, 4);
        cfg.max_retransmissions = 0;
        let mut w = Worker::new(cfg).unwrap();
        w.start();
        w.on_ack(&ack(&w, 1));
        w.on_ack(&ack(&w, 2));
        let events = w.on_ack(&ack(&w, 3));
        assert!(sends(&events).is_empty());
        assert_eq!(w.stats().fast_retransmits, 0);
    }

    #[test]
    fn timeout_resends_pending_entries_and_rearms() {
        let mut w = Worker::new(config(4, 4)).unwrap();
        let start = w.start();
        let token = start
            .iter()
            .find_map(|e| match e {
                WorkerEvent::ArmTimeout { token, .. } => Some(*token),
                _ => None,
            })
            .unwrap();

        w.on_ack(&ack(&w, 1));
        let events = w.on_timeout(token);
        let out = sends(&events);
        assert_eq!(out.len(), 3, "the acked interior entry is skipped");
        assert!(out.iter().all(|h| h.resend));
        assert!(events
            .iter()
            .any(|e| matches!(e, WorkerEvent::ArmTimeout { .. })));
    }

    #[test]
    fn timeout_translates_positions_across_retirement() {
        let mut w = Worker::new(config(4, 4)).unwrap();
        let start = w.start();
        let token = start
            .iter()
            .find_map(|e| match e {
                WorkerEvent::ArmTimeout { token, .. } => Some(*token),
                _ => None,
            })
            .unwrap();

        // Retire the first two entries, shifting the buffer.
        w.on_ack(&ack(&w, 0));
        w.on_ack(&ack(&w, 1));
        assert_eq!(w.window_shift(), 2);

        let out = sends(&w.on_timeout(token));
        let seqs: Vec<u16> = out.iter().map(|h| h.seq.value()).collect();
        assert_eq!(seqs, vec![2, 3], "only still-buffered entries resend");
    }

    #[test]
    fn timeout_over_fully_acked_range_is_inert() {
        let mut w = Worker::new(config(4, 4)).unwrap();
        let start = w.start();
        let token = start
            .iter()
            .find_map(|e| match e {
                WorkerEvent::ArmTimeout { token, .. } => Some(*token),
                _ => None,
            })
            .unwrap();

        for seq in 0..4 {
            w.on_ack(&ack(&w, seq));
        }
        assert!(w.is_finished());
        assert!(w.on_timeout(token).is_empty());
    }

    #[test]
    fn stream_finishes_when_all_acked() {
        let mut w = Worker::new(config(6, 4)).unwrap();
        w.start();
        let mut next = 0u16;
        let mut finished = false;
        while !finished && next < 100 {
            let events = w.on_ack(&ack(&w, next));
            finished = events.iter().any(|e| matches!(e, WorkerEvent::Finished));
            next += 1;
        }
        assert!(w.is_finished());
        assert_eq!(w.pending(), 0);
        assert_eq!(w.buffered(), 0);
        assert_eq!(next, 6);
    }

    #[test]
    fn replies_for_other_jobs_are_ignored() {
        let mut w = Worker::new(config(4, 4)).unwrap();
        w.start();
        let mut other = ack(&w, 0);
        other.job_id = 99;
        assert!(w.on_ack(&other).is_empty());
        assert_eq!(w.window_shift(), 0);
    }

    #[test]
    fn ecn_shrinks_the_window_in_the_trace() {
        let mut w = Worker::new(config(40, 16)).unwrap();
        w.start();
        let mut marked = ack(&w, 0);
        marked.ecn = true;
        let events = w.on_ack(&marked);
        let trace = events
            .iter()
            .find_map(|e| match e {
                WorkerEvent::WindowTrace { window, ecn } => Some((*window, *ecn)),
                _ => None,
            })
            .unwrap();
        assert_eq!(trace, (8, true));
    }

    #[test]
    fn inflight_never_exceeds_window() {
        let mut w = Worker::new(config(200, 8)).unwrap();
        w.start();
        for seq in 0..100u16 {
            let events = w.on_ack(&ack(&w, seq));
            let window = events.iter().find_map(|e| match e {
                WorkerEvent::WindowTrace { window, .. } => Some(*window),
                _ => None,
            });
            if let Some(win) = window {
                assert!(w.inflight() as u32 <= win);
            }
            if w.is_finished() {
                break;
            }
        }
    }

    #[test]
    fn zero_byte_stream_finishes_immediately() {
        let mut cfg = config(0, 4);
        cfg.total_size = 0;
        let mut w = Worker::new(cfg).unwrap();
        let events = w.start();
        assert!(events.iter().any(|e| matches!(e, WorkerEvent::Finished)));
        assert!(w.is_finished());
    }

    #[test]
    fn invalid_identity_is_rejected() {
        let mut cfg = config(4, 4);
        cfg.worker_id = 32;
        assert!(matches!(
            Worker::new(cfg),
            Err(FaninError::WorkerIdOutOfRange(32))
        ));

        let mut cfg = config(4, 4);
        cfg.fan_in = 0;
        assert!(matches!(Worker::new(cfg), Err(FaninError::FanInOutOfRange(0))));
    }
}
