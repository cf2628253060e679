//! Property-based tests over the protocol state machines: sequence
//! monotonicity, window bounds, single-count aggregation, and timeout
//! idempotence under arbitrary ACK interleavings.

use proptest::prelude::*;

use fanin_transport::aggregator::{Aggregator, AggregatorConfig, SwitchVerdict};
use fanin_transport::seq::SeqNum;
use fanin_transport::wire::{FragmentHeader, FRAGMENT_PAYLOAD};
use fanin_transport::worker::{TimeoutToken, Worker, WorkerConfig, WorkerEvent};

fn worker(fragments: u64, window: u32) -> Worker {
    Worker::new(WorkerConfig {
        total_size: fragments * FRAGMENT_PAYLOAD as u64,
        used_slots: 16,
        capacity: 64,
        initial_window: window,
        max_retransmissions: 50,
        fan_in: 2,
        ..WorkerConfig::default()
    })
    .unwrap()
}

fn ack(seq: u16, ecn: bool) -> FragmentHeader {
    let mut h = FragmentHeader::data(0, 2, 0, 0, SeqNum::new(seq));
    h.bitmap = 0b11;
    h.ack = true;
    h.ecn = ecn;
    h
}

fn fresh_sends(events: &[WorkerEvent]) -> Vec<u16> {
    events
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::Send(h) if !h.resend => Some(h.seq.value()),
            _ => None,
        })
        .collect()
}

// ─── P1: sequence monotonicity ──────────────────────────────────────────────

fn shuffled_acks() -> impl Strategy<Value = (u64, Vec<u16>)> {
    (2u64..48).prop_flat_map(|n| {
        let seqs: Vec<u16> = (0..n as u16).collect();
        (Just(n), Just(seqs).prop_shuffle())
    })
}

proptest! {
    #[test]
    fn assigned_sequences_are_strictly_increasing((n, acks) in shuffled_acks()) {
        let mut w = worker(n, 8);
        let mut assigned = fresh_sends(&w.start());
        for seq in acks {
            if w.is_finished() {
                break;
            }
            assigned.extend(fresh_sends(&w.on_ack(&ack(seq, false))));
        }
        for pair in assigned.windows(2) {
            prop_assert_eq!(pair[1], pair[0] + 1, "fresh sequences must not skip or repeat");
        }
    }

    #[test]
    fn arbitrary_acks_never_corrupt_the_buffer(
        acks in prop::collection::vec(any::<u16>(), 1..100)
    ) {
        // Stale, future, and duplicate sequence numbers must all be
        // swallowed without tripping the buffer-order invariants
        // (which are debug-asserted inside the worker).
        let mut w = worker(20, 8);
        w.start();
        for seq in acks {
            if w.is_finished() {
                break;
            }
            w.on_ack(&ack(seq, false));
            prop_assert!(w.inflight() <= w.buffered());
        }
    }
}

// ─── P6: window bounds ──────────────────────────────────────────────────────

proptest! {
    #[test]
    fn window_and_inflight_stay_bounded(
        marks in prop::collection::vec(any::<bool>(), 1..200)
    ) {
        let mut w = worker(500, 16);
        w.start();
        let mut seq = 0u16;
        for ecn in marks {
            if w.is_finished() {
                break;
            }
            let events = w.on_ack(&ack(seq, ecn));
            seq += 1;
            for e in &events {
                if let WorkerEvent::WindowTrace { window, .. } = e {
                    prop_assert!((2..=1024).contains(window));
                    prop_assert!(w.inflight() as u32 <= *window);
                }
            }
        }
    }
}

// ─── P4: no double-count per slot epoch ─────────────────────────────────────

proptest! {
    #[test]
    fn a_worker_bit_folds_at_most_once(
        fan_in in 2u8..8,
        order in prop::collection::vec(0u8..8, 1..64)
    ) {
        let mut agg = Aggregator::new(AggregatorConfig {
            capacity: 4,
            max_slot_retries: 5,
        });
        let mut replies = 0u32;
        let mut seen = 0u32;
        for raw in order {
            let contributor = raw % fan_in;
            let pkt = FragmentHeader::data(contributor, fan_in, 0, 1, SeqNum::new(0));
            if let SwitchVerdict::Forward(fwd) = agg.on_data(pkt) {
                if fwd.ack {
                    replies += 1;
                    prop_assert_eq!(fwd.bitmap.count_ones(), u32::from(fan_in));
                }
            }
            seen |= 1 << contributor;
        }
        // One epoch emits at most one aggregated reply (no resend flags
        // were set, so no regeneration), and only once every contributor
        // has appeared.
        prop_assert!(replies <= 1);
        if replies == 1 {
            prop_assert_eq!(seen.count_ones(), u32::from(fan_in));
        }
    }
}

// ─── P7: timeout idempotence ────────────────────────────────────────────────

proptest! {
    #[test]
    fn timeouts_only_resend_pending_entries(
        n in 4u64..24,
        picks in prop::collection::vec(any::<prop::sample::Index>(), 0..24)
    ) {
        let mut w = worker(n, n as u32);
        let start = w.start();
        let token = start.iter().find_map(|e| match e {
            WorkerEvent::ArmTimeout { token, .. } => Some(*token),
            _ => None,
        }).unwrap();
        prop_assert_eq!(token, TimeoutToken {
            pos_start: 0,
            pos_end: n - 1,
            window_shift: 0,
        });

        let mut acked = std::collections::HashSet::new();
        for pick in picks {
            let seq = pick.index(n as usize) as u16;
            w.on_ack(&ack(seq, false));
            acked.insert(seq);
        }

        let events = w.on_timeout(token);
        let resent: Vec<u16> = events.iter().filter_map(|e| match e {
            WorkerEvent::Send(h) => Some(h.seq.value()),
            _ => None,
        }).collect();

        if acked.len() == n as usize {
            // Entirely ACKed range: zero packets, no rearm.
            prop_assert!(events.is_empty());
        } else {
            prop_assert_eq!(resent.len(), n as usize - acked.len());
            for seq in &resent {
                prop_assert!(!acked.contains(seq), "ACKed entries must not resend");
            }
        }
    }
}
