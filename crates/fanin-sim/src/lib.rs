//! Deterministic simulation toolkit for the fanin aggregation transport.
//!
//! Provides a virtual-time event queue, seeded link impairment (delay,
//! uniform loss, ECN marking), and a harness wiring workers, the switch
//! aggregator, and the coordinator into the reference two-tier topology
//! for integration testing.

pub mod harness;
pub mod link;
pub mod sched;
