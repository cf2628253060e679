//! # fanin-transport
//!
//! In-network aggregation transport for distributed-training all-reduce.
//!
//! Workers stream fixed-size gradient fragments toward a coordinator; a
//! switch-resident aggregator folds per-worker contributions into a
//! bounded table of slots and forwards one aggregated reply per epoch.
//! Everything here is pure protocol logic — sockets, timers, and queues
//! belong to the substrate, which drives the state machines and acts on
//! the events they return.
//!
//! ## Crate structure
//!
//! - [`wire`] — fixed 18-byte fragment header codec
//! - [`seq`] — 16-bit wrap-safe sequence arithmetic
//! - [`slotmap`] — CRC-based per-application slot map
//! - [`congestion`] — ECN-driven AIMD window control
//! - [`worker`] — sliding-window sender state machine
//! - [`aggregator`] — switch slot-table engine
//! - [`coordinator`] — stream-terminating assembler
//! - [`stats`] — counters and throughput trace points
//! - [`error`] — construction-time errors

pub mod aggregator;
pub mod congestion;
pub mod coordinator;
pub mod error;
pub mod seq;
pub mod slotmap;
pub mod stats;
pub mod wire;
pub mod worker;
