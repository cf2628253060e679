//! # Link impairment model
//!
//! Each directed link owns a seeded RNG, a fixed propagation delay, a
//! uniform packet loss rate, and an ECN marking rate. Seeded per link so
//! a scenario replays identically regardless of how other links draw.

use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use std::time::Duration;

/// Per-link impairment parameters.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// One-way propagation delay.
    pub delay: Duration,
    /// Uniform per-packet loss probability, `0.0..=1.0`.
    pub loss_rate: f64,
    /// Probability a surviving packet picks up the ECN mark.
    pub ecn_mark_rate: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        // 100 Gbps point-to-point defaults: 500 ns propagation, clean.
        LinkConfig {
            delay: Duration::from_nanos(500),
            loss_rate: 0.0,
            ecn_mark_rate: 0.0,
        }
    }
}

/// What happened to one packet in transit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transit {
    Deliver { delay: Duration, ecn: bool },
    Dropped,
}

/// A directed link.
pub struct Link {
    config: LinkConfig,
    rng: StdRng,
    /// Packets lost on this link so far.
    pub dropped: u64,
}

impl Link {
    pub fn new(config: LinkConfig, seed: u64) -> Self {
        Link {
            config,
            rng: StdRng::seed_from_u64(seed),
            dropped: 0,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Judge one packet: dropped, or delivered after the link delay with
    /// a possible ECN mark.
    pub fn transit(&mut self) -> Transit {
        if self.config.loss_rate > 0.0 && self.rng.random::<f64>() < self.config.loss_rate {
            self.dropped += 1;
            return Transit::Dropped;
        }
        let ecn =
            self.config.ecn_mark_rate > 0.0 && self.rng.random::<f64>() < self.config.ecn_mark_rate;
        Transit::Deliver {
            delay: self.config.delay,
            ecn,
        }
    }
}
