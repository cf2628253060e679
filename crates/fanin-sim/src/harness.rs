//! # Simulation harness
//!
//! Wires N workers, the switch-resident aggregator, and the coordinator
//! into the reference two-tier topology (every worker one hop from the
//! switch, the coordinator one hop upstream) and drives the pure state
//! machines from the event queue. The harness owns everything the
//! protocol explicitly does not: links, timers, and the fan-out of
//! multicast replies.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tracing::debug;

use fanin_transport::aggregator::{Address, Aggregator, AggregatorConfig, SwitchVerdict};
use fanin_transport::coordinator::Coordinator;
use fanin_transport::stats::{AggregatorStats, CoordinatorStats, WorkerStats};
use fanin_transport::wire::FragmentHeader;
use fanin_transport::worker::{TimeoutToken, Worker, WorkerConfig, WorkerEvent};

use crate::link::{Link, LinkConfig, Transit};
use crate::sched::{EventId, EventQueue, SimTime};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Scenario parameters for one simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// One entry per worker; job and identity live in each config.
    pub workers: Vec<WorkerConfig>,
    pub aggregator: AggregatorConfig,
    /// Worker → switch direction, instantiated per worker.
    pub worker_uplink: LinkConfig,
    /// Switch → worker direction, instantiated per worker.
    pub worker_downlink: LinkConfig,
    /// Switch → coordinator direction.
    pub switch_uplink: LinkConfig,
    /// Coordinator → switch direction.
    pub switch_downlink: LinkConfig,
    /// Hard stop for the virtual clock.
    pub deadline: Duration,
    /// Throughput trace cadence; `None` disables the stats events.
    pub stats_interval: Option<Duration>,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            workers: Vec::new(),
            aggregator: AggregatorConfig::default(),
            worker_uplink: LinkConfig::default(),
            worker_downlink: LinkConfig::default(),
            switch_uplink: LinkConfig::default(),
            switch_downlink: LinkConfig::default(),
            deadline: Duration::from_secs(1),
            stats_interval: None,
            seed: 1,
        }
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

enum Ev {
    /// Data packet arriving at the switch.
    SwitchData { pkt: FragmentHeader },
    /// Coordinator reply arriving back at the switch.
    SwitchAck { pkt: FragmentHeader },
    /// Packet arriving at the coordinator.
    CoordinatorRx { pkt: FragmentHeader },
    /// Reply copy arriving at a worker.
    WorkerRx { worker: usize, pkt: FragmentHeader },
    /// A worker's captured-range timeout fired.
    WorkerTimeout { worker: usize, token: TimeoutToken },
    /// Throughput trace tick.
    StatsTick,
}

// ─── Report ─────────────────────────────────────────────────────────────────

/// Everything a scenario asserts against after the run.
#[derive(Debug)]
pub struct SimReport {
    pub elapsed_ns: SimTime,
    pub finished: Vec<bool>,
    pub all_finished: bool,
    /// Packets lost across every link.
    pub dropped: u64,
    pub worker_stats: Vec<WorkerStats>,
    pub aggregator_stats: AggregatorStats,
    pub coordinator_stats: CoordinatorStats,
    /// In-order deliveries per job id.
    pub delivered: HashMap<u32, u64>,
    /// Per-worker `(time, window, ecn)` trace records.
    pub window_traces: Vec<Vec<(SimTime, u32, bool)>>,
    /// Per-worker `(time, tx_gbps, rx_gbps)` samples.
    pub worker_throughput: Vec<Vec<(SimTime, f64, f64)>>,
    pub coordinator_throughput: Vec<(SimTime, f64, f64)>,
}

// ─── Simulation ─────────────────────────────────────────────────────────────

/// A wired-up scenario, ready to run.
pub struct Simulation {
    queue: EventQueue<Ev>,
    workers: Vec<Worker>,
    aggregator: Aggregator,
    coordinator: Coordinator,
    addr_index: HashMap<Address, usize>,
    worker_uplinks: Vec<Link>,
    worker_downlinks: Vec<Link>,
    switch_uplink: Link,
    switch_downlink: Link,
    window_traces: Vec<Vec<(SimTime, u32, bool)>>,
    worker_throughput: Vec<Vec<(SimTime, f64, f64)>>,
    coordinator_throughput: Vec<(SimTime, f64, f64)>,
    /// Outstanding timeout handles per worker, cancelled on its stop.
    timeout_handles: Vec<Vec<EventId>>,
    deadline: Duration,
    stats_interval: Option<Duration>,
    seed: u64,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Result<Self> {
        let n = config.workers.len();
        let mut aggregator = Aggregator::new(config.aggregator.clone());
        let mut workers = Vec::with_capacity(n);
        let mut addr_index = HashMap::new();
        let mut worker_uplinks = Vec::with_capacity(n);
        let mut worker_downlinks = Vec::with_capacity(n);

        for (i, wc) in config.workers.iter().enumerate() {
            workers.push(Worker::new(wc.clone())?);
            let addr = Address::new(Bytes::copy_from_slice(&(i as u32).to_be_bytes()));
            aggregator.add_worker(addr.clone());
            addr_index.insert(addr, i);
            worker_uplinks.push(Link::new(
                config.worker_uplink.clone(),
                uplink_seed(config.seed, i),
            ));
            worker_downlinks.push(Link::new(
                config.worker_downlink.clone(),
                downlink_seed(config.seed, i),
            ));
        }

        Ok(Simulation {
            queue: EventQueue::new(),
            workers,
            aggregator,
            coordinator: Coordinator::new(),
            addr_index,
            worker_uplinks,
            worker_downlinks,
            switch_uplink: Link::new(config.switch_uplink.clone(), config.seed ^ 0xA1),
            switch_downlink: Link::new(config.switch_downlink.clone(), config.seed ^ 0xB2),
            window_traces: vec![Vec::new(); n],
            worker_throughput: vec![Vec::new(); n],
            coordinator_throughput: Vec::new(),
            timeout_handles: vec![Vec::new(); n],
            deadline: config.deadline,
            stats_interval: config.stats_interval,
            seed: config.seed,
        })
    }

    /// Replace one worker's uplink impairment before running.
    pub fn impair_worker_uplink(&mut self, worker: usize, config: LinkConfig) {
        self.worker_uplinks[worker] = Link::new(config, uplink_seed(self.seed, worker));
    }

    /// Replace one worker's downlink impairment before running.
    pub fn impair_worker_downlink(&mut self, worker: usize, config: LinkConfig) {
        self.worker_downlinks[worker] = Link::new(config, downlink_seed(self.seed, worker));
    }

    pub fn worker(&self, index: usize) -> &Worker {
        &self.workers[index]
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Drive every event until quiescence, completion, or the deadline.
    pub fn run(&mut self) -> SimReport {
        let deadline_ns = self.deadline.as_nanos() as u64;

        for i in 0..self.workers.len() {
            let events = self.workers[i].start();
            self.apply_worker_events(i, events);
        }
        if let Some(interval) = self.stats_interval {
            self.queue
                .schedule(interval.as_nanos() as u64, Ev::StatsTick);
        }

        while let Some((at, ev)) = self.queue.pop() {
            if at > deadline_ns {
                break;
            }
            self.dispatch(ev);
            if self.workers.iter().all(|w| w.is_finished()) {
                break;
            }
        }

        self.report()
    }

    fn dispatch(&mut self, ev: Ev) {
        match ev {
            Ev::SwitchData { pkt } => {
                if let SwitchVerdict::Forward(fwd) = self.aggregator.on_data(pkt) {
                    if let Transit::Deliver { delay, ecn } = self.switch_uplink.transit() {
                        let mut p = fwd;
                        p.ecn |= ecn;
                        self.queue
                            .schedule(delay.as_nanos() as u64, Ev::CoordinatorRx { pkt: p });
                    }
                }
            }
            Ev::CoordinatorRx { pkt } => {
                let out = self.coordinator.on_packet(&pkt);
                if let Some(ack) = out.ack {
                    if let Transit::Deliver { delay, ecn } = self.switch_downlink.transit() {
                        let mut p = ack;
                        p.ecn |= ecn;
                        self.queue
                            .schedule(delay.as_nanos() as u64, Ev::SwitchAck { pkt: p });
                    }
                }
            }
            Ev::SwitchAck { pkt } => {
                let outcome = self.aggregator.on_reflected_ack(pkt);
                for (addr, reply) in outcome.deliveries {
                    let Some(&wi) = self.addr_index.get(&addr) else {
                        continue;
                    };
                    if let Transit::Deliver { delay, ecn } = self.worker_downlinks[wi].transit() {
                        let mut p = reply;
                        p.ecn |= ecn;
                        self.queue.schedule(
                            delay.as_nanos() as u64,
                            Ev::WorkerRx { worker: wi, pkt: p },
                        );
                    }
                }
            }
            Ev::WorkerRx { worker, pkt } => {
                let events = self.workers[worker].on_ack(&pkt);
                self.apply_worker_events(worker, events);
            }
            Ev::WorkerTimeout { worker, token } => {
                let events = self.workers[worker].on_timeout(token);
                self.apply_worker_events(worker, events);
            }
            Ev::StatsTick => {
                let interval = self
                    .stats_interval
                    .expect("stats tick only scheduled with an interval");
                let now = self.queue.now();
                for (i, w) in self.workers.iter_mut().enumerate() {
                    let (tx, rx) = w.throughput_sample(interval);
                    self.worker_throughput[i].push((now, tx, rx));
                }
                let (tx, rx) = self.coordinator.throughput_sample(interval);
                self.coordinator_throughput.push((now, tx, rx));
                if !self.workers.iter().all(|w| w.is_finished()) {
                    self.queue
                        .schedule(interval.as_nanos() as u64, Ev::StatsTick);
                }
            }
        }
    }

    fn apply_worker_events(&mut self, worker: usize, events: Vec<WorkerEvent>) {
        for ev in events {
            match ev {
                WorkerEvent::Send(pkt) => match self.worker_uplinks[worker].transit() {
                    Transit::Deliver { delay, ecn } => {
                        let mut p = pkt;
                        p.ecn |= ecn;
                        self.queue
                            .schedule(delay.as_nanos() as u64, Ev::SwitchData { pkt: p });
                    }
                    Transit::Dropped => {}
                },
                WorkerEvent::ArmTimeout { token, delay } => {
                    let id = self.queue.schedule(
                        delay.as_nanos() as u64,
                        Ev::WorkerTimeout { worker, token },
                    );
                    self.timeout_handles[worker].push(id);
                }
                WorkerEvent::WindowTrace { window, ecn } => {
                    self.window_traces[worker].push((self.queue.now(), window, ecn));
                }
                WorkerEvent::Finished => {
                    for id in self.timeout_handles[worker].drain(..) {
                        self.queue.cancel(id);
                    }
                    debug!(worker, "worker finished");
                }
            }
        }
    }

    fn report(&self) -> SimReport {
        let finished: Vec<bool> = self.workers.iter().map(|w| w.is_finished()).collect();
        let all_finished = finished.iter().all(|f| *f);
        let dropped = self.worker_uplinks.iter().map(|l| l.dropped).sum::<u64>()
            + self.worker_downlinks.iter().map(|l| l.dropped).sum::<u64>()
            + self.switch_uplink.dropped
            + self.switch_downlink.dropped;

        let mut delivered = HashMap::new();
        for w in &self.workers {
            let job = w.config().job_id;
            delivered
                .entry(job)
                .or_insert_with(|| self.coordinator.delivered(job));
        }

        SimReport {
            elapsed_ns: self.queue.now(),
            finished,
            all_finished,
            dropped,
            worker_stats: self.workers.iter().map(|w| w.stats().clone()).collect(),
            aggregator_stats: self.aggregator.stats().clone(),
            coordinator_stats: self.coordinator.stats().clone(),
            delivered,
            window_traces: self.window_traces.clone(),
            worker_throughput: self.worker_throughput.clone(),
            coordinator_throughput: self.coordinator_throughput.clone(),
        }
    }
}

fn uplink_seed(seed: u64, worker: usize) -> u64 {
    seed ^ (0x5F00 + worker as u64)
}

fn downlink_seed(seed: u64, worker: usize) -> u64 {
    seed ^ (0xAF00 + worker as u64)
}
