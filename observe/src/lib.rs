// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

#[cfg(test)]
mod tests;

///
/// Receives events from the stabilization engine as a pass executes.
///
/// Implementations are invoked synchronously on the engine thread, inside the pass: callbacks
/// must be bounded and must not allocate on the hot path. All methods default to no-ops so that
/// a listener only implements the events it cares about.
///
pub trait PassListener: Send + Sync {
    fn on_pass_start(&self, _epoch: u64) {}

    fn on_node_stabilized(
        &self,
        _epoch: u64,
        _topo_index: usize,
        _name: &str,
        _changed: bool,
        _duration_ns: u64,
    ) {
    }

    fn on_node_error(&self, _epoch: u64, _topo_index: usize, _name: &str, _error: &dyn fmt::Display) {
    }

    fn on_pass_end(&self, _epoch: u64, _nodes_stabilized: usize) {}
}

///
/// Fans events out to a set of listeners.
///
/// Registration uses a copy-on-write collection: `add` swaps in a new listener vector, so a pass
/// that is concurrently reading the collection observes either the old or the new set, never a
/// partially updated one. Registration is expected to be rare (startup); dispatch is lock-free.
///
pub struct CompositeListener {
    listeners: ArcSwap<Vec<Arc<dyn PassListener>>>,
}

impl CompositeListener {
    pub fn new() -> CompositeListener {
        CompositeListener {
            listeners: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Appends a listener. Existing listeners are retained: composition is always additive, and
    /// replacing the installed set requires constructing a new composite explicitly.
    pub fn add(&self, listener: Arc<dyn PassListener>) {
        self.listeners.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(listener.clone());
            next
        });
    }

    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }
}

impl PassListener for CompositeListener {
    fn on_pass_start(&self, epoch: u64) {
        for listener in self.listeners.load().iter() {
            listener.on_pass_start(epoch);
        }
    }

    fn on_node_stabilized(
        &self,
        epoch: u64,
        topo_index: usize,
        name: &str,
        changed: bool,
        duration_ns: u64,
    ) {
        for listener in self.listeners.load().iter() {
            listener.on_node_stabilized(epoch, topo_index, name, changed, duration_ns);
        }
    }

    fn on_node_error(&self, epoch: u64, topo_index: usize, name: &str, error: &dyn fmt::Display) {
        for listener in self.listeners.load().iter() {
            listener.on_node_error(epoch, topo_index, name, error);
        }
    }

    fn on_pass_end(&self, epoch: u64, nodes_stabilized: usize) {
        for listener in self.listeners.load().iter() {
            listener.on_pass_end(epoch, nodes_stabilized);
        }
    }
}

/// Aggregate pass latency, as observed between `on_pass_start` and `on_pass_end`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LatencyStats {
    pub count: u64,
    pub sum_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

impl LatencyStats {
    pub fn avg_ns(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum_ns / self.count
        }
    }
}

struct LatencyInner {
    pass_started: Option<Instant>,
    count: u64,
    sum_ns: u64,
    min_ns: u64,
    max_ns: u64,
    histogram: hdrhistogram::Histogram<u64>,
}

///
/// Aggregates whole-pass latency across passes: count, total, min, max, plus a histogram for
/// percentile queries. Does no per-node work.
///
pub struct LatencyAggregator {
    inner: Mutex<LatencyInner>,
}

impl LatencyAggregator {
    pub fn new() -> LatencyAggregator {
        LatencyAggregator {
            inner: Mutex::new(LatencyInner {
                pass_started: None,
                count: 0,
                sum_ns: 0,
                min_ns: u64::MAX,
                max_ns: 0,
                histogram: hdrhistogram::Histogram::<u64>::new(3)
                    .expect("Failed to allocate histogram"),
            }),
        }
    }

    pub fn stats(&self) -> LatencyStats {
        let inner = self.inner.lock();
        LatencyStats {
            count: inner.count,
            sum_ns: inner.sum_ns,
            min_ns: if inner.count == 0 { 0 } else { inner.min_ns },
            max_ns: inner.max_ns,
        }
    }

    /// The pass latency at the given quantile (in `[0.0, 1.0]`), in nanoseconds.
    pub fn latency_at_quantile(&self, quantile: f64) -> u64 {
        self.inner.lock().histogram.value_at_quantile(quantile)
    }

    fn record(&self, duration_ns: u64) {
        let mut inner = self.inner.lock();
        inner.count += 1;
        inner.sum_ns += duration_ns;
        inner.min_ns = inner.min_ns.min(duration_ns);
        inner.max_ns = inner.max_ns.max(duration_ns);
        // Saturates at the histogram's configured max rather than erroring.
        inner.histogram.saturating_record(duration_ns);
    }
}

impl PassListener for LatencyAggregator {
    fn on_pass_start(&self, _epoch: u64) {
        self.inner.lock().pass_started = Some(Instant::now());
    }

    fn on_pass_end(&self, _epoch: u64, _nodes_stabilized: usize) {
        let started = self.inner.lock().pass_started.take();
        if let Some(started) = started {
            self.record(duration_ns_since(started));
        }
    }
}

/// One row of the per-node profile table.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProfileSlot {
    pub count: u64,
    pub sum_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub last_ns: u64,
}

///
/// Per-node stabilization timings, indexed by topological index.
///
/// The table is a flat array sized once at graph build; updates on the engine thread take a
/// short lock per stabilized node. `dump` renders a view sorted by total time.
///
pub struct NodeProfiler {
    names: Vec<String>,
    slots: Mutex<Vec<ProfileSlot>>,
}

impl NodeProfiler {
    pub fn new(names: Vec<String>) -> NodeProfiler {
        let slots = vec![ProfileSlot::default(); names.len()];
        NodeProfiler {
            names,
            slots: Mutex::new(slots),
        }
    }

    pub fn slot(&self, topo_index: usize) -> Option<ProfileSlot> {
        self.slots.lock().get(topo_index).copied()
    }

    /// Renders all nodes that have been stabilized at least once, sorted by total time
    /// descending.
    pub fn dump(&self) -> String {
        let slots = self.slots.lock().clone();
        let mut indices: Vec<usize> = (0..slots.len()).filter(|&i| slots[i].count > 0).collect();
        indices.sort_by_key(|&i| std::cmp::Reverse(slots[i].sum_ns));

        let mut out = String::new();
        out.push_str("node profile (sorted by total time):\n");
        for i in indices {
            let slot = &slots[i];
            out.push_str(&format!(
                "  {:<32} count={:<8} total_ns={:<12} avg_ns={:<10} min_ns={:<10} max_ns={:<10} last_ns={}\n",
                self.names[i],
                slot.count,
                slot.sum_ns,
                slot.sum_ns / slot.count,
                slot.min_ns,
                slot.max_ns,
                slot.last_ns,
            ));
        }
        out
    }
}

impl PassListener for NodeProfiler {
    fn on_node_stabilized(
        &self,
        _epoch: u64,
        topo_index: usize,
        _name: &str,
        _changed: bool,
        duration_ns: u64,
    ) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(topo_index) {
            slot.count += 1;
            slot.sum_ns += duration_ns;
            slot.min_ns = if slot.count == 1 {
                duration_ns
            } else {
                slot.min_ns.min(duration_ns)
            };
            slot.max_ns = slot.max_ns.max(duration_ns);
            slot.last_ns = duration_ns;
        }
    }
}

///
/// Logs pass summaries and node errors via the `log` facade.
///
pub struct LoggingListener;

impl PassListener for LoggingListener {
    fn on_node_error(&self, epoch: u64, topo_index: usize, name: &str, error: &dyn fmt::Display) {
        log::warn!("Node {name} (topo {topo_index}) failed in pass {epoch}: {error}");
    }

    fn on_pass_end(&self, epoch: u64, nodes_stabilized: usize) {
        log::debug!("Pass {epoch} stabilized {nodes_stabilized} nodes");
    }
}

///
/// Throttles reporting of recurring failures inside user-supplied operators.
///
/// A failing market-data operator can throw on every tick; this reporter logs at most once per
/// configured interval, and exposes the cooldown as a circuit breaker so operators can
/// short-circuit to NaN without repeating expensive throwing work.
///
pub struct RateLimitedReporter {
    min_interval: Duration,
    last_log: Mutex<Option<Instant>>,
}

impl RateLimitedReporter {
    pub fn new(min_interval: Duration) -> RateLimitedReporter {
        RateLimitedReporter {
            min_interval,
            last_log: Mutex::new(None),
        }
    }

    /// Logs the failure iff the cooldown has elapsed. Returns whether the failure was logged.
    pub fn report(&self, message: &str, error: &dyn fmt::Display) -> bool {
        let mut last_log = self.last_log.lock();
        let now = Instant::now();
        match *last_log {
            Some(prev) if now.duration_since(prev) < self.min_interval => false,
            _ => {
                *last_log = Some(now);
                log::error!("{message}: {error}");
                true
            }
        }
    }

    /// True while within the cooldown that followed the last logged failure.
    pub fn is_open(&self) -> bool {
        match *self.last_log.lock() {
            Some(prev) => prev.elapsed() < self.min_interval,
            None => false,
        }
    }
}

/// Nanoseconds elapsed since `started`, saturated into a `u64`.
pub fn duration_ns_since(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX)
}
