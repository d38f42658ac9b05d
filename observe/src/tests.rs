// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{
    CompositeListener, LatencyAggregator, NodeProfiler, PassListener, RateLimitedReporter,
};

#[derive(Default)]
struct CountingListener {
    starts: AtomicUsize,
    nodes: AtomicUsize,
    errors: AtomicUsize,
    ends: AtomicUsize,
}

impl PassListener for CountingListener {
    fn on_pass_start(&self, _epoch: u64) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_node_stabilized(
        &self,
        _epoch: u64,
        _topo_index: usize,
        _name: &str,
        _changed: bool,
        _duration_ns: u64,
    ) {
        self.nodes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_node_error(
        &self,
        _epoch: u64,
        _topo_index: usize,
        _name: &str,
        _error: &dyn std::fmt::Display,
    ) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_pass_end(&self, _epoch: u64, _nodes_stabilized: usize) {
        self.ends.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn composite_fans_out_to_all_listeners() {
    let composite = CompositeListener::new();
    let first = Arc::new(CountingListener::default());
    let second = Arc::new(CountingListener::default());
    composite.add(first.clone());
    composite.add(second.clone());
    assert_eq!(composite.len(), 2);

    composite.on_pass_start(1);
    composite.on_node_stabilized(1, 0, "bid", true, 120);
    composite.on_node_error(1, 1, "mid", &"boom");
    composite.on_pass_end(1, 2);

    for listener in [&first, &second] {
        assert_eq!(listener.starts.load(Ordering::SeqCst), 1);
        assert_eq!(listener.nodes.load(Ordering::SeqCst), 1);
        assert_eq!(listener.errors.load(Ordering::SeqCst), 1);
        assert_eq!(listener.ends.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn composite_add_is_additive() {
    let composite = CompositeListener::new();
    let listener = Arc::new(CountingListener::default());
    composite.add(listener.clone());
    composite.add(Arc::new(CountingListener::default()));

    // The first listener still receives events after the second registration.
    composite.on_pass_start(7);
    assert_eq!(listener.starts.load(Ordering::SeqCst), 1);
}

#[test]
fn latency_aggregator_tracks_min_avg_max() {
    let aggregator = LatencyAggregator::new();
    aggregator.record(100);
    aggregator.record(300);
    aggregator.record(200);

    let stats = aggregator.stats();
    assert_eq!(stats.count, 3);
    assert_eq!(stats.sum_ns, 600);
    assert_eq!(stats.min_ns, 100);
    assert_eq!(stats.max_ns, 300);
    assert_eq!(stats.avg_ns(), 200);
    assert!(aggregator.latency_at_quantile(1.0) >= 299);
}

#[test]
fn latency_aggregator_empty_stats() {
    let aggregator = LatencyAggregator::new();
    let stats = aggregator.stats();
    assert_eq!(stats.count, 0);
    assert_eq!(stats.min_ns, 0);
    assert_eq!(stats.max_ns, 0);
    assert_eq!(stats.avg_ns(), 0);
}

#[test]
fn latency_aggregator_measures_pass_events() {
    let aggregator = LatencyAggregator::new();
    aggregator.on_pass_start(1);
    aggregator.on_pass_end(1, 4);
    assert_eq!(aggregator.stats().count, 1);

    // A pass end without a matching start records nothing.
    aggregator.on_pass_end(2, 4);
    assert_eq!(aggregator.stats().count, 1);
}

#[test]
fn node_profiler_records_per_node() {
    let profiler = NodeProfiler::new(vec!["bid".to_owned(), "mid".to_owned()]);
    profiler.on_node_stabilized(1, 0, "bid", true, 50);
    profiler.on_node_stabilized(1, 0, "bid", false, 150);
    profiler.on_node_stabilized(1, 1, "mid", true, 700);

    let bid = profiler.slot(0).unwrap();
    assert_eq!(bid.count, 2);
    assert_eq!(bid.sum_ns, 200);
    assert_eq!(bid.min_ns, 50);
    assert_eq!(bid.max_ns, 150);
    assert_eq!(bid.last_ns, 150);

    // Out-of-range indices are ignored rather than panicking on the engine thread.
    profiler.on_node_stabilized(1, 99, "ghost", true, 1);
    assert!(profiler.slot(99).is_none());
}

#[test]
fn node_profiler_dump_sorts_by_total_time() {
    let profiler = NodeProfiler::new(vec!["cheap".to_owned(), "expensive".to_owned()]);
    profiler.on_node_stabilized(1, 0, "cheap", true, 10);
    profiler.on_node_stabilized(1, 1, "expensive", true, 10_000);

    let dump = profiler.dump();
    let expensive_at = dump.find("expensive").unwrap();
    let cheap_at = dump.find("cheap").unwrap();
    assert!(expensive_at < cheap_at, "dump was not sorted by total time:\n{dump}");
}

#[test]
fn rate_limited_reporter_throttles() {
    let reporter = RateLimitedReporter::new(Duration::from_secs(3600));
    assert!(!reporter.is_open());
    assert!(reporter.report("op failed", &"division by zero"));
    assert!(reporter.is_open());
    // Second report within the window is swallowed.
    assert!(!reporter.report("op failed", &"division by zero"));
}

#[test]
fn rate_limited_reporter_zero_interval_always_logs() {
    let reporter = RateLimitedReporter::new(Duration::ZERO);
    assert!(reporter.report("op failed", &"first"));
    assert!(reporter.report("op failed", &"second"));
    assert!(!reporter.is_open());
}
