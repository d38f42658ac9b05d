// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::{Duration, Instant};

use graph::{Cutoff, Engine, GraphBuilder, GraphError, Topology};

use crate::{BridgeConfig, IngestBridge, UpdateEvent, WaitStrategy, SCALAR_UPDATE};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// bid/ask sources feeding mid = (bid + ask) / 2.
fn quote_engine() -> Engine {
    let mut builder = GraphBuilder::new();
    builder.add_scalar_source("bid", Cutoff::Exact).unwrap();
    builder.add_scalar_source("ask", Cutoff::Exact).unwrap();
    builder
        .add_scalar_derived("mid", &["bid", "ask"], Cutoff::Exact, |inputs: &[f64]| {
            (inputs[0] + inputs[1]) / 2.0
        })
        .unwrap();
    Engine::new(Topology::compile(builder).unwrap())
}

fn topo_index(engine: &Engine, name: &str) -> u32 {
    engine.topology().topo_index(name).unwrap() as u32
}

fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for {description}");
}

#[test]
fn config_rejects_bad_ring_capacities() {
    let engine = quote_engine();
    let config = BridgeConfig {
        ring_capacity: 100,
        ..BridgeConfig::default()
    };
    assert!(IngestBridge::spawn(engine, config, None).is_err());

    let engine = quote_engine();
    let config = BridgeConfig {
        ring_capacity: 32,
        ..BridgeConfig::default()
    };
    assert!(IngestBridge::spawn(engine, config, None).is_err());
}

#[test]
fn events_flow_through_to_stabilized_values() {
    init_logging();
    let engine = quote_engine();
    let bid = topo_index(&engine, "bid");
    let ask = topo_index(&engine, "ask");
    let (bridge, mut producer) =
        IngestBridge::spawn(engine, BridgeConfig::default(), None).unwrap();

    producer.send_scalar(bid, 99.5).unwrap();
    producer.send_scalar_flush(ask, 100.5).unwrap();
    let stats = bridge.stats();
    wait_until("both events to be consumed", || stats.events_consumed() == 2);
    wait_until("a pass to run", || stats.passes_run() >= 1);

    let engine = bridge.shutdown().unwrap();
    assert_eq!(engine.scalar("mid").unwrap(), 100.0);
    assert_eq!(engine.scalar("bid").unwrap(), 99.5);
}

#[test]
fn bursts_coalesce_into_few_passes() {
    init_logging();
    // A deliberately slow derived node: while one pass runs, the rest of the burst queues up
    // and is applied in the next batch.
    let mut builder = GraphBuilder::new();
    builder.add_scalar_source("tick", Cutoff::Exact).unwrap();
    builder
        .add_scalar_derived("slow", &["tick"], Cutoff::Exact, |inputs: &[f64]| {
            std::thread::sleep(Duration::from_millis(20));
            inputs[0]
        })
        .unwrap();
    let engine = Engine::new(Topology::compile(builder).unwrap());
    let tick = topo_index(&engine, "tick");
    let (bridge, mut producer) =
        IngestBridge::spawn(engine, BridgeConfig::default(), None).unwrap();

    const BURST: u64 = 1000;
    for n in 0..BURST {
        producer.send_scalar(tick, 99.0 + n as f64 * 0.001).unwrap();
    }
    producer.send_scalar_flush(tick, 99.5).unwrap();

    let stats = bridge.stats();
    wait_until("the burst to be consumed", || {
        stats.events_consumed() == BURST + 1
    });
    let engine = bridge.shutdown().unwrap();
    assert_eq!(engine.scalar("slow").unwrap(), 99.5);
    // Coalescing turns the burst into a handful of passes, not one per event.
    assert!(
        stats.passes_run() <= 20,
        "expected coalescing, saw {} passes for {BURST} events",
        stats.passes_run()
    );
}

#[test]
fn per_event_passes_without_coalescing() {
    let engine = quote_engine();
    let bid = topo_index(&engine, "bid");
    let config = BridgeConfig {
        batch_coalescing: false,
        wait_strategy: WaitStrategy::Yield,
        ..BridgeConfig::default()
    };
    let (bridge, mut producer) = IngestBridge::spawn(engine, config, None).unwrap();

    for tick in 0..10 {
        producer.send_scalar(bid, 100.0 + tick as f64).unwrap();
    }
    let stats = bridge.stats();
    wait_until("all events to be consumed", || stats.events_consumed() == 10);
    wait_until("one pass per event", || stats.passes_run() == 10);
    bridge.shutdown().unwrap();
}

#[test]
fn non_source_targets_are_dropped_and_counted() {
    let engine = quote_engine();
    let mid = topo_index(&engine, "mid");
    let (bridge, mut producer) =
        IngestBridge::spawn(engine, BridgeConfig::default(), None).unwrap();

    // A derived node and an out-of-range index are both invalid targets.
    producer.send_scalar(mid, 1.0).unwrap();
    producer.send_scalar_flush(999, 1.0).unwrap();

    let stats = bridge.stats();
    wait_until("both drops to be counted", || stats.dropped_events() == 2);
    assert_eq!(stats.invalid_vector_index(), 0);
    bridge.shutdown().unwrap();
}

#[test]
fn invalid_vector_indices_are_counted_separately() {
    let mut builder = GraphBuilder::new();
    builder.add_vector_source("curve", 2, 0.0, 1e-9).unwrap();
    let engine = Engine::new(Topology::compile(builder).unwrap());
    let curve = topo_index(&engine, "curve");
    let (bridge, mut producer) =
        IngestBridge::spawn(engine, BridgeConfig::default(), None).unwrap();

    producer.send_vector(curve, 0, 4.2).unwrap();
    producer.send_vector_flush(curve, 7, 4.2).unwrap();

    let stats = bridge.stats();
    wait_until("the invalid index to be counted", || {
        stats.invalid_vector_index() == 1
    });
    assert_eq!(stats.dropped_events(), 0);

    let engine = bridge.shutdown().unwrap();
    assert_eq!(engine.vector("curve").unwrap()[0], 4.2);
}

#[test]
fn scalar_event_against_vector_source_is_dropped() {
    let mut builder = GraphBuilder::new();
    builder.add_vector_source("curve", 2, 0.0, 1e-9).unwrap();
    let engine = Engine::new(Topology::compile(builder).unwrap());
    let curve = topo_index(&engine, "curve");
    let (bridge, mut producer) =
        IngestBridge::spawn(engine, BridgeConfig::default(), None).unwrap();

    producer.send_scalar_flush(curve, 4.2).unwrap();
    let stats = bridge.stats();
    wait_until("the mismatch to be dropped", || stats.dropped_events() == 1);
    bridge.shutdown().unwrap();
}

#[test]
fn pass_failures_surface_without_killing_the_consumer() {
    init_logging();
    let mut builder = GraphBuilder::new();
    builder.add_scalar_source("a", Cutoff::Exact).unwrap();
    builder
        .add_scalar_derived("b", &["a"], Cutoff::Exact, |inputs: &[f64]| {
            if inputs[0] > 50.0 {
                panic!("input out of range")
            }
            inputs[0]
        })
        .unwrap();
    let engine = Engine::new(Topology::compile(builder).unwrap());
    let a = topo_index(&engine, "a");
    let (bridge, mut producer) =
        IngestBridge::spawn(engine, BridgeConfig::default(), None).unwrap();

    producer.send_scalar_flush(a, 100.0).unwrap();
    let stats = bridge.stats();
    let mut surfaced = None;
    wait_until("the pass failure to surface", || {
        if surfaced.is_none() {
            surfaced = bridge.try_error();
        }
        surfaced.is_some()
    });
    assert!(matches!(
        surfaced,
        Some(GraphError::StabilizationFailed { .. })
    ));
    assert!(stats.pass_failures() >= 1);

    // The consumer is still alive and still accepting events.
    assert!(bridge.is_live().is_ok());
    producer.send_scalar_flush(a, 10.0).unwrap();
    wait_until("the follow-up event to be consumed", || {
        stats.events_consumed() == 2
    });

    let engine = bridge.shutdown().unwrap();
    assert!(!engine.is_healthy());
}

#[test]
fn post_stabilize_hook_runs_on_the_consumer_thread() {
    let engine = quote_engine();
    let bid = topo_index(&engine, "bid");
    let ask = topo_index(&engine, "ask");
    let (epoch_sender, epoch_receiver) = crossbeam_channel::unbounded();
    let hook = Box::new(move |engine: &Engine, epoch: u64, nodes_stabilized: usize| {
        let _ = epoch_sender.send((epoch, nodes_stabilized, engine.scalar("mid").unwrap()));
    });
    let (bridge, mut producer) =
        IngestBridge::spawn(engine, BridgeConfig::default(), Some(hook)).unwrap();

    producer.send_scalar(bid, 99.5).unwrap();
    producer.send_scalar_flush(ask, 100.5).unwrap();
    let (epoch, nodes_stabilized, mid) =
        epoch_receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(epoch >= 1);
    assert!(nodes_stabilized >= 1);
    assert_eq!(mid, 100.0);
    bridge.shutdown().unwrap();
}

#[test]
fn shutdown_drains_pending_events() {
    let engine = quote_engine();
    let bid = topo_index(&engine, "bid");
    let ask = topo_index(&engine, "ask");
    let (bridge, mut producer) =
        IngestBridge::spawn(engine, BridgeConfig::default(), None).unwrap();

    producer.send_scalar(bid, 99.5).unwrap();
    producer.send_scalar(ask, 100.5).unwrap();
    // Shut down immediately: the drain applies whatever is still queued and runs a final pass.
    let engine = bridge.shutdown().unwrap();
    assert_eq!(engine.scalar("mid").unwrap(), 100.0);
}

#[test]
fn producer_sequences_are_monotone() {
    let engine = quote_engine();
    let bid = topo_index(&engine, "bid");
    let (bridge, mut producer) =
        IngestBridge::spawn(engine, BridgeConfig::default(), None).unwrap();
    assert_eq!(producer.next_sequence(), 0);
    producer.send_scalar(bid, 1.0).unwrap();
    producer.send_scalar(bid, 2.0).unwrap();
    assert_eq!(producer.next_sequence(), 2);
    bridge.shutdown().unwrap();
}

#[test]
fn spin_and_yield_strategies_also_deliver() {
    for wait_strategy in [WaitStrategy::Spin, WaitStrategy::Yield] {
        let engine = quote_engine();
        let bid = topo_index(&engine, "bid");
        let ask = topo_index(&engine, "ask");
        let config = BridgeConfig {
            wait_strategy,
            ..BridgeConfig::default()
        };
        let (bridge, mut producer) = IngestBridge::spawn(engine, config, None).unwrap();
        producer.send_scalar(bid, 99.0).unwrap();
        producer.send_scalar_flush(ask, 101.0).unwrap();
        let stats = bridge.stats();
        wait_until("events to be consumed", || stats.events_consumed() == 2);
        let engine = bridge.shutdown().unwrap();
        assert_eq!(engine.scalar("mid").unwrap(), 100.0);
    }
}

#[test]
fn raw_event_layout_is_stable() {
    let event = UpdateEvent {
        target_index: 3,
        double_value: 1.25,
        vector_index: SCALAR_UPDATE,
        force_flush: true,
        sequence: 9,
    };
    let copy = event;
    assert_eq!(copy, event);
    assert_eq!(event.vector_index, -1);
}
