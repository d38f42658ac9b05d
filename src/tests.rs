// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::thread;
use std::time::{Duration, Instant};

use crate::{
    capture_state, restore_state, state_from_json, state_to_json, topology_fingerprint, Config,
    Core, Cutoff, Engine, GraphBuilder, GraphError, ListenerConfig, StateError, Topology,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn quote_builder() -> GraphBuilder {
    let mut builder = GraphBuilder::new();
    builder.add_scalar_source("bid", Cutoff::Exact).unwrap();
    builder.add_scalar_source("ask", Cutoff::Exact).unwrap();
    builder
        .add_scalar_derived("mid", &["bid", "ask"], Cutoff::Exact, |inputs: &[f64]| {
            (inputs[0] + inputs[1]) / 2.0
        })
        .unwrap();
    builder
        .add_scalar_derived("spread", &["ask", "bid"], Cutoff::Exact, |inputs: &[f64]| {
            inputs[0] - inputs[1]
        })
        .unwrap();
    builder
}

fn quote_engine() -> Engine {
    Engine::new(Topology::compile(quote_builder()).unwrap())
}

fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for {description}");
}

#[test]
fn core_runs_the_full_pipeline() {
    init_logging();
    let engine = quote_engine();
    let bid = engine.topology().topo_index("bid").unwrap() as u32;
    let ask = engine.topology().topo_index("ask").unwrap() as u32;

    let config = Config {
        snapshot_nodes: vec!["mid".to_owned(), "spread".to_owned()],
        listeners: vec![
            ListenerConfig::Latency,
            ListenerConfig::NodeProfile,
            ListenerConfig::Logging,
        ],
        ..Config::default()
    };
    let (pass_sender, pass_receiver) = crossbeam_channel::unbounded();
    let callback = Box::new(move |epoch: u64, nodes_stabilized: usize| {
        let _ = pass_sender.send((epoch, nodes_stabilized));
    });
    let mut core = Core::launch(engine, config, Some(callback)).unwrap();
    let mut producer = core.producer().unwrap();
    let mut reader = core.snapshot_reader().unwrap();
    assert!(core.producer().is_none(), "the producer handle is unique");

    producer.send_scalar(bid, 99.5).unwrap();
    producer.send_scalar_flush(ask, 100.5).unwrap();
    let (first_epoch, _) = pass_receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(first_epoch >= 1);

    // The snapshot is readable from a foreign thread, consistently per pass.
    let reader_thread = thread::spawn(move || {
        let mut reader = reader;
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            reader.refresh();
            if reader.get("mid") == Some(100.0) {
                assert_eq!(reader.get("spread"), Some(1.0));
                break reader;
            }
            assert!(Instant::now() < deadline, "snapshot never showed the pass");
            thread::sleep(Duration::from_millis(1));
        }
    });
    reader = reader_thread.join().unwrap();

    producer.send_scalar_flush(bid, 99.0).unwrap();
    wait_until("the follow-up pass to publish", || {
        reader.refresh();
        reader.get("mid") == Some(99.75)
    });
    assert_eq!(reader.get("spread"), Some(1.5));

    assert!(core.is_healthy());
    assert!(core.is_live().is_ok());
    assert!(core.try_error().is_none());
    let latency = core.latency().unwrap().stats();
    assert!(latency.count >= 1);
    assert!(latency.max_ns >= latency.min_ns);
    let profiler = core.profiler().unwrap();
    let dump = profiler.dump();
    assert!(dump.contains("mid"), "profile dump missing mid:\n{dump}");

    let engine = core.shutdown().unwrap();
    assert_eq!(engine.scalar("mid").unwrap(), 99.75);
    assert_eq!(engine.scalar("spread").unwrap(), 1.5);
    assert_eq!(engine.scalar("ask").unwrap(), 100.5);
}

#[test]
fn launch_rejects_unknown_snapshot_nodes() {
    let engine = quote_engine();
    let config = Config {
        snapshot_nodes: vec!["vwap".to_owned()],
        ..Config::default()
    };
    let error = Core::launch(engine, config, None).err().unwrap();
    assert!(error.contains("vwap"), "unexpected error: {error}");
}

#[test]
fn launch_rejects_invalid_ring_capacity() {
    let engine = quote_engine();
    let config = Config {
        ring_capacity: 63,
        ..Config::default()
    };
    assert!(Core::launch(engine, config, None).is_err());
}

#[test]
fn engine_unhealth_is_visible_through_the_core() {
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
    let a = engine.topology().topo_index("a").unwrap() as u32;

    let mut core = Core::launch(engine, Config::default(), None).unwrap();
    let mut producer = core.producer().unwrap();
    assert!(core.is_healthy());

    producer.send_scalar_flush(a, 100.0).unwrap();
    let mut surfaced = None;
    wait_until("the stabilization failure to surface", || {
        if surfaced.is_none() {
            surfaced = core.try_error();
        }
        surfaced.is_some()
    });
    assert!(matches!(
        surfaced,
        Some(GraphError::StabilizationFailed { .. })
    ));
    assert!(!core.is_healthy());
    assert!(core.is_live().is_ok(), "the consumer must survive the failure");
    core.shutdown().unwrap();
}

#[test]
fn state_images_round_trip_through_json() {
    let mut engine = quote_engine();
    let bid = engine.topology().topo_index("bid").unwrap();
    let ask = engine.topology().topo_index("ask").unwrap();
    engine.update_scalar(bid, 99.5).unwrap();
    engine.update_scalar(ask, 100.5).unwrap();
    engine.mark_dirty(bid).unwrap();
    engine.mark_dirty(ask).unwrap();
    engine.stabilize().unwrap();

    let image = capture_state(&engine);
    assert_eq!(image.node_count(), 4);
    let json = state_to_json(&image).unwrap();
    let decoded = state_from_json(&json).unwrap();
    assert_eq!(decoded, image);

    // Perturb, then restore the captured values.
    engine.update_scalar(bid, 42.0).unwrap();
    engine.mark_dirty(bid).unwrap();
    engine.stabilize().unwrap();
    restore_state(&mut engine, &decoded).unwrap();
    assert_eq!(engine.scalar("bid").unwrap(), 99.5);
    assert_eq!(engine.scalar("mid").unwrap(), 100.0);
}

#[test]
fn identical_builds_share_a_fingerprint() {
    let first = Topology::compile(quote_builder()).unwrap();
    let second = Topology::compile(quote_builder()).unwrap();
    assert_eq!(topology_fingerprint(&first), topology_fingerprint(&second));
}

#[test]
fn restore_rejects_a_different_topology() {
    let mut engine = quote_engine();
    let image = capture_state(&engine);

    // Same node names, different wiring: the fingerprint must differ.
    let mut builder = GraphBuilder::new();
    builder.add_scalar_source("bid", Cutoff::Exact).unwrap();
    builder.add_scalar_source("ask", Cutoff::Exact).unwrap();
    builder
        .add_scalar_derived("mid", &["bid"], Cutoff::Exact, |inputs: &[f64]| inputs[0])
        .unwrap();
    builder
        .add_scalar_derived("spread", &["ask"], Cutoff::Exact, |inputs: &[f64]| inputs[0])
        .unwrap();
    let mut other = Engine::new(Topology::compile(builder).unwrap());
    assert_ne!(
        topology_fingerprint(engine.topology()),
        topology_fingerprint(other.topology())
    );
    assert!(matches!(
        restore_state(&mut other, &image),
        Err(StateError::IncompatibleSnapshot(_))
    ));

    // And the image still restores cleanly against its own topology.
    restore_state(&mut engine, &image).unwrap();
}
