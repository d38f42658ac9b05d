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

//! An incremental reactive computation engine for DAGs of numeric nodes, tuned for low-latency
//! pricing.
//!
//! Source nodes receive external updates (directly or through the ingestion ring); derived
//! nodes recompute from their inputs. Each stabilization pass walks the compiled topology in
//! topological order, recomputing only the nodes whose inputs changed enough to matter and
//! cutting propagation off wherever a node's change-detection predicate reports "unchanged".
//!
//! This crate assembles the member crates into a running core: configuration, the consumer
//! thread, snapshot publication, and observability wiring. See `graph` for the engine proper.

mod state;

#[cfg(test)]
mod tests;

pub use graph::{
    BoolOperator, Cutoff, Engine, GraphBuilder, GraphError, Inputs, KeyedOperator, KeyedWriter,
    NodeHandle, NodeKind, NodeState, ScalarOperator, Topology, VectorOperator,
};
pub use ingest::{
    BridgeConfig, BridgeStats, IngestBridge, UpdateEvent, UpdateProducer, WaitStrategy,
    SCALAR_UPDATE,
};
pub use observe::{
    CompositeListener, LatencyAggregator, LatencyStats, LoggingListener, NodeProfiler,
    PassListener, ProfileSlot, RateLimitedReporter,
};
pub use snapshot::{SnapshotHub, SnapshotReader};

pub use crate::state::{
    capture_state, restore_state, state_from_json, state_to_json, topology_fingerprint,
    StateError, StateImage,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Observability attachments, enumerated so they can be named in configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListenerConfig {
    /// Whole-pass latency aggregation (min/avg/max and percentiles).
    Latency,
    /// The per-node stabilization profile table.
    NodeProfile,
    /// Pass summaries and node errors through the `log` facade.
    Logging,
}

///
/// Configuration for a running core.
///
#[derive(Clone, Debug)]
pub struct Config {
    /// Ring size in events. Must be a power of two and at least 64.
    pub ring_capacity: usize,
    pub wait_strategy: WaitStrategy,
    /// Coalesce bursts into one pass per batch (the default) or run one pass per event.
    pub batch_coalescing: bool,
    /// Minimum interval between logged operator failures.
    pub error_rate_limit_ms: u64,
    /// Names published through the snapshot substrate. Empty disables publication.
    pub snapshot_nodes: Vec<String>,
    pub listeners: Vec<ListenerConfig>,
    /// How long shutdown may spend draining pending events.
    pub drain_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            ring_capacity: 1024,
            wait_strategy: WaitStrategy::Block,
            batch_coalescing: true,
            error_rate_limit_ms: 1000,
            snapshot_nodes: Vec::new(),
            listeners: Vec::new(),
            drain_timeout_ms: 500,
        }
    }
}

/// A user callback run on the consumer thread after each successful pass.
pub type PassCallback = Box<dyn FnMut(u64, usize) + Send>;

///
/// A fully wired core: the engine running behind its ingestion ring, with snapshot publication
/// and the configured observers attached.
///
/// Producers feed the ring through the handle from `producer()`; dashboards read values through
/// the reader from `snapshot_reader()` and check `is_healthy()`/`is_live()` without touching
/// the engine thread.
///
pub struct Core {
    bridge: IngestBridge,
    producer: Option<UpdateProducer>,
    reader: Option<SnapshotReader>,
    latency: Option<Arc<LatencyAggregator>>,
    profiler: Option<Arc<NodeProfiler>>,
    health: Arc<AtomicBool>,
    stats: Arc<BridgeStats>,
}

impl Core {
    ///
    /// Wires listeners, the snapshot scope, and the error reporter into `engine`, then spawns
    /// the ingestion consumer around it.
    ///
    pub fn launch(
        mut engine: Engine,
        config: Config,
        callback: Option<PassCallback>,
    ) -> Result<Core, String> {
        engine.set_error_reporter(Arc::new(RateLimitedReporter::new(Duration::from_millis(
            config.error_rate_limit_ms,
        ))));

        let mut latency = None;
        let mut profiler = None;
        for listener in &config.listeners {
            match listener {
                ListenerConfig::Latency => {
                    let aggregator = Arc::new(LatencyAggregator::new());
                    engine.add_listener(aggregator.clone());
                    latency = Some(aggregator);
                }
                ListenerConfig::NodeProfile => {
                    let topology = engine.topology();
                    let names = (0..topology.node_count())
                        .map(|topo_index| topology.name(topo_index).to_owned())
                        .collect();
                    let table = Arc::new(NodeProfiler::new(names));
                    engine.add_listener(table.clone());
                    profiler = Some(table);
                }
                ListenerConfig::Logging => engine.add_listener(Arc::new(LoggingListener)),
            }
        }

        let mut reader = None;
        let mut hub = None;
        if !config.snapshot_nodes.is_empty() {
            let mut watched = Vec::with_capacity(config.snapshot_nodes.len());
            for name in &config.snapshot_nodes {
                let topo_index = engine
                    .topology()
                    .topo_index(name)
                    .map_err(|error| format!("Invalid snapshot_nodes entry: {error}"))?;
                watched.push((name.clone(), topo_index));
            }
            let mut snapshot_hub = SnapshotHub::new();
            reader = Some(snapshot_hub.add_scope(watched));
            hub = Some(snapshot_hub);
        }

        let health = engine.health_handle();
        let mut callback = callback;
        let post_stabilize: Option<ingest::PostStabilize> =
            if hub.is_some() || callback.is_some() {
                let mut hub = hub;
                Some(Box::new(move |engine: &Engine, epoch, nodes_stabilized| {
                    if let Some(hub) = hub.as_mut() {
                        hub.publish(|topo_index| engine.published_value(topo_index));
                    }
                    if let Some(callback) = callback.as_mut() {
                        callback(epoch, nodes_stabilized);
                    }
                }))
            } else {
                None
            };

        let bridge_config = BridgeConfig {
            ring_capacity: config.ring_capacity,
            wait_strategy: config.wait_strategy,
            batch_coalescing: config.batch_coalescing,
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
        };
        let (bridge, producer) = IngestBridge::spawn(engine, bridge_config, post_stabilize)?;
        let stats = bridge.stats();
        log::info!(
            "Core launched: ring_capacity={}, wait_strategy={:?}, {} snapshot node(s)",
            config.ring_capacity,
            config.wait_strategy,
            config.snapshot_nodes.len()
        );
        Ok(Core {
            bridge,
            producer: Some(producer),
            reader,
            latency,
            profiler,
            health,
            stats,
        })
    }

    /// The sole producer handle. Yields `None` after the first call.
    pub fn producer(&mut self) -> Option<UpdateProducer> {
        self.producer.take()
    }

    /// The snapshot reader over `snapshot_nodes`, if any were configured. Yields `None` after
    /// the first call; the reader may be moved to any thread.
    pub fn snapshot_reader(&mut self) -> Option<SnapshotReader> {
        self.reader.take()
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        self.stats.clone()
    }

    pub fn latency(&self) -> Option<&Arc<LatencyAggregator>> {
        self.latency.as_ref()
    }

    pub fn profiler(&self) -> Option<&Arc<NodeProfiler>> {
        self.profiler.as_ref()
    }

    /// The engine's health flag, readable without touching the engine thread.
    pub fn is_healthy(&self) -> bool {
        self.health.load(Ordering::Acquire)
    }

    /// Whether the consumer thread is still running; an `Err` carries its exit reason.
    pub fn is_live(&self) -> Result<(), String> {
        self.bridge.is_live()
    }

    /// Non-blocking poll for a surfaced stabilization failure.
    pub fn try_error(&self) -> Option<GraphError> {
        self.bridge.try_error()
    }

    /// Drains the ring (bounded by the configured deadline) and returns the engine.
    pub fn shutdown(self) -> Result<Engine, String> {
        self.bridge.shutdown()
    }
}
