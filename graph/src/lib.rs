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

mod dirty;
mod entry;
mod node;
mod topology;

pub use crate::dirty::DirtySet;
pub use crate::entry::{Inputs, NodeState};
pub use crate::node::{
    BoolOperator, Cutoff, KeyedOperator, KeyedWriter, NodeKind, ScalarOperator, VectorOperator,
};
pub use crate::topology::{GraphBuilder, NodeHandle, Topology};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use observe::{duration_ns_since, CompositeListener, PassListener, RateLimitedReporter};
use thiserror::Error;

use crate::entry::Entry;


///
/// Everything that can go wrong building or running a graph.
///
/// Build-time kinds are fatal to compilation. Write-validation kinds surface to the caller of
/// the write and leave all state untouched. `StabilizationFailed` wraps the first operator
/// failure trapped in a pass; `EngineUnhealthy` rejects every pass after a failed one until
/// `reset_health` is called.
///
#[derive(Clone, Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("Duplicate node name: {0}")]
    DuplicateName(String),
    #[error("Unknown node: {0}")]
    UnknownNode(String),
    #[error("Self-edge on node: {0}")]
    SelfEdge(String),
    #[error("Cycle detected involving {count} nodes (sample: {sample:?})")]
    CycleDetected { count: usize, sample: Vec<String> },
    #[error("Non-finite value {value} written to node {node}")]
    InvalidInput { node: String, value: f64 },
    #[error("Shape mismatch for node {node}: expected {expected} values, got {actual}")]
    ShapeMismatch {
        node: String,
        expected: usize,
        actual: usize,
    },
    #[error("Index {index} out of bounds for node {node} (length {len})")]
    IndexOutOfBounds {
        node: String,
        index: usize,
        len: usize,
    },
    #[error("Node {node} is not a {expected}")]
    KindMismatch {
        node: String,
        expected: &'static str,
    },
    #[error("Stabilization failed at node {node}: {cause}")]
    StabilizationFailed { node: String, cause: String },
    #[error("Engine is unhealthy; reset_health() is required before further passes")]
    EngineUnhealthy,
}

///
/// Executes stabilization passes over a compiled topology.
///
/// The engine is single-threaded: one thread owns all mutation of node state, the dirty set,
/// the epoch counter, and the health flag. The `&mut` receiver on `stabilize` makes concurrent
/// passes unrepresentable in safe code. The health flag alone is shared (an atomic), so foreign
/// threads can run liveness checks without touching node state.
///
pub struct Engine {
    topology: Topology,
    entries: Vec<Entry>,
    dirty: DirtySet,
    epoch: u64,
    healthy: Arc<AtomicBool>,
    listener: Arc<CompositeListener>,
    reporter: Arc<RateLimitedReporter>,
}

const DEFAULT_ERROR_RATE_LIMIT: Duration = Duration::from_millis(1000);

impl Engine {
    ///
    /// Builds an engine over the compiled topology. All source bits start dirty, so the first
    /// pass initializes the whole graph.
    ///
    pub fn new(mut topology: Topology) -> Engine {
        let entries: Vec<Entry> = topology
            .take_seeds()
            .into_iter()
            .map(Entry::from_seed)
            .collect();
        let mut dirty = DirtySet::new(entries.len());
        for source in topology.source_indices() {
            dirty.insert(source);
        }
        log::debug!(
            "Engine created: {} nodes, {} edges, {} sources",
            topology.node_count(),
            topology.edge_count(),
            dirty.count_ones()
        );
        Engine {
            topology,
            entries,
            dirty,
            epoch: 0,
            healthy: Arc::new(AtomicBool::new(true)),
            listener: Arc::new(CompositeListener::new()),
            reporter: Arc::new(RateLimitedReporter::new(DEFAULT_ERROR_RATE_LIMIT)),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Readable from any thread via `health_handle`; uses acquire ordering so foreign readers
    /// observe the store made at the end of a failed pass.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// A shared handle to the health flag, for liveness checks from foreign threads.
    pub fn health_handle(&self) -> Arc<AtomicBool> {
        self.healthy.clone()
    }

    ///
    /// Re-arms an unhealthy engine. The operator is assumed to have ensured that the underlying
    /// fault is fixed; the reset is logged for audit.
    ///
    pub fn reset_health(&mut self) {
        self.healthy.store(true, Ordering::Release);
        log::info!("Engine health reset at epoch {}", self.epoch);
    }

    /// Appends a listener to the engine's composite. Registration is additive: installed
    /// listeners are never silently replaced.
    pub fn add_listener(&self, listener: Arc<dyn PassListener>) {
        self.listener.add(listener);
    }

    /// Replaces the entire composite. Intended for wiring at startup; prefer `add_listener`.
    pub fn set_listener(&mut self, listener: Arc<CompositeListener>) {
        self.listener = listener;
    }

    /// Replaces the rate-limited reporter consulted when a trapped operator failure occurs.
    pub fn set_error_reporter(&mut self, reporter: Arc<RateLimitedReporter>) {
        self.reporter = reporter;
    }

    pub fn error_reporter(&self) -> &Arc<RateLimitedReporter> {
        &self.reporter
    }

    pub fn mark_dirty(&mut self, topo_index: usize) -> Result<(), GraphError> {
        if topo_index >= self.entries.len() {
            return Err(GraphError::IndexOutOfBounds {
                node: "<topology>".to_owned(),
                index: topo_index,
                len: self.entries.len(),
            });
        }
        self.dirty.insert(topo_index);
        Ok(())
    }

    pub fn mark_dirty_by_name(&mut self, name: &str) -> Result<(), GraphError> {
        let topo_index = self.topology.topo_index(name)?;
        self.dirty.insert(topo_index);
        Ok(())
    }

    pub fn is_dirty(&self, topo_index: usize) -> bool {
        self.dirty.contains(topo_index)
    }

    ///
    /// Runs one stabilization pass: walks the topological order, recomputes dirty nodes, and
    /// propagates dirtiness to the children of every node whose cutoff reported a change.
    /// Returns the number of nodes stabilized.
    ///
    /// A trapped operator failure does not stop the pass (unrelated subtrees still advance),
    /// but it marks the pass failed: the engine flips unhealthy at end-of-pass and surfaces the
    /// first trapped error as `StabilizationFailed`. Subsequent calls are rejected with
    /// `EngineUnhealthy` until `reset_health`.
    ///
    pub fn stabilize(&mut self) -> Result<usize, GraphError> {
        if !self.is_healthy() {
            return Err(GraphError::EngineUnhealthy);
        }
        self.epoch += 1;
        let epoch = self.epoch;
        let mut nodes_stabilized = 0_usize;
        let mut first_error: Option<GraphError> = None;
        self.listener.on_pass_start(epoch);

        // Parents precede children in topological order, so a child dirtied here is always at a
        // higher index than the cursor and is visited later in the same pass.
        let mut cursor = 0_usize;
        while let Some(topo_index) = self.dirty.next_set_bit(cursor) {
            self.dirty.remove(topo_index);
            cursor = topo_index + 1;

            let started = Instant::now();
            let (parents, rest) = self.entries.split_at_mut(topo_index);
            let stabilized = rest[0].stabilize(parents);
            match stabilized {
                Ok(changed) => {
                    nodes_stabilized += 1;
                    self.listener.on_node_stabilized(
                        epoch,
                        topo_index,
                        self.topology.name(topo_index),
                        changed,
                        duration_ns_since(started),
                    );
                    if changed {
                        let (start, end) = self.topology.children_range(topo_index);
                        for flat in start..end {
                            self.dirty.insert(self.topology.child_at(flat));
                        }
                    }
                }
                Err(cause) => {
                    let name = self.topology.name(topo_index);
                    self.reporter
                        .report(&format!("Operator for node {name} failed"), &cause);
                    self.listener.on_node_error(epoch, topo_index, name, &cause);
                    if first_error.is_none() {
                        first_error = Some(GraphError::StabilizationFailed {
                            node: name.to_owned(),
                            cause,
                        });
                    }
                }
            }
        }

        self.listener.on_pass_end(epoch, nodes_stabilized);
        if let Some(error) = first_error {
            self.healthy.store(false, Ordering::Release);
            log::warn!("Engine unhealthy after pass {epoch}: {error}");
            return Err(error);
        }
        Ok(nodes_stabilized)
    }

    // Source writes. Writes validate and store, but never set dirty bits: dirtying is the
    // caller's (or the ingestion bridge's) explicit step.

    pub fn update_scalar(&mut self, topo_index: usize, value: f64) -> Result<(), GraphError> {
        self.check_bounds(topo_index)?;
        if !value.is_finite() {
            return Err(GraphError::InvalidInput {
                node: self.topology.name(topo_index).to_owned(),
                value,
            });
        }
        match &mut self.entries[topo_index] {
            Entry::ScalarSource(source) => {
                source.value = value;
                Ok(())
            }
            _ => Err(GraphError::KindMismatch {
                node: self.topology.name(topo_index).to_owned(),
                expected: "scalar source",
            }),
        }
    }

    /// Whole-array write: copies `values` into the node's internal buffer (never aliases the
    /// caller's slice).
    pub fn update_vector(&mut self, topo_index: usize, values: &[f64]) -> Result<(), GraphError> {
        self.check_bounds(topo_index)?;
        if let Some(bad) = values.iter().copied().find(|value| !value.is_finite()) {
            return Err(GraphError::InvalidInput {
                node: self.topology.name(topo_index).to_owned(),
                value: bad,
            });
        }
        match &mut self.entries[topo_index] {
            Entry::VectorSource(source) => {
                if values.len() != source.values.len() {
                    return Err(GraphError::ShapeMismatch {
                        node: self.topology.name(topo_index).to_owned(),
                        expected: source.values.len(),
                        actual: values.len(),
                    });
                }
                source.values.copy_from_slice(values);
                Ok(())
            }
            _ => Err(GraphError::KindMismatch {
                node: self.topology.name(topo_index).to_owned(),
                expected: "vector source",
            }),
        }
    }

    pub fn update_vector_at(
        &mut self,
        topo_index: usize,
        vec_index: usize,
        value: f64,
    ) -> Result<(), GraphError> {
        self.check_bounds(topo_index)?;
        if !value.is_finite() {
            return Err(GraphError::InvalidInput {
                node: self.topology.name(topo_index).to_owned(),
                value,
            });
        }
        match &mut self.entries[topo_index] {
            Entry::VectorSource(source) => {
                if vec_index >= source.values.len() {
                    return Err(GraphError::IndexOutOfBounds {
                        node: self.topology.name(topo_index).to_owned(),
                        index: vec_index,
                        len: source.values.len(),
                    });
                }
                source.values[vec_index] = value;
                Ok(())
            }
            _ => Err(GraphError::KindMismatch {
                node: self.topology.name(topo_index).to_owned(),
                expected: "vector source",
            }),
        }
    }

    // Value read-out.

    pub fn scalar(&self, name: &str) -> Result<f64, GraphError> {
        self.scalar_at(self.topology.topo_index(name)?)
    }

    pub fn scalar_at(&self, topo_index: usize) -> Result<f64, GraphError> {
        self.check_bounds(topo_index)?;
        match &self.entries[topo_index] {
            Entry::VectorSource(_) | Entry::VectorDerived(_) | Entry::KeyedMap(_) => {
                Err(GraphError::KindMismatch {
                    node: self.topology.name(topo_index).to_owned(),
                    expected: "scalar-presenting node",
                })
            }
            entry => Ok(entry.scalar_value()),
        }
    }

    pub fn vector(&self, name: &str) -> Result<&[f64], GraphError> {
        self.vector_at(self.topology.topo_index(name)?)
    }

    pub fn vector_at(&self, topo_index: usize) -> Result<&[f64], GraphError> {
        self.check_bounds(topo_index)?;
        self.entries[topo_index]
            .vector_value()
            .ok_or_else(|| GraphError::KindMismatch {
                node: self.topology.name(topo_index).to_owned(),
                expected: "vector node",
            })
    }

    pub fn boolean(&self, name: &str) -> Result<bool, GraphError> {
        let topo_index = self.topology.topo_index(name)?;
        self.entries[topo_index]
            .bool_value()
            .ok_or_else(|| GraphError::KindMismatch {
                node: self.topology.name(topo_index).to_owned(),
                expected: "boolean node",
            })
    }

    pub fn keyed(&self, name: &str, key: &str) -> Result<f64, GraphError> {
        let topo_index = self.topology.topo_index(name)?;
        match &self.entries[topo_index] {
            Entry::KeyedMap(_) => self.entries[topo_index]
                .keyed_get(key)
                .ok_or_else(|| GraphError::UnknownNode(key.to_owned())),
            _ => Err(GraphError::KindMismatch {
                node: self.topology.name(topo_index).to_owned(),
                expected: "keyed map",
            }),
        }
    }

    pub fn keyed_keys(&self, name: &str) -> Result<&[String], GraphError> {
        let topo_index = self.topology.topo_index(name)?;
        self.entries[topo_index]
            .keys()
            .ok_or_else(|| GraphError::KindMismatch {
                node: self.topology.name(topo_index).to_owned(),
                expected: "keyed map",
            })
    }

    ///
    /// The scalar presentation of a node without kind checking: NaN for vector-shaped kinds or
    /// out-of-range indices. This is the snapshot writer's hot-path read.
    ///
    pub fn published_value(&self, topo_index: usize) -> f64 {
        self.entries
            .get(topo_index)
            .map(Entry::scalar_value)
            .unwrap_or(f64::NAN)
    }

    // Persisted-state extension.

    /// Captures every node's value state, in topological order.
    pub fn capture_state(&self) -> Vec<NodeState> {
        self.entries.iter().map(Entry::capture).collect()
    }

    ///
    /// Restores a previously captured state. The caller is responsible for verifying that the
    /// image was captured from an identical topology (see the root crate's fingerprinting);
    /// this method still validates per-node shapes.
    ///
    pub fn restore_state(&mut self, states: &[NodeState]) -> Result<(), GraphError> {
        if states.len() != self.entries.len() {
            return Err(GraphError::ShapeMismatch {
                node: "<state image>".to_owned(),
                expected: self.entries.len(),
                actual: states.len(),
            });
        }
        for (topo_index, (entry, state)) in
            self.entries.iter_mut().zip(states.iter()).enumerate()
        {
            entry
                .restore(state)
                .map_err(|expected| GraphError::ShapeMismatch {
                    node: self.topology.name(topo_index).to_owned(),
                    expected,
                    actual: state.current.len(),
                })?;
        }
        Ok(())
    }

    fn check_bounds(&self, topo_index: usize) -> Result<(), GraphError> {
        if topo_index >= self.entries.len() {
            return Err(GraphError::IndexOutOfBounds {
                node: "<topology>".to_owned(),
                index: topo_index,
                len: self.entries.len(),
            });
        }
        Ok(())
    }
}
