// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Optional persisted state: capture and restore of per-node values.
//!
//! Nothing is persisted by default. An image embeds a fingerprint of the topology it was
//! captured from (the ordered name list, the edge list, and per-node kind/size); restoring
//! against any other topology is rejected, because node state is only meaningful against the
//! exact compiled shape.

use graph::{Engine, NodeKind, Topology};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("State image is incompatible with this topology: {0}")]
    IncompatibleSnapshot(String),
    #[error(transparent)]
    Graph(#[from] graph::GraphError),
    #[error("State image could not be (de)serialized: {0}")]
    Serde(String),
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
struct NodeStateImage {
    current: Vec<f64>,
    previous: Vec<f64>,
    initialized: bool,
}

///
/// A captured image of every node's value state, bound to a topology fingerprint.
///
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StateImage {
    fingerprint: String,
    nodes: Vec<NodeStateImage>,
}

impl StateImage {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

///
/// A hex SHA-256 over the ordered names, per-node kind and size, and the CSR edge list.
///
pub fn topology_fingerprint(topology: &Topology) -> String {
    let mut hasher = Sha256::new();
    for topo_index in 0..topology.node_count() {
        hasher.update(topology.name(topo_index).as_bytes());
        hasher.update([0_u8]);
        let kind = topology.kind(topo_index);
        hasher.update(kind.as_str().as_bytes());
        let size = match kind {
            NodeKind::VectorSource { size }
            | NodeKind::VectorDerived { size }
            | NodeKind::KeyedMap { size } => size as u64,
            _ => 1,
        };
        hasher.update(size.to_le_bytes());
        for &child in topology.children(topo_index) {
            hasher.update(child.to_le_bytes());
        }
        hasher.update([0xff_u8]);
    }
    hex::encode(hasher.finalize())
}

pub fn capture_state(engine: &Engine) -> StateImage {
    let nodes = engine
        .capture_state()
        .into_iter()
        .map(|node| NodeStateImage {
            current: node.current,
            previous: node.previous,
            initialized: node.initialized,
        })
        .collect();
    StateImage {
        fingerprint: topology_fingerprint(engine.topology()),
        nodes,
    }
}

///
/// Restores an image captured from an identical topology. A fingerprint mismatch fails with
/// `IncompatibleSnapshot` before any node state is touched.
///
pub fn restore_state(engine: &mut Engine, image: &StateImage) -> Result<(), StateError> {
    let fingerprint = topology_fingerprint(engine.topology());
    if fingerprint != image.fingerprint {
        return Err(StateError::IncompatibleSnapshot(format!(
            "expected fingerprint {fingerprint}, image was captured from {}",
            image.fingerprint
        )));
    }
    let states: Vec<graph::NodeState> = image
        .nodes
        .iter()
        .map(|node| graph::NodeState {
            current: node.current.clone(),
            previous: node.previous.clone(),
            initialized: node.initialized,
        })
        .collect();
    engine.restore_state(&states)?;
    Ok(())
}

pub fn state_to_json(image: &StateImage) -> Result<String, StateError> {
    serde_json::to_string(image).map_err(|error| StateError::Serde(error.to_string()))
}

pub fn state_from_json(json: &str) -> Result<StateImage, StateError> {
    serde_json::from_str(json).map_err(|error| StateError::Serde(error.to_string()))
}
