// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::mem;

use fixedbitset::FixedBitSet;
use fnv::{FnvHashMap, FnvHashSet};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use smallvec::SmallVec;

use crate::entry::EntrySeed;
use crate::node::{BoolOperator, Cutoff, KeyedOperator, NodeKind, ScalarOperator, VectorOperator};
use crate::GraphError;

/// How many cycle-participating names to include in a `CycleDetected` error.
const CYCLE_SAMPLE_LIMIT: usize = 5;

enum OperatorSpec {
    None,
    Scalar(Box<dyn ScalarOperator>),
    Bool(Box<dyn BoolOperator>),
    Vector(Box<dyn VectorOperator>),
    Keyed(Box<dyn KeyedOperator>),
}

struct NodeSpec {
    name: String,
    kind: NodeKind,
    // Input names in operator position order. For selectors: condition, if-true, if-false.
    inputs: Vec<String>,
    cutoff: Cutoff,
    tolerance: f64,
    initial: f64,
    element: usize,
    keys: Vec<String>,
    operator: OperatorSpec,
}

impl NodeSpec {
    fn leaf(name: &str, kind: NodeKind) -> NodeSpec {
        NodeSpec {
            name: name.to_owned(),
            kind,
            inputs: Vec::new(),
            cutoff: Cutoff::Exact,
            tolerance: 0.0,
            initial: 0.0,
            element: 0,
            keys: Vec::new(),
            operator: OperatorSpec::None,
        }
    }
}

///
/// Accumulates nodes and edges ahead of compilation.
///
/// Names must be unique; self-edges are rejected at insertion. Inputs may reference nodes that
/// have not been declared yet: name resolution happens at compile time, where dangling
/// references fail with `UnknownNode`.
///
pub struct GraphBuilder {
    pg: DiGraph<NodeSpec, ()>,
    names: FnvHashMap<String, NodeIndex>,
    // Explicit ordering edges, beyond the data edges implied by input lists.
    extra_edges: Vec<(String, String)>,
}

impl GraphBuilder {
    pub fn new() -> GraphBuilder {
        GraphBuilder {
            pg: DiGraph::new(),
            names: FnvHashMap::default(),
            extra_edges: Vec::new(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.pg.node_count()
    }

    /// A scalar source: externally written, no inputs.
    pub fn add_scalar_source(&mut self, name: &str, cutoff: Cutoff) -> Result<(), GraphError> {
        let mut spec = NodeSpec::leaf(name, NodeKind::ScalarSource);
        spec.cutoff = cutoff;
        self.insert(spec)
    }

    /// A scalar derived from `inputs` via `operator`, with change detection by `cutoff`.
    pub fn add_scalar_derived(
        &mut self,
        name: &str,
        inputs: &[&str],
        cutoff: Cutoff,
        operator: impl ScalarOperator + 'static,
    ) -> Result<(), GraphError> {
        let mut spec = NodeSpec::leaf(name, NodeKind::ScalarDerived);
        spec.inputs = inputs.iter().map(|&input| input.to_owned()).collect();
        spec.cutoff = cutoff;
        spec.operator = OperatorSpec::Scalar(Box::new(operator));
        self.insert(spec)
    }

    /// A boolean predicate over one scalar input; change detection by bit equality.
    pub fn add_boolean(
        &mut self,
        name: &str,
        input: &str,
        operator: impl BoolOperator + 'static,
    ) -> Result<(), GraphError> {
        let mut spec = NodeSpec::leaf(name, NodeKind::Boolean);
        spec.inputs = vec![input.to_owned()];
        spec.operator = OperatorSpec::Bool(Box::new(operator));
        self.insert(spec)
    }

    /// Picks one of two scalar inputs based on a boolean input; exact cutoff.
    pub fn add_selector(
        &mut self,
        name: &str,
        condition: &str,
        if_true: &str,
        if_false: &str,
    ) -> Result<(), GraphError> {
        let mut spec = NodeSpec::leaf(name, NodeKind::Selector);
        spec.inputs = vec![condition.to_owned(), if_true.to_owned(), if_false.to_owned()];
        self.insert(spec)
    }

    /// A fixed-length vector source, filled with `initial`; element-wise absolute tolerance.
    pub fn add_vector_source(
        &mut self,
        name: &str,
        size: usize,
        initial: f64,
        tolerance: f64,
    ) -> Result<(), GraphError> {
        let mut spec = NodeSpec::leaf(name, NodeKind::VectorSource { size });
        spec.initial = initial;
        spec.tolerance = tolerance;
        self.insert(spec)
    }

    /// A fixed-length vector recomputed into a pre-allocated buffer.
    pub fn add_vector_derived(
        &mut self,
        name: &str,
        inputs: &[&str],
        size: usize,
        tolerance: f64,
        operator: impl VectorOperator + 'static,
    ) -> Result<(), GraphError> {
        let mut spec = NodeSpec::leaf(name, NodeKind::VectorDerived { size });
        spec.inputs = inputs.iter().map(|&input| input.to_owned()).collect();
        spec.tolerance = tolerance;
        spec.operator = OperatorSpec::Vector(Box::new(operator));
        self.insert(spec)
    }

    /// Extracts one index of a vector node, presenting as a scalar.
    pub fn add_vector_element(
        &mut self,
        name: &str,
        vector: &str,
        element: usize,
        cutoff: Cutoff,
    ) -> Result<(), GraphError> {
        let mut spec = NodeSpec::leaf(name, NodeKind::VectorElement);
        spec.inputs = vec![vector.to_owned()];
        spec.element = element;
        spec.cutoff = cutoff;
        self.insert(spec)
    }

    /// A fixed, ordered set of string keys with parallel `f64` values, recomputed via an
    /// ordinal-based writer.
    pub fn add_keyed_map(
        &mut self,
        name: &str,
        inputs: &[&str],
        keys: &[&str],
        tolerance: f64,
        operator: impl KeyedOperator + 'static,
    ) -> Result<(), GraphError> {
        let mut seen: FnvHashSet<&str> = FnvHashSet::default();
        for &key in keys {
            if !seen.insert(key) {
                return Err(GraphError::DuplicateName(key.to_owned()));
            }
        }
        let mut spec = NodeSpec::leaf(name, NodeKind::KeyedMap { size: keys.len() });
        spec.inputs = inputs.iter().map(|&input| input.to_owned()).collect();
        spec.keys = keys.iter().map(|&key| key.to_owned()).collect();
        spec.tolerance = tolerance;
        spec.operator = OperatorSpec::Keyed(Box::new(operator));
        self.insert(spec)
    }

    /// An explicit ordering edge, in addition to the data edges implied by input lists.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        if from == to {
            return Err(GraphError::SelfEdge(from.to_owned()));
        }
        self.extra_edges.push((from.to_owned(), to.to_owned()));
        Ok(())
    }

    fn insert(&mut self, spec: NodeSpec) -> Result<(), GraphError> {
        if self.names.contains_key(&spec.name) {
            return Err(GraphError::DuplicateName(spec.name));
        }
        if spec.inputs.iter().any(|input| input == &spec.name) {
            return Err(GraphError::SelfEdge(spec.name));
        }
        let name = spec.name.clone();
        let id = self.pg.add_node(spec);
        self.names.insert(name, id);
        Ok(())
    }
}

///
/// A node handle: the stable name plus the build-time kind.
///
#[derive(Clone, Copy, Debug)]
pub struct NodeHandle<'a> {
    pub name: &'a str,
    pub kind: NodeKind,
}

///
/// The immutable, compiled form of the DAG.
///
/// Children are stored in CSR form: `child_offsets[i]..child_offsets[i + 1]` is the range of
/// `child_indices` holding node `i`'s children, all in topological index space. For every edge
/// `u -> v`, `topo_index(u) < topo_index(v)`.
///
pub struct Topology {
    names: Vec<String>,
    kinds: Vec<NodeKind>,
    child_offsets: Vec<u32>,
    child_indices: Vec<u32>,
    parent_counts: Vec<u32>,
    source_bits: FixedBitSet,
    name_to_index: FnvHashMap<String, usize>,
    // Consumed by Engine::new; empty thereafter.
    seeds: Vec<EntrySeed>,
}

impl Topology {
    ///
    /// Compiles the builder's accumulated nodes and edges via Kahn's algorithm.
    ///
    /// Ties between simultaneously ready nodes are broken by insertion order, so compilation is
    /// deterministic for a given build sequence. Fails with `CycleDetected` if any node cannot
    /// be ordered.
    ///
    pub fn compile(builder: GraphBuilder) -> Result<Topology, GraphError> {
        let GraphBuilder {
            mut pg,
            names,
            extra_edges,
        } = builder;
        let node_count = pg.node_count();

        // Resolve data edges (from input lists) and explicit edges into the builder graph,
        // deduplicating so that an input used twice contributes one edge.
        let mut edge_set: FnvHashSet<(usize, usize)> = FnvHashSet::default();
        let mut resolved_edges: Vec<(NodeIndex, NodeIndex)> = Vec::new();
        for node_index in pg.node_indices() {
            for input_name in &pg[node_index].inputs {
                let &parent = names
                    .get(input_name)
                    .ok_or_else(|| GraphError::UnknownNode(input_name.clone()))?;
                if parent == node_index {
                    return Err(GraphError::SelfEdge(input_name.clone()));
                }
                if edge_set.insert((parent.index(), node_index.index())) {
                    resolved_edges.push((parent, node_index));
                }
            }
        }
        for (from_name, to_name) in &extra_edges {
            let &from = names
                .get(from_name)
                .ok_or_else(|| GraphError::UnknownNode(from_name.clone()))?;
            let &to = names
                .get(to_name)
                .ok_or_else(|| GraphError::UnknownNode(to_name.clone()))?;
            if edge_set.insert((from.index(), to.index())) {
                resolved_edges.push((from, to));
            }
        }
        for (from, to) in resolved_edges {
            pg.add_edge(from, to, ());
        }

        // Kahn's algorithm over the builder graph. The ready set is a min-heap on the original
        // (insertion) index, which makes tie-breaking stable.
        let mut in_degree: Vec<usize> = (0..node_count)
            .map(|original| {
                pg.neighbors_directed(NodeIndex::new(original), Direction::Incoming)
                    .count()
            })
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(original, _)| Reverse(original))
            .collect();

        let mut topo_of_original = vec![usize::MAX; node_count];
        let mut original_of_topo = Vec::with_capacity(node_count);
        while let Some(Reverse(original)) = ready.pop() {
            topo_of_original[original] = original_of_topo.len();
            original_of_topo.push(original);
            for child in pg.neighbors_directed(NodeIndex::new(original), Direction::Outgoing) {
                in_degree[child.index()] -= 1;
                if in_degree[child.index()] == 0 {
                    ready.push(Reverse(child.index()));
                }
            }
        }

        if original_of_topo.len() != node_count {
            let unordered: Vec<usize> = (0..node_count)
                .filter(|&original| topo_of_original[original] == usize::MAX)
                .collect();
            let sample = unordered
                .iter()
                .take(CYCLE_SAMPLE_LIMIT)
                .map(|&original| pg[NodeIndex::new(original)].name.clone())
                .collect();
            return Err(GraphError::CycleDetected {
                count: unordered.len(),
                sample,
            });
        }

        // Rewrite into topological index space: names, kinds, CSR children, parent counts, and
        // the source bitmap.
        let mut topo_names = Vec::with_capacity(node_count);
        let mut kinds = Vec::with_capacity(node_count);
        let mut child_offsets = Vec::with_capacity(node_count + 1);
        let mut child_indices = Vec::new();
        let mut parent_counts = Vec::with_capacity(node_count);
        let mut source_bits = FixedBitSet::with_capacity(node_count);
        child_offsets.push(0);
        for &original in &original_of_topo {
            let node_index = NodeIndex::new(original);
            let spec = &pg[node_index];
            topo_names.push(spec.name.clone());
            kinds.push(spec.kind);
            if spec.kind.is_source() {
                source_bits.insert(topo_names.len() - 1);
            }

            let mut children: Vec<u32> = pg
                .neighbors_directed(node_index, Direction::Outgoing)
                .map(|child| topo_of_original[child.index()] as u32)
                .collect();
            children.sort_unstable();
            child_indices.extend_from_slice(&children);
            child_offsets.push(child_indices.len() as u32);

            parent_counts.push(
                pg.neighbors_directed(node_index, Direction::Incoming)
                    .count() as u32,
            );
        }

        let name_to_index: FnvHashMap<String, usize> = topo_names
            .iter()
            .enumerate()
            .map(|(topo, name)| (name.clone(), topo))
            .collect();

        // Consume the builder graph and turn each spec into an entry seed, validating input
        // kinds now so that the engine never has to.
        let (pg_nodes, _) = pg.into_nodes_edges();
        let mut specs: Vec<Option<NodeSpec>> = pg_nodes
            .into_iter()
            .map(|node| Some(node.weight))
            .collect();
        let mut seeds = Vec::with_capacity(node_count);
        for &original in &original_of_topo {
            let spec = specs[original].take().expect("each spec is seeded once");
            seeds.push(Self::seed_for(
                spec,
                &name_to_index,
                &kinds,
                &topo_names,
            )?);
        }

        Ok(Topology {
            names: topo_names,
            kinds,
            child_offsets,
            child_indices,
            parent_counts,
            source_bits,
            name_to_index,
            seeds,
        })
    }

    fn seed_for(
        spec: NodeSpec,
        name_to_index: &FnvHashMap<String, usize>,
        kinds: &[NodeKind],
        names: &[String],
    ) -> Result<EntrySeed, GraphError> {
        let resolve = |input: &str| -> u32 { name_to_index[input] as u32 };
        let require_scalar = |input: &str| -> Result<u32, GraphError> {
            let topo = name_to_index[input];
            match kinds[topo] {
                NodeKind::VectorSource { .. }
                | NodeKind::VectorDerived { .. }
                | NodeKind::KeyedMap { .. } => Err(GraphError::KindMismatch {
                    node: names[topo].clone(),
                    expected: "scalar-presenting node",
                }),
                _ => Ok(topo as u32),
            }
        };

        let NodeSpec {
            name,
            kind,
            inputs,
            cutoff,
            tolerance,
            initial,
            element,
            keys,
            operator,
        } = spec;

        match (kind, operator) {
            (NodeKind::ScalarSource, OperatorSpec::None) => {
                Ok(EntrySeed::ScalarSource { cutoff })
            }
            (NodeKind::ScalarDerived, OperatorSpec::Scalar(op)) => {
                let mut resolved: SmallVec<[u32; 4]> = SmallVec::with_capacity(inputs.len());
                for input in &inputs {
                    resolved.push(require_scalar(input)?);
                }
                Ok(EntrySeed::ScalarDerived {
                    inputs: resolved,
                    cutoff,
                    op,
                })
            }
            (NodeKind::Boolean, OperatorSpec::Bool(op)) => Ok(EntrySeed::Boolean {
                input: require_scalar(&inputs[0])?,
                op,
            }),
            (NodeKind::Selector, OperatorSpec::None) => {
                let condition = name_to_index[inputs[0].as_str()];
                if kinds[condition] != NodeKind::Boolean {
                    return Err(GraphError::KindMismatch {
                        node: names[condition].clone(),
                        expected: "boolean node",
                    });
                }
                Ok(EntrySeed::Selector {
                    condition: condition as u32,
                    if_true: require_scalar(&inputs[1])?,
                    if_false: require_scalar(&inputs[2])?,
                })
            }
            (NodeKind::VectorSource { size }, OperatorSpec::None) => Ok(EntrySeed::VectorSource {
                size,
                initial,
                tolerance,
            }),
            (NodeKind::VectorDerived { size }, OperatorSpec::Vector(op)) => {
                Ok(EntrySeed::VectorDerived {
                    inputs: inputs.iter().map(|input| resolve(input)).collect(),
                    size,
                    tolerance,
                    op,
                })
            }
            (NodeKind::VectorElement, OperatorSpec::None) => {
                let vector = name_to_index[inputs[0].as_str()];
                let size = match kinds[vector] {
                    NodeKind::VectorSource { size } | NodeKind::VectorDerived { size } => size,
                    _ => {
                        return Err(GraphError::KindMismatch {
                            node: names[vector].clone(),
                            expected: "vector node",
                        })
                    }
                };
                if element >= size {
                    return Err(GraphError::IndexOutOfBounds {
                        node: name,
                        index: element,
                        len: size,
                    });
                }
                Ok(EntrySeed::VectorElement {
                    vector: vector as u32,
                    element,
                    cutoff,
                })
            }
            (NodeKind::KeyedMap { .. }, OperatorSpec::Keyed(op)) => Ok(EntrySeed::KeyedMap {
                inputs: inputs.iter().map(|input| resolve(input)).collect(),
                keys,
                tolerance,
                op,
            }),
            // Builder methods pair each kind with its operator shape.
            _ => unreachable!("node kind and operator shape diverged for {name}"),
        }
    }

    pub fn node_count(&self) -> usize {
        self.names.len()
    }

    pub fn edge_count(&self) -> usize {
        self.child_indices.len()
    }

    pub fn is_source(&self, topo_index: usize) -> bool {
        self.source_bits.contains(topo_index)
    }

    /// The half-open range of `child_at` positions holding `topo_index`'s children.
    pub fn children_range(&self, topo_index: usize) -> (usize, usize) {
        (
            self.child_offsets[topo_index] as usize,
            self.child_offsets[topo_index + 1] as usize,
        )
    }

    pub fn child_at(&self, flat: usize) -> usize {
        self.child_indices[flat] as usize
    }

    /// The children of `topo_index`, in ascending topological order.
    pub fn children(&self, topo_index: usize) -> &[u32] {
        let (start, end) = self.children_range(topo_index);
        &self.child_indices[start..end]
    }

    pub fn parent_count(&self, topo_index: usize) -> usize {
        self.parent_counts[topo_index] as usize
    }

    pub fn node(&self, topo_index: usize) -> NodeHandle<'_> {
        NodeHandle {
            name: &self.names[topo_index],
            kind: self.kinds[topo_index],
        }
    }

    pub fn name(&self, topo_index: usize) -> &str {
        &self.names[topo_index]
    }

    pub fn kind(&self, topo_index: usize) -> NodeKind {
        self.kinds[topo_index]
    }

    pub fn topo_index(&self, name: &str) -> Result<usize, GraphError> {
        self.name_to_index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(name.to_owned()))
    }

    pub(crate) fn source_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.source_bits.ones()
    }

    pub(crate) fn take_seeds(&mut self) -> Vec<EntrySeed> {
        mem::take(&mut self.seeds)
    }
}
