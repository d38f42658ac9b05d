// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};

use fnv::FnvHashMap;
use smallvec::SmallVec;

use crate::node::{
    element_changed, BoolOperator, Cutoff, KeyedOperator, KeyedWriter, ScalarOperator,
    VectorOperator,
};

///
/// Resolved input values for a vector or keyed-map operator.
///
/// Positions index the node's input list, not the topology. Because parents always precede a
/// node in topological order, the borrow is over the prefix of the entry table and is immutable
/// for the duration of the operator call.
///
pub struct Inputs<'a> {
    entries: &'a [Entry],
    indices: &'a [u32],
}

impl<'a> Inputs<'a> {
    pub(crate) fn new(entries: &'a [Entry], indices: &'a [u32]) -> Inputs<'a> {
        Inputs { entries, indices }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// The scalar presentation of the input at `position` (NaN for vector-shaped inputs).
    pub fn scalar(&self, position: usize) -> f64 {
        self.entries[self.indices[position] as usize].scalar_value()
    }

    /// The vector value of the input at `position` (empty for scalar-shaped inputs).
    pub fn vector(&self, position: usize) -> &'a [f64] {
        self.entries[self.indices[position] as usize]
            .vector_value()
            .unwrap_or(&[])
    }
}

///
/// Construction data for one node, produced by compilation in topological order and consumed
/// by `Engine::new`. Input references have already been resolved to topological indices.
///
pub(crate) enum EntrySeed {
    ScalarSource {
        cutoff: Cutoff,
    },
    ScalarDerived {
        inputs: SmallVec<[u32; 4]>,
        cutoff: Cutoff,
        op: Box<dyn ScalarOperator>,
    },
    Boolean {
        input: u32,
        op: Box<dyn BoolOperator>,
    },
    Selector {
        condition: u32,
        if_true: u32,
        if_false: u32,
    },
    VectorSource {
        size: usize,
        initial: f64,
        tolerance: f64,
    },
    VectorDerived {
        inputs: SmallVec<[u32; 4]>,
        size: usize,
        tolerance: f64,
        op: Box<dyn VectorOperator>,
    },
    VectorElement {
        vector: u32,
        element: usize,
        cutoff: Cutoff,
    },
    KeyedMap {
        inputs: SmallVec<[u32; 4]>,
        keys: Vec<String>,
        tolerance: f64,
        op: Box<dyn KeyedOperator>,
    },
}

///
/// Per-node runtime state and value storage. One variant per node kind; dynamic dispatch only
/// at the operator boundary.
///
pub(crate) enum Entry {
    ScalarSource(ScalarSourceEntry),
    ScalarDerived(ScalarDerivedEntry),
    Boolean(BooleanEntry),
    Selector(SelectorEntry),
    VectorSource(VectorSourceEntry),
    VectorDerived(VectorDerivedEntry),
    VectorElement(VectorElementEntry),
    KeyedMap(KeyedMapEntry),
}

pub(crate) struct ScalarSourceEntry {
    pub(crate) value: f64,
    baseline: f64,
    cutoff: Cutoff,
    initialized: bool,
}

pub(crate) struct ScalarDerivedEntry {
    inputs: SmallVec<[u32; 4]>,
    cutoff: Cutoff,
    op: Box<dyn ScalarOperator>,
    current: f64,
    previous: f64,
    initialized: bool,
}

pub(crate) struct BooleanEntry {
    input: u32,
    op: Box<dyn BoolOperator>,
    current: bool,
    previous: bool,
    initialized: bool,
}

pub(crate) struct SelectorEntry {
    condition: u32,
    if_true: u32,
    if_false: u32,
    current: f64,
    previous: f64,
    initialized: bool,
}

pub(crate) struct VectorSourceEntry {
    pub(crate) values: Vec<f64>,
    baseline: Vec<f64>,
    tolerance: f64,
    initialized: bool,
}

pub(crate) struct VectorDerivedEntry {
    inputs: SmallVec<[u32; 4]>,
    op: Box<dyn VectorOperator>,
    current: Vec<f64>,
    previous: Vec<f64>,
    tolerance: f64,
    initialized: bool,
}

pub(crate) struct VectorElementEntry {
    vector: u32,
    element: usize,
    cutoff: Cutoff,
    current: f64,
    previous: f64,
    initialized: bool,
}

pub(crate) struct KeyedMapEntry {
    inputs: SmallVec<[u32; 4]>,
    keys: Vec<String>,
    ordinals: FnvHashMap<String, usize>,
    op: Box<dyn KeyedOperator>,
    current: Vec<f64>,
    previous: Vec<f64>,
    tolerance: f64,
    initialized: bool,
}

///
/// Captured value state for one node, used by the persisted-state extension. The vectors are
/// length 1 for scalar-presenting kinds.
///
#[derive(Clone, Debug, PartialEq)]
pub struct NodeState {
    pub current: Vec<f64>,
    pub previous: Vec<f64>,
    pub initialized: bool,
}

impl Entry {
    pub(crate) fn from_seed(seed: EntrySeed) -> Entry {
        match seed {
            EntrySeed::ScalarSource { cutoff } => Entry::ScalarSource(ScalarSourceEntry {
                value: f64::NAN,
                baseline: f64::NAN,
                cutoff,
                initialized: false,
            }),
            EntrySeed::ScalarDerived { inputs, cutoff, op } => {
                Entry::ScalarDerived(ScalarDerivedEntry {
                    inputs,
                    cutoff,
                    op,
                    current: f64::NAN,
                    previous: f64::NAN,
                    initialized: false,
                })
            }
            EntrySeed::Boolean { input, op } => Entry::Boolean(BooleanEntry {
                input,
                op,
                current: false,
                previous: false,
                initialized: false,
            }),
            EntrySeed::Selector {
                condition,
                if_true,
                if_false,
            } => Entry::Selector(SelectorEntry {
                condition,
                if_true,
                if_false,
                current: f64::NAN,
                previous: f64::NAN,
                initialized: false,
            }),
            EntrySeed::VectorSource {
                size,
                initial,
                tolerance,
            } => Entry::VectorSource(VectorSourceEntry {
                values: vec![initial; size],
                baseline: vec![initial; size],
                tolerance,
                initialized: false,
            }),
            EntrySeed::VectorDerived {
                inputs,
                size,
                tolerance,
                op,
            } => Entry::VectorDerived(VectorDerivedEntry {
                inputs,
                op,
                current: vec![f64::NAN; size],
                previous: vec![f64::NAN; size],
                tolerance,
                initialized: false,
            }),
            EntrySeed::VectorElement {
                vector,
                element,
                cutoff,
            } => Entry::VectorElement(VectorElementEntry {
                vector,
                element,
                cutoff,
                current: f64::NAN,
                previous: f64::NAN,
                initialized: false,
            }),
            EntrySeed::KeyedMap {
                inputs,
                keys,
                tolerance,
                op,
            } => {
                let size = keys.len();
                let ordinals = keys
                    .iter()
                    .enumerate()
                    .map(|(ordinal, key)| (key.clone(), ordinal))
                    .collect();
                Entry::KeyedMap(KeyedMapEntry {
                    inputs,
                    keys,
                    ordinals,
                    op,
                    current: vec![f64::NAN; size],
                    previous: vec![f64::NAN; size],
                    tolerance,
                    initialized: false,
                })
            }
        }
    }

    ///
    /// Recomputes this node's value from its parents, advances the change-detection baseline,
    /// and reports whether children should be marked dirty.
    ///
    /// `parents` is the prefix of the entry table below this node's topological index, so every
    /// resolved input index is in range. An `Err` means a user operator panicked: the node's
    /// value has been set to NaN and the caller must not propagate downstream.
    ///
    pub(crate) fn stabilize(&mut self, parents: &[Entry]) -> Result<bool, String> {
        match self {
            Entry::ScalarSource(state) => {
                let changed = !state.initialized
                    || state.baseline.is_nan() != state.value.is_nan()
                    || state.cutoff.is_changed(state.baseline, state.value);
                if changed {
                    state.baseline = state.value;
                }
                state.initialized = true;
                Ok(changed)
            }
            Entry::ScalarDerived(state) => {
                let mut inputs: SmallVec<[f64; 8]> = SmallVec::with_capacity(state.inputs.len());
                for &index in &state.inputs {
                    inputs.push(parents[index as usize].scalar_value());
                }
                state.previous = state.current;
                match trap(|| state.op.apply(&inputs)) {
                    Ok(value) => state.current = value,
                    Err(message) => {
                        state.current = f64::NAN;
                        state.initialized = true;
                        return Err(message);
                    }
                }
                let changed = !state.initialized
                    || state.previous.is_nan() != state.current.is_nan()
                    || state.cutoff.is_changed(state.previous, state.current);
                state.initialized = true;
                Ok(changed)
            }
            Entry::Boolean(state) => {
                let input = parents[state.input as usize].scalar_value();
                let computed = trap(|| state.op.apply(input))?;
                state.previous = state.current;
                state.current = computed;
                let changed = !state.initialized || state.previous != state.current;
                state.initialized = true;
                Ok(changed)
            }
            Entry::Selector(state) => {
                // Compilation validates that the condition input is a boolean node.
                let condition = parents[state.condition as usize]
                    .bool_value()
                    .unwrap_or(false);
                let picked = if condition {
                    parents[state.if_true as usize].scalar_value()
                } else {
                    parents[state.if_false as usize].scalar_value()
                };
                state.previous = state.current;
                state.current = picked;
                let changed =
                    !state.initialized || Cutoff::Exact.is_changed(state.previous, state.current);
                state.initialized = true;
                Ok(changed)
            }
            Entry::VectorSource(state) => {
                let changed = !state.initialized
                    || state
                        .baseline
                        .iter()
                        .zip(state.values.iter())
                        .any(|(&previous, &current)| {
                            element_changed(previous, current, state.tolerance)
                        });
                if changed {
                    state.baseline.copy_from_slice(&state.values);
                }
                state.initialized = true;
                Ok(changed)
            }
            Entry::VectorDerived(state) => {
                state.previous.copy_from_slice(&state.current);
                let mut out = mem::take(&mut state.current);
                let inputs = Inputs::new(parents, &state.inputs);
                let result = trap(|| state.op.apply(&inputs, &mut out));
                match result {
                    Ok(()) => {
                        state.current = out;
                        let changed = !state.initialized
                            || state
                                .previous
                                .iter()
                                .zip(state.current.iter())
                                .any(|(&previous, &current)| {
                                    element_changed(previous, current, state.tolerance)
                                });
                        state.initialized = true;
                        Ok(changed)
                    }
                    Err(message) => {
                        out.fill(f64::NAN);
                        state.current = out;
                        state.initialized = true;
                        Err(message)
                    }
                }
            }
            Entry::VectorElement(state) => {
                // Compilation validates both the parent kind and the element bound.
                let value = parents[state.vector as usize]
                    .vector_value()
                    .and_then(|values| values.get(state.element).copied())
                    .unwrap_or(f64::NAN);
                state.previous = state.current;
                state.current = value;
                let changed = !state.initialized
                    || state.previous.is_nan() != state.current.is_nan()
                    || state.cutoff.is_changed(state.previous, state.current);
                state.initialized = true;
                Ok(changed)
            }
            Entry::KeyedMap(state) => {
                state.previous.copy_from_slice(&state.current);
                let mut out = mem::take(&mut state.current);
                let inputs = Inputs::new(parents, &state.inputs);
                let result = trap(|| {
                    let mut writer = KeyedWriter::new(&mut out);
                    state.op.apply(&inputs, &mut writer)
                });
                match result {
                    Ok(()) => {
                        state.current = out;
                        let changed = !state.initialized
                            || state
                                .previous
                                .iter()
                                .zip(state.current.iter())
                                .any(|(&previous, &current)| {
                                    element_changed(previous, current, state.tolerance)
                                });
                        state.initialized = true;
                        Ok(changed)
                    }
                    Err(message) => {
                        out.fill(f64::NAN);
                        state.current = out;
                        state.initialized = true;
                        Err(message)
                    }
                }
            }
        }
    }

    /// The scalar presentation of this node (NaN for vector-shaped kinds; booleans present as
    /// 1.0/0.0).
    pub(crate) fn scalar_value(&self) -> f64 {
        match self {
            Entry::ScalarSource(state) => state.value,
            Entry::ScalarDerived(state) => state.current,
            Entry::Boolean(state) => {
                if state.current {
                    1.0
                } else {
                    0.0
                }
            }
            Entry::Selector(state) => state.current,
            Entry::VectorElement(state) => state.current,
            Entry::VectorSource(_) | Entry::VectorDerived(_) | Entry::KeyedMap(_) => f64::NAN,
        }
    }

    pub(crate) fn bool_value(&self) -> Option<bool> {
        match self {
            Entry::Boolean(state) => Some(state.current),
            _ => None,
        }
    }

    pub(crate) fn vector_value(&self) -> Option<&[f64]> {
        match self {
            Entry::VectorSource(state) => Some(&state.values),
            Entry::VectorDerived(state) => Some(&state.current),
            Entry::KeyedMap(state) => Some(&state.current),
            _ => None,
        }
    }

    pub(crate) fn keyed_get(&self, key: &str) -> Option<f64> {
        match self {
            Entry::KeyedMap(state) => state.ordinals.get(key).map(|&ordinal| state.current[ordinal]),
            _ => None,
        }
    }

    pub(crate) fn keys(&self) -> Option<&[String]> {
        match self {
            Entry::KeyedMap(state) => Some(&state.keys),
            _ => None,
        }
    }

    pub(crate) fn capture(&self) -> NodeState {
        let (current, previous, initialized) = match self {
            Entry::ScalarSource(state) => {
                (vec![state.value], vec![state.baseline], state.initialized)
            }
            Entry::ScalarDerived(state) => {
                (vec![state.current], vec![state.previous], state.initialized)
            }
            Entry::Boolean(state) => (
                vec![f64::from(u8::from(state.current))],
                vec![f64::from(u8::from(state.previous))],
                state.initialized,
            ),
            Entry::Selector(state) => {
                (vec![state.current], vec![state.previous], state.initialized)
            }
            Entry::VectorSource(state) => {
                (state.values.clone(), state.baseline.clone(), state.initialized)
            }
            Entry::VectorDerived(state) => {
                (state.current.clone(), state.previous.clone(), state.initialized)
            }
            Entry::VectorElement(state) => {
                (vec![state.current], vec![state.previous], state.initialized)
            }
            Entry::KeyedMap(state) => {
                (state.current.clone(), state.previous.clone(), state.initialized)
            }
        };
        NodeState {
            current,
            previous,
            initialized,
        }
    }

    /// Restores captured state. On a length mismatch, returns the expected length without
    /// mutating anything.
    pub(crate) fn restore(&mut self, node_state: &NodeState) -> Result<(), usize> {
        let expected = match self {
            Entry::VectorSource(state) => state.values.len(),
            Entry::VectorDerived(state) => state.current.len(),
            Entry::KeyedMap(state) => state.current.len(),
            _ => 1,
        };
        if node_state.current.len() != expected || node_state.previous.len() != expected {
            return Err(expected);
        }
        match self {
            Entry::ScalarSource(state) => {
                state.value = node_state.current[0];
                state.baseline = node_state.previous[0];
                state.initialized = node_state.initialized;
            }
            Entry::ScalarDerived(state) => {
                state.current = node_state.current[0];
                state.previous = node_state.previous[0];
                state.initialized = node_state.initialized;
            }
            Entry::Boolean(state) => {
                state.current = node_state.current[0] != 0.0;
                state.previous = node_state.previous[0] != 0.0;
                state.initialized = node_state.initialized;
            }
            Entry::Selector(state) => {
                state.current = node_state.current[0];
                state.previous = node_state.previous[0];
                state.initialized = node_state.initialized;
            }
            Entry::VectorSource(state) => {
                state.values.copy_from_slice(&node_state.current);
                state.baseline.copy_from_slice(&node_state.previous);
                state.initialized = node_state.initialized;
            }
            Entry::VectorDerived(state) => {
                state.current.copy_from_slice(&node_state.current);
                state.previous.copy_from_slice(&node_state.previous);
                state.initialized = node_state.initialized;
            }
            Entry::VectorElement(state) => {
                state.current = node_state.current[0];
                state.previous = node_state.previous[0];
                state.initialized = node_state.initialized;
            }
            Entry::KeyedMap(state) => {
                state.current.copy_from_slice(&node_state.current);
                state.previous.copy_from_slice(&node_state.previous);
                state.initialized = node_state.initialized;
            }
        }
        Ok(())
    }
}

/// Runs a user operator inside a narrow trap region, converting panics into an error message.
fn trap<R>(computation: impl FnOnce() -> R) -> Result<R, String> {
    panic::catch_unwind(AssertUnwindSafe(computation)).map_err(panic_message)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "operator panicked with a non-string payload".to_owned()
    }
}
