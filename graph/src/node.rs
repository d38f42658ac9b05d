// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::entry::Inputs;

///
/// The change-detection predicate a node applies after recomputing, to decide whether its
/// children need to be marked dirty.
///
/// A NaN-to-non-NaN transition is reported as a change before the cutoff proper is consulted, and
/// a NaN-to-NaN recomputation compares unchanged: once a node has settled on NaN it stops
/// propagating until a real value returns.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Cutoff {
    /// Always propagate, even for bit-identical values.
    Always,
    /// Never propagate, even for wildly different values.
    Never,
    /// Raw bit inequality. All NaN payloads are treated as one value, distinct from any
    /// non-NaN.
    Exact,
    /// `|current - previous| > tolerance`.
    Absolute(f64),
    /// `|current - previous| / max(|previous|, |current|) > tolerance`; zero magnitude compares
    /// unchanged.
    Relative(f64),
}

impl Cutoff {
    pub fn is_changed(&self, previous: f64, current: f64) -> bool {
        match self {
            Cutoff::Always => true,
            Cutoff::Never => false,
            _ if previous.is_nan() != current.is_nan() => true,
            _ if previous.is_nan() => false,
            Cutoff::Exact => previous.to_bits() != current.to_bits(),
            Cutoff::Absolute(tolerance) => (current - previous).abs() > *tolerance,
            Cutoff::Relative(tolerance) => {
                let magnitude = previous.abs().max(current.abs());
                if magnitude == 0.0 {
                    false
                } else {
                    (current - previous).abs() / magnitude > *tolerance
                }
            }
        }
    }
}

/// Element-wise change detection for vector and keyed-map values: NaN transitions count as
/// changes, NaN-to-NaN does not.
pub(crate) fn element_changed(previous: f64, current: f64, tolerance: f64) -> bool {
    if previous.is_nan() != current.is_nan() {
        return true;
    }
    if previous.is_nan() {
        return false;
    }
    (current - previous).abs() > tolerance
}

///
/// The kind of a node, fixed at build time.
///
/// Vector-shaped kinds carry their (fixed) length; the keyed map carries its key count. The
/// kind participates in the topology fingerprint, so resizing or re-typing a node invalidates
/// persisted state.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NodeKind {
    ScalarSource,
    ScalarDerived,
    Boolean,
    Selector,
    VectorSource { size: usize },
    VectorDerived { size: usize },
    VectorElement,
    KeyedMap { size: usize },
}

impl NodeKind {
    pub fn is_source(&self) -> bool {
        matches!(self, NodeKind::ScalarSource | NodeKind::VectorSource { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::ScalarSource => "scalar_source",
            NodeKind::ScalarDerived => "scalar_derived",
            NodeKind::Boolean => "boolean",
            NodeKind::Selector => "selector",
            NodeKind::VectorSource { .. } => "vector_source",
            NodeKind::VectorDerived { .. } => "vector_derived",
            NodeKind::VectorElement => "vector_element",
            NodeKind::KeyedMap { .. } => "keyed_map",
        }
    }
}

///
/// A user-supplied scalar computation: receives the node's resolved input values in input-list
/// order and produces the node's new value.
///
/// Operators may be stateful (moving averages, oscillators); the engine invokes them through a
/// `&mut` receiver with no allocation on the hot path. Panics inside an operator are trapped by
/// the engine: the node's value becomes NaN and the pass is marked failed.
///
pub trait ScalarOperator: Send {
    fn apply(&mut self, inputs: &[f64]) -> f64;
}

impl<F> ScalarOperator for F
where
    F: FnMut(&[f64]) -> f64 + Send,
{
    fn apply(&mut self, inputs: &[f64]) -> f64 {
        self(inputs)
    }
}

/// A user-supplied predicate over one scalar input, backing a boolean node.
pub trait BoolOperator: Send {
    fn apply(&mut self, input: f64) -> bool;
}

impl<F> BoolOperator for F
where
    F: FnMut(f64) -> bool + Send,
{
    fn apply(&mut self, input: f64) -> bool {
        self(input)
    }
}

///
/// A user-supplied vector computation: reads any mix of scalar and vector inputs through
/// `Inputs` and writes the node's new value into a pre-allocated output buffer.
///
pub trait VectorOperator: Send {
    fn apply(&mut self, inputs: &Inputs<'_>, out: &mut [f64]);
}

impl<F> VectorOperator for F
where
    F: FnMut(&Inputs<'_>, &mut [f64]) + Send,
{
    fn apply(&mut self, inputs: &Inputs<'_>, out: &mut [f64]) {
        self(inputs, out)
    }
}

/// A user-supplied keyed-map computation, writing values by key ordinal.
pub trait KeyedOperator: Send {
    fn apply(&mut self, inputs: &Inputs<'_>, out: &mut KeyedWriter<'_>);
}

impl<F> KeyedOperator for F
where
    F: FnMut(&Inputs<'_>, &mut KeyedWriter<'_>) + Send,
{
    fn apply(&mut self, inputs: &Inputs<'_>, out: &mut KeyedWriter<'_>) {
        self(inputs, out)
    }
}

///
/// Ordinal-based writer handed to keyed-map operators. Ordinals correspond to the node's
/// frozen key list; out-of-range writes panic, and are therefore trapped like any other
/// operator failure.
///
pub struct KeyedWriter<'a> {
    values: &'a mut [f64],
}

impl<'a> KeyedWriter<'a> {
    pub(crate) fn new(values: &'a mut [f64]) -> KeyedWriter<'a> {
        KeyedWriter { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn set(&mut self, ordinal: usize, value: f64) {
        self.values[ordinal] = value;
    }
}
