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

//! Wait-free publication of selected node values to foreign threads.
//!
//! Each scoped reader owns a triple buffer shared with the writer. The writer fills its private
//! `dirty` buffer and exchanges it with the atomic `clean` index; a reader exchanges `clean`
//! with its private `snap` index and then reads at leisure. The three indices are a permutation
//! of `{0, 1, 2}` at all times, so the writer and reader never touch the same buffer, no one
//! locks, retries, or waits, and every refreshed view is the complete output of a single
//! stabilization pass. The only failure mode is staleness, bounded by the publish frequency.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use fnv::FnvHashMap;

#[cfg(test)]
mod tests;

struct Shared {
    buffers: [CachePadded<UnsafeCell<Box<[f64]>>>; 3],
    clean: AtomicU32,
}

// SAFETY: buffer slots are only ever accessed through the index permutation protocol described
// in the module docs: the writer dereferences only `buffers[dirty]` and a reader only
// `buffers[snap]`, and those indices are disjoint because every transfer goes through an atomic
// exchange with `clean`. The release/acquire pairing on that exchange orders buffer writes
// before any reader's loads.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn new(len: usize) -> Shared {
        let buffer = || CachePadded::new(UnsafeCell::new(vec![f64::NAN; len].into_boxed_slice()));
        Shared {
            buffers: [buffer(), buffer(), buffer()],
            clean: AtomicU32::new(0),
        }
    }
}

struct WriterScope {
    shared: Arc<Shared>,
    watched: Vec<usize>,
    dirty: u32,
}

///
/// The writer side: owned by the engine thread and typically driven from the
/// post-stabilization hook. Publishes the watched values of every registered scope.
///
pub struct SnapshotHub {
    scopes: Vec<WriterScope>,
}

impl SnapshotHub {
    pub fn new() -> SnapshotHub {
        SnapshotHub { scopes: Vec::new() }
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    ///
    /// Registers a scoped reader over the given `(name, topo_index)` pairs. Registration is a
    /// startup operation: the returned reader may be moved to any thread.
    ///
    pub fn add_scope(&mut self, watched: Vec<(String, usize)>) -> SnapshotReader {
        let shared = Arc::new(Shared::new(watched.len()));
        let positions = watched
            .iter()
            .enumerate()
            .map(|(position, (name, _))| (name.clone(), position))
            .collect();
        self.scopes.push(WriterScope {
            shared: shared.clone(),
            watched: watched.into_iter().map(|(_, topo_index)| topo_index).collect(),
            dirty: 1,
        });
        SnapshotReader {
            shared,
            positions,
            snap: 2,
        }
    }

    ///
    /// Copies the watched values of every scope out of `read` and publishes them. Wait-free:
    /// one atomic exchange per scope.
    ///
    pub fn publish<F: Fn(usize) -> f64>(&mut self, read: F) {
        for scope in &mut self.scopes {
            {
                // SAFETY: `dirty` is writer-private under the permutation protocol, so no other
                // thread can access this buffer until it is exchanged below.
                let buffer = unsafe { &mut *scope.shared.buffers[scope.dirty as usize].get() };
                for (slot, &topo_index) in buffer.iter_mut().zip(scope.watched.iter()) {
                    *slot = read(topo_index);
                }
            }
            // Release publishes the buffer writes to the reader's acquire exchange.
            let old_clean = scope.shared.clean.swap(scope.dirty, Ordering::AcqRel);
            scope.dirty = old_clean;
        }
    }
}

///
/// A scoped reader: wait-free, consistent read-out of a fixed set of node values from any
/// thread.
///
/// `refresh` adopts the most recently published snapshot; the `get` accessors then serve reads
/// from that single pass until the next `refresh`. A reader never blocks the writer and is
/// never blocked by it.
///
pub struct SnapshotReader {
    shared: Arc<Shared>,
    positions: FnvHashMap<String, usize>,
    snap: u32,
}

impl SnapshotReader {
    /// Adopts the latest published snapshot. Before the first publish, the view holds NaN.
    pub fn refresh(&mut self) {
        // Acquire pairs with the writer's release exchange, ordering its buffer writes before
        // our reads.
        let old_snap = self.shared.clean.swap(self.snap, Ordering::AcqRel);
        self.snap = old_snap;
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// The value of `name` in the currently adopted snapshot.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.positions
            .get(name)
            .map(|&position| self.read_at(position))
    }

    /// The value at `position` (registration order) in the currently adopted snapshot.
    pub fn get_index(&self, position: usize) -> Option<f64> {
        if position < self.positions.len() {
            Some(self.read_at(position))
        } else {
            None
        }
    }

    ///
    /// Convenience: refresh-then-read of one value.
    ///
    /// Each call adopts a new snapshot, so two `read_one` calls may observe different passes:
    /// this is NOT cross-value consistent. To read several values from the same pass, call
    /// `refresh` once and then `get` each value.
    ///
    pub fn read_one(&mut self, name: &str) -> Option<f64> {
        self.refresh();
        self.get(name)
    }

    fn read_at(&self, position: usize) -> f64 {
        // SAFETY: `snap` is reader-private under the permutation protocol; the writer cannot
        // touch this buffer until we exchange it back via `refresh`.
        let buffer = unsafe { &*self.shared.buffers[self.snap as usize].get() };
        buffer[position]
    }
}
