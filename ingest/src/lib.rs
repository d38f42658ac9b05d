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

//! The ingestion bridge: a bounded ring of update events between a producer (feed handler) and
//! the single consumer thread that owns the engine.
//!
//! Bursts coalesce: many events are applied before one stabilization pass runs, so a thousand
//! feed ticks cost one pass. A pass failure is caught and surfaced on the error channel; the
//! consumer keeps draining so producers are never blocked by an unhealthy engine.

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use graph::{Engine, GraphError};

/// `vector_index` value denoting a scalar update.
pub const SCALAR_UPDATE: i32 = -1;

const BLOCK_WAIT: Duration = Duration::from_millis(10);
const MIN_RING_CAPACITY: usize = 64;

///
/// A fixed-layout update event. Events are pre-allocated by the ring in one contiguous block;
/// this is in-process shared memory, not a wire format.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UpdateEvent {
    pub target_index: u32,
    pub double_value: f64,
    /// Non-negative for per-element vector updates; `SCALAR_UPDATE` for scalar updates.
    pub vector_index: i32,
    /// Producer-asserted end of a logical batch: forces a stabilization pass.
    pub force_flush: bool,
    pub sequence: u64,
}

/// How the consumer waits when the ring is empty.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitStrategy {
    /// Park on the ring with a short timeout. The default; cheapest when idle.
    Block,
    /// Busy-poll with `thread::yield_now`.
    Yield,
    /// Busy-poll with a spin hint. Lowest latency; burns a core.
    Spin,
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Ring size in events. Must be a power of two and at least 64.
    pub ring_capacity: usize,
    pub wait_strategy: WaitStrategy,
    /// When true (the default), all immediately available events are applied before a single
    /// pass runs. When false, every event triggers a pass.
    pub batch_coalescing: bool,
    /// How long shutdown may spend draining pending events.
    pub drain_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> BridgeConfig {
        BridgeConfig {
            ring_capacity: 1024,
            wait_strategy: WaitStrategy::Block,
            batch_coalescing: true,
            drain_timeout: Duration::from_millis(500),
        }
    }
}

impl BridgeConfig {
    fn validate(&self) -> Result<(), String> {
        if self.ring_capacity < MIN_RING_CAPACITY || !self.ring_capacity.is_power_of_two() {
            return Err(format!(
                "ring_capacity must be a power of two >= {MIN_RING_CAPACITY}, got {}",
                self.ring_capacity
            ));
        }
        Ok(())
    }
}

///
/// Counters maintained by the consumer thread, readable from any thread.
///
/// `dropped_events` counts events whose target was not a valid source (observability only: no
/// retry, no error); `invalid_vector_index` counts per-element writes that failed bounds
/// checks.
///
#[derive(Default)]
pub struct BridgeStats {
    events_consumed: AtomicU64,
    passes_run: AtomicU64,
    pass_failures: AtomicU64,
    dropped_events: AtomicU64,
    invalid_vector_index: AtomicU64,
}

impl BridgeStats {
    pub fn events_consumed(&self) -> u64 {
        self.events_consumed.load(Ordering::Relaxed)
    }

    pub fn passes_run(&self) -> u64 {
        self.passes_run.load(Ordering::Relaxed)
    }

    pub fn pass_failures(&self) -> u64 {
        self.pass_failures.load(Ordering::Relaxed)
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn invalid_vector_index(&self) -> u64 {
        self.invalid_vector_index.load(Ordering::Relaxed)
    }
}

///
/// The producer handle. Send methods take `&mut self` and the handle is not `Clone`: the
/// single-producer discipline is a compile-time property, and `sequence` numbering is only
/// meaningful under it.
///
/// Sends block while the ring is full; the bounded ring is the only backpressure mechanism.
///
pub struct UpdateProducer {
    sender: Sender<UpdateEvent>,
    sequence: u64,
}

impl UpdateProducer {
    pub fn send_scalar(&mut self, target_index: u32, value: f64) -> Result<(), String> {
        self.send(target_index, SCALAR_UPDATE, value, false)
    }

    /// A scalar update that also ends the producer's logical batch.
    pub fn send_scalar_flush(&mut self, target_index: u32, value: f64) -> Result<(), String> {
        self.send(target_index, SCALAR_UPDATE, value, true)
    }

    pub fn send_vector(
        &mut self,
        target_index: u32,
        vector_index: u32,
        value: f64,
    ) -> Result<(), String> {
        self.send(target_index, vector_index as i32, value, false)
    }

    pub fn send_vector_flush(
        &mut self,
        target_index: u32,
        vector_index: u32,
        value: f64,
    ) -> Result<(), String> {
        self.send(target_index, vector_index as i32, value, true)
    }

    /// The sequence number the next event will carry.
    pub fn next_sequence(&self) -> u64 {
        self.sequence
    }

    fn send(
        &mut self,
        target_index: u32,
        vector_index: i32,
        value: f64,
        force_flush: bool,
    ) -> Result<(), String> {
        let event = UpdateEvent {
            target_index,
            double_value: value,
            vector_index,
            force_flush,
            sequence: self.sequence,
        };
        self.sequence += 1;
        self.sender
            .send(event)
            .map_err(|_| "the ingest consumer has shut down".to_owned())
    }
}

/// Runs on the consumer thread after each successful pass, before the next batch is consumed.
/// Receives the engine (for snapshot publication), the epoch, and the stabilized-node count.
pub type PostStabilize = Box<dyn FnMut(&Engine, u64, usize) + Send>;

///
/// Owns the consumer thread. The thread is joined on `shutdown` (or on drop), never silently
/// abandoned: pending events are drained up to the configured deadline first.
///
pub struct IngestBridge {
    shutdown: Arc<AtomicBool>,
    stats: Arc<BridgeStats>,
    errors: Receiver<GraphError>,
    liveness: Receiver<String>,
    handle: Option<thread::JoinHandle<Engine>>,
}

impl IngestBridge {
    ///
    /// Spawns the consumer thread around `engine` and returns the bridge plus the (sole)
    /// producer handle.
    ///
    pub fn spawn(
        engine: Engine,
        config: BridgeConfig,
        post_stabilize: Option<PostStabilize>,
    ) -> Result<(IngestBridge, UpdateProducer), String> {
        config.validate()?;
        let (sender, receiver) = crossbeam_channel::bounded(config.ring_capacity);
        let (error_sender, error_receiver) = crossbeam_channel::unbounded();
        let (liveness_sender, liveness_receiver) = crossbeam_channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(BridgeStats::default());

        let consumer = Consumer {
            engine,
            receiver,
            shutdown: shutdown.clone(),
            stats: stats.clone(),
            errors: error_sender,
            config,
            post_stabilize,
            last_sequence: None,
        };
        let handle = thread::Builder::new()
            .name("ingest-consumer".to_owned())
            .spawn(move || {
                let (engine, exit_msg) = consumer.run();
                log::debug!("Ingest consumer exiting: {exit_msg}");
                let _ = liveness_sender.send(exit_msg);
                engine
            })
            .map_err(|error| format!("Failed to spawn the ingest consumer: {error}"))?;

        Ok((
            IngestBridge {
                shutdown,
                stats,
                errors: error_receiver,
                liveness: liveness_receiver,
                handle: Some(handle),
            },
            UpdateProducer {
                sender,
                sequence: 0,
            },
        ))
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        self.stats.clone()
    }

    /// Non-blocking poll of the pass-failure channel.
    pub fn try_error(&self) -> Option<GraphError> {
        self.errors.try_recv().ok()
    }

    ///
    /// The bridge never restarts its consumer: a caller seeing an error here should shut down
    /// (or rebuild) the bridge.
    ///
    pub fn is_live(&self) -> Result<(), String> {
        match self.liveness.try_recv() {
            Ok(exit_msg) => Err(exit_msg),
            Err(TryRecvError::Disconnected) => {
                Err("the ingest consumer exited abnormally".to_owned())
            }
            Err(TryRecvError::Empty) => Ok(()),
        }
    }

    ///
    /// Signals shutdown, waits for the consumer to drain (bounded by `drain_timeout`), and
    /// returns the engine.
    ///
    pub fn shutdown(mut self) -> Result<Engine, String> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| "the bridge was already shut down".to_owned())?;
        self.shutdown.store(true, Ordering::Relaxed);
        handle
            .join()
            .map_err(|_| "the ingest consumer panicked".to_owned())
    }
}

impl Drop for IngestBridge {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shutdown.store(true, Ordering::Relaxed);
            let _ = handle.join();
        }
    }
}

struct Consumer {
    engine: Engine,
    receiver: Receiver<UpdateEvent>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<BridgeStats>,
    errors: Sender<GraphError>,
    config: BridgeConfig,
    post_stabilize: Option<PostStabilize>,
    last_sequence: Option<u64>,
}

impl Consumer {
    fn run(mut self) -> (Engine, String) {
        let exit_msg = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                self.drain();
                break "shutdown requested".to_owned();
            }
            let event = match self.config.wait_strategy {
                WaitStrategy::Block => match self.receiver.recv_timeout(BLOCK_WAIT) {
                    Ok(event) => Some(event),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => {
                        break "all producers disconnected".to_owned();
                    }
                },
                WaitStrategy::Yield => match self.receiver.try_recv() {
                    Ok(event) => Some(event),
                    Err(TryRecvError::Empty) => {
                        thread::yield_now();
                        None
                    }
                    Err(TryRecvError::Disconnected) => {
                        break "all producers disconnected".to_owned();
                    }
                },
                WaitStrategy::Spin => match self.receiver.try_recv() {
                    Ok(event) => Some(event),
                    Err(TryRecvError::Empty) => {
                        std::hint::spin_loop();
                        None
                    }
                    Err(TryRecvError::Disconnected) => {
                        break "all producers disconnected".to_owned();
                    }
                },
            };
            let Some(event) = event else {
                continue;
            };

            // Batch coalescing: apply everything that is immediately available (up to a
            // force_flush boundary), then run a single pass for the whole burst.
            let mut flush = self.apply(event);
            if self.config.batch_coalescing {
                while !flush {
                    match self.receiver.try_recv() {
                        Ok(next) => flush = self.apply(next),
                        Err(_) => break,
                    }
                }
            }
            self.stabilize();
        };
        (self.engine, exit_msg)
    }

    /// Applies one event to the engine and returns its `force_flush` flag.
    fn apply(&mut self, event: UpdateEvent) -> bool {
        self.stats.events_consumed.fetch_add(1, Ordering::Relaxed);
        if let Some(last) = self.last_sequence {
            if event.sequence <= last {
                log::warn!(
                    "Out-of-order event sequence {} after {last}: is a second producer writing?",
                    event.sequence
                );
            }
        }
        self.last_sequence = Some(event.sequence);

        let target = event.target_index as usize;
        let topology = self.engine.topology();
        if target >= topology.node_count() || !topology.is_source(target) {
            self.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
            log::debug!("Dropped event for non-source target {}", event.target_index);
            return event.force_flush;
        }

        let applied = if event.vector_index < 0 {
            self.engine.update_scalar(target, event.double_value)
        } else {
            self.engine
                .update_vector_at(target, event.vector_index as usize, event.double_value)
        };
        match applied {
            Ok(()) => {
                // Bounds were just checked against the topology.
                let _ = self.engine.mark_dirty(target);
            }
            Err(GraphError::IndexOutOfBounds { .. }) => {
                self.stats
                    .invalid_vector_index
                    .fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Dropped event with invalid vector index {} for target {}",
                    event.vector_index,
                    event.target_index
                );
            }
            Err(error) => {
                self.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropped unappliable event: {error}");
            }
        }
        event.force_flush
    }

    ///
    /// Runs one pass. A failure is surfaced on the error channel and the consumer carries on:
    /// tearing down here would leave producers blocked on a full ring.
    ///
    fn stabilize(&mut self) {
        match self.engine.stabilize() {
            Ok(nodes_stabilized) => {
                self.stats.passes_run.fetch_add(1, Ordering::Relaxed);
                if let Some(post_stabilize) = self.post_stabilize.as_mut() {
                    post_stabilize(&self.engine, self.engine.epoch(), nodes_stabilized);
                }
            }
            Err(GraphError::EngineUnhealthy) => {
                // Already surfaced when the pass first failed; keep consuming so the ring
                // drains, and leave recovery to the operator.
                self.stats.pass_failures.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                log::warn!("Stabilization failed in the ingest consumer: {error}");
                let _ = self.errors.send(error);
                self.stats.pass_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Consumes whatever is still pending, bounded by the drain deadline, and runs a final
    /// pass if anything was applied.
    fn drain(&mut self) {
        let deadline = Instant::now() + self.config.drain_timeout;
        let mut applied_any = false;
        while Instant::now() < deadline {
            match self.receiver.try_recv() {
                Ok(event) => {
                    self.apply(event);
                    applied_any = true;
                }
                Err(_) => break,
            }
        }
        if applied_any {
            self.stabilize();
        }
    }
}
