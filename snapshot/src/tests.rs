// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::SnapshotHub;

fn watch(names: &[(&str, usize)]) -> Vec<(String, usize)> {
    names
        .iter()
        .map(|&(name, topo_index)| (name.to_owned(), topo_index))
        .collect()
}

#[test]
fn reader_sees_nan_before_first_publish() {
    let mut hub = SnapshotHub::new();
    let mut reader = hub.add_scope(watch(&[("mid", 2), ("spread", 3)]));
    reader.refresh();
    assert!(reader.get("mid").unwrap().is_nan());
    assert!(reader.get("spread").unwrap().is_nan());
    assert!(reader.get("vwap").is_none());
}

#[test]
fn reader_adopts_published_values_on_refresh() {
    let mut hub = SnapshotHub::new();
    let mut reader = hub.add_scope(watch(&[("mid", 10), ("spread", 11)]));

    let values = [0.0; 10].iter().copied().chain([100.0, 1.5]).collect::<Vec<f64>>();
    hub.publish(|topo_index| values[topo_index]);

    // Nothing moves until the reader swaps.
    assert!(reader.get("mid").unwrap().is_nan());
    reader.refresh();
    assert_eq!(reader.get("mid"), Some(100.0));
    assert_eq!(reader.get("spread"), Some(1.5));
    assert_eq!(reader.get_index(0), Some(100.0));
    assert_eq!(reader.get_index(1), Some(1.5));
    assert_eq!(reader.get_index(2), None);
}

#[test]
fn stale_view_is_retained_until_next_refresh() {
    let mut hub = SnapshotHub::new();
    let mut reader = hub.add_scope(watch(&[("px", 0)]));

    hub.publish(|_| 1.0);
    reader.refresh();
    assert_eq!(reader.get("px"), Some(1.0));

    hub.publish(|_| 2.0);
    hub.publish(|_| 3.0);
    // The adopted snapshot is stable across publishes.
    assert_eq!(reader.get("px"), Some(1.0));
    reader.refresh();
    assert_eq!(reader.get("px"), Some(3.0));
}

#[test]
fn read_one_returns_the_latest_value() {
    let mut hub = SnapshotHub::new();
    let mut reader = hub.add_scope(watch(&[("px", 0)]));
    hub.publish(|_| 41.0);
    assert_eq!(reader.read_one("px"), Some(41.0));
    hub.publish(|_| 42.0);
    assert_eq!(reader.read_one("px"), Some(42.0));
}

#[test]
fn scopes_are_independent() {
    let mut hub = SnapshotHub::new();
    let mut quotes = hub.add_scope(watch(&[("bid", 0), ("ask", 1)]));
    let mut risk = hub.add_scope(watch(&[("delta", 5)]));
    assert_eq!(hub.scope_count(), 2);

    hub.publish(|topo_index| topo_index as f64);
    quotes.refresh();
    risk.refresh();
    assert_eq!(quotes.get("bid"), Some(0.0));
    assert_eq!(quotes.get("ask"), Some(1.0));
    assert_eq!(risk.get("delta"), Some(5.0));
}

///
/// The central guarantee: a refreshed view is the complete output of a single publish, never a
/// mix of two. The writer publishes rows of identical values; any torn or mixed view would
/// surface as unequal elements.
///
#[test]
fn refreshed_views_are_never_mixed_across_publishes() {
    const WATCHED: usize = 8;
    const PASSES: u64 = 50_000;

    let mut hub = SnapshotHub::new();
    let watched: Vec<(String, usize)> = (0..WATCHED)
        .map(|position| (format!("node{position}"), position))
        .collect();
    let mut reader = hub.add_scope(watched);
    let stop = Arc::new(AtomicBool::new(false));

    let reader_stop = stop.clone();
    let reader_thread = thread::spawn(move || {
        let mut observed_max = f64::NAN;
        while !reader_stop.load(Ordering::Relaxed) {
            reader.refresh();
            let first = reader.get_index(0).unwrap();
            for position in 1..WATCHED {
                let value = reader.get_index(position).unwrap();
                assert!(
                    (value.is_nan() && first.is_nan()) || value == first,
                    "mixed snapshot: position 0 = {first}, position {position} = {value}"
                );
            }
            if !first.is_nan() {
                // Publishes are monotone, so adopted snapshots must be too.
                assert!(observed_max.is_nan() || first >= observed_max);
                observed_max = first;
            }
        }
    });

    for pass in 0..PASSES {
        hub.publish(|_| pass as f64);
    }
    stop.store(true, Ordering::Relaxed);
    reader_thread.join().unwrap();
}
