// SPDX-License-Identifier: AGPL-3.0-or-later
// Spillway - Disk-Spilling Distinct Collections for Dataflow Execution
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! End-to-end tests for the disk-spilling distinct bag
//!
//! Property-based coverage of the core contract: for any sequence of
//! adds with spills interleaved at arbitrary points, iteration yields
//! each distinct input exactly once, in ascending order — plus the
//! supported producer/consumer overlap, a spill racing a live
//! iterator.

use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::mpsc;
use tempfile::tempdir;

use spillway_core::{Tuple, Value};
use spillway_storage::{BagConfig, DistinctBag};

fn tuple(i: i64) -> Tuple {
    Tuple::new(vec![Value::Int(i)])
}

fn bag_with_fan_in(dir: &std::path::Path, fan_in: usize) -> DistinctBag {
    DistinctBag::new(BagConfig {
        spill_dir: dir.to_path_buf(),
        fan_in,
    })
    .unwrap()
}

fn drain(bag: &DistinctBag) -> Vec<Tuple> {
    bag.iter()
        .unwrap()
        .collect::<spillway_core::Result<Vec<_>>>()
        .unwrap()
}

#[test]
fn concurrent_producers_then_drain() {
    let dir = tempdir().unwrap();
    let bag = bag_with_fan_in(dir.path(), 100);

    std::thread::scope(|s| {
        for worker in 0i64..4 {
            let bag = &bag;
            s.spawn(move || {
                // Overlapping ranges so every worker duplicates some
                // of its neighbours' tuples.
                for i in (worker * 100)..(worker * 100 + 150) {
                    bag.add(tuple(i));
                    if i % 70 == 0 {
                        bag.spill().unwrap();
                    }
                }
            });
        }
    });

    let got = drain(&bag);
    let expected: Vec<Tuple> = (0..450).map(tuple).collect();
    assert_eq!(got, expected);
}

#[test]
fn spill_racing_a_live_iterator() {
    let dir = tempdir().unwrap();
    let bag = bag_with_fan_in(dir.path(), 100);

    for i in 0..1000 {
        bag.add(tuple(i));
    }
    bag.spill().unwrap();
    for i in 500..1500 {
        bag.add(tuple(i));
    }

    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (spilled_tx, spilled_rx) = mpsc::channel::<()>();

    std::thread::scope(|s| {
        let producer = {
            let bag = &bag;
            s.spawn(move || {
                started_rx.recv().unwrap();
                bag.spill().unwrap();
                spilled_tx.send(()).unwrap();
            })
        };

        let mut it = bag.iter().unwrap();
        let mut got = Vec::new();
        for _ in 0..100 {
            got.push(it.next_tuple().unwrap().unwrap());
        }

        // Let the producer flush the rest of memory out from under the
        // iterator, then keep consuming.
        started_tx.send(()).unwrap();
        spilled_rx.recv().unwrap();

        while let Some(t) = it.next_tuple().unwrap() {
            got.push(t);
        }
        producer.join().unwrap();

        let expected: Vec<Tuple> = (0..1500).map(tuple).collect();
        assert_eq!(got, expected);
    });
}

#[test]
fn heavy_spilling_with_tiny_fan_in() {
    // Many more runs than the fan-in bound; the first drain has to
    // pre-merge before it can start.
    let dir = tempdir().unwrap();
    let bag = bag_with_fan_in(dir.path(), 4);

    for batch in 0i64..20 {
        for i in 0..25 {
            bag.add(tuple((batch * 13 + i * 7) % 199));
        }
        bag.spill().unwrap();
    }
    assert_eq!(bag.run_count(), 20);

    let mut expected = BTreeSet::new();
    for batch in 0i64..20 {
        for i in 0..25 {
            expected.insert(tuple((batch * 13 + i * 7) % 199));
        }
    }

    assert_eq!(drain(&bag), expected.into_iter().collect::<Vec<_>>());
    assert!(bag.run_count() <= 4);
}

proptest! {
    /// Any add sequence with spills at arbitrary points drains to the
    /// sorted distinct set.
    #[test]
    fn drains_to_sorted_distinct_set(
        values in prop::collection::vec(-50i64..50, 0..400),
        spill_every in 1usize..40,
    ) {
        let dir = tempdir().unwrap();
        let bag = bag_with_fan_in(dir.path(), 5);

        for (n, &v) in values.iter().enumerate() {
            bag.add(tuple(v));
            if (n + 1) % spill_every == 0 {
                bag.spill().unwrap();
            }
        }

        let expected: Vec<Tuple> = values
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(tuple)
            .collect();
        prop_assert_eq!(drain(&bag), expected);
    }

    /// Adding the same tuple many times yields one occurrence.
    #[test]
    fn repeated_adds_collapse(copies in 2usize..20) {
        let dir = tempdir().unwrap();
        let bag = bag_with_fan_in(dir.path(), 100);

        for _ in 0..copies {
            bag.add(tuple(7));
        }
        prop_assert_eq!(bag.len(), 1);
        prop_assert_eq!(drain(&bag), vec![tuple(7)]);
    }
}
