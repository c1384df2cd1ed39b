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

//! Disk-spilling distinct tuple bag
//!
//! An unordered collection of tuples with no multiples. Data is
//! deduplicated as it arrives into an in-memory hash set; when memory
//! pressure triggers [`DistinctBag::spill`], the current content is
//! sorted and flushed to an on-disk run. Iteration merges memory and
//! all runs back into one deduplicated, ascending sequence.
//!
//! ## Two in-memory representations
//!
//! ```text
//! Accumulating: HashSet<Tuple>           (unordered, dedup inserts)
//!        │  first iteration request
//!        ▼
//! Draining: sorted Vec<Tuple> + cursor   (stable order, random access)
//! ```
//!
//! The switch happens eagerly on the *first read*, not on the next
//! spill: once reading has begun, any later spill must write exactly
//! the order the consumer will expect, and a hash set has no stable
//! order to offer. A spill taken while draining therefore writes the
//! already-sorted sequence as is.
//!
//! ## Concurrency
//!
//! One mutex guards the representation, the run list and the distinct
//! counter. Producers may `add` concurrently before iteration starts;
//! the only supported overlap after that is `spill` racing a consumer,
//! which the merge iterator resolves by fast-forwarding into the
//! freshly written run (see [`crate::merge`]).

use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

use spillway_core::{Result, SpillwayError, Tuple};

use crate::config::BagConfig;
use crate::merge::DrainIter;
use crate::run::{RunStore, RunWriter};

/// Liveness callback invoked periodically during long spills and
/// drains. Must be cheap and must never fail.
pub type ProgressFn = Arc<dyn Fn() + Send + Sync>;

/// Progress is reported every 16 384 tuples written by a spill.
const SPILL_PROGRESS_MASK: u64 = 0x3fff;

static NEXT_BAG_ID: AtomicU64 = AtomicU64::new(0);

/// The bag's in-memory representation, as an explicit tagged state so
/// the sort-before-first-read rule is structural rather than a
/// convention.
pub(crate) enum Contents {
    /// Unordered dedup set; the initial state
    Accumulating(HashSet<Tuple>),
    /// Sorted remainder plus a read cursor counting tuples already
    /// handed to the consumer. A spill clears `sorted` but leaves the
    /// cursor alone — that is how the iterator later notices the spill
    /// and knows how far to fast-forward.
    Draining { sorted: Vec<Tuple>, cursor: usize },
}

pub(crate) struct BagInner {
    pub(crate) contents: Contents,
    /// Append-only, age-ordered list of on-disk runs
    pub(crate) runs: Vec<PathBuf>,
    /// Distinct tuples ever accumulated or merged in, independent of
    /// where they currently live
    pub(crate) distinct: u64,
}

impl BagInner {
    pub(crate) fn memory_is_empty(&self) -> bool {
        match &self.contents {
            Contents::Accumulating(set) => set.is_empty(),
            Contents::Draining { sorted, .. } => sorted.is_empty(),
        }
    }

    /// Tuples already delivered to the consumer out of memory.
    pub(crate) fn delivered_from_memory(&self) -> usize {
        match &self.contents {
            Contents::Accumulating(_) => 0,
            Contents::Draining { cursor, .. } => *cursor,
        }
    }

    /// Reset the read cursor after a fast-forward, returning its old
    /// value.
    pub(crate) fn take_memory_cursor(&mut self) -> usize {
        match &mut self.contents {
            Contents::Accumulating(_) => 0,
            Contents::Draining { cursor, .. } => std::mem::take(cursor),
        }
    }

    /// Pop the next undelivered in-memory tuple. Caller holds the bag
    /// lock; only meaningful while draining.
    pub(crate) fn read_from_memory(&mut self) -> Option<Tuple> {
        match &mut self.contents {
            Contents::Accumulating(_) => None,
            Contents::Draining { sorted, cursor } => {
                if *cursor < sorted.len() {
                    let tuple = sorted[*cursor].clone();
                    *cursor += 1;
                    Some(tuple)
                } else {
                    None
                }
            }
        }
    }
}

/// An unordered, deduplicating, disk-spilling collection of tuples.
pub struct DistinctBag {
    pub(crate) inner: Mutex<BagInner>,
    pub(crate) store: RunStore,
    pub(crate) fan_in: usize,
    pub(crate) progress: Option<ProgressFn>,
}

impl std::fmt::Debug for DistinctBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistinctBag")
            .field("store", &self.store)
            .field("fan_in", &self.fan_in)
            .finish_non_exhaustive()
    }
}

impl DistinctBag {
    /// Create an empty bag. Its runs live in a private subdirectory of
    /// `config.spill_dir`, named after the bag's identity.
    ///
    /// Rejects `fan_in` below 2: a pre-merge pass consumes `fan_in`
    /// runs and appends one, so anything smaller cannot reduce the run
    /// count.
    pub fn new(config: BagConfig) -> Result<Self> {
        if config.fan_in < 2 {
            return Err(SpillwayError::Config(format!(
                "fan_in must be at least 2, got {}",
                config.fan_in
            )));
        }
        let id = NEXT_BAG_ID.fetch_add(1, Ordering::Relaxed);
        let dir = config
            .spill_dir
            .join(format!("bag-{}-{id}", std::process::id()));
        Ok(Self {
            inner: Mutex::new(BagInner {
                contents: Contents::Accumulating(HashSet::new()),
                runs: Vec::new(),
                distinct: 0,
            }),
            store: RunStore::new(dir)?,
            fan_in: config.fan_in,
            progress: None,
        })
    }

    /// Install a liveness callback, fired every 16 384 tuples during a
    /// spill and every 1 024 calls during iteration.
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Insert one tuple, ignoring it if an equal one is already
    /// present.
    ///
    /// Precondition: no `add` once the first iterator has been
    /// requested. This is not independently enforced in release
    /// builds.
    pub fn add(&self, tuple: Tuple) {
        let mut inner = self.inner.lock();
        let BagInner {
            contents, distinct, ..
        } = &mut *inner;
        match contents {
            Contents::Accumulating(set) => {
                if set.insert(tuple) {
                    *distinct += 1;
                }
            }
            Contents::Draining { .. } => {
                debug_assert!(false, "add called after draining started");
            }
        }
    }

    /// Merge another bag's full contents — including anything it has
    /// already spilled — into this one.
    ///
    /// The counter bookkeeping adds the source's size up front and
    /// backs out one per duplicate found, leaving it equal to the
    /// final distinct count. Same precondition as [`DistinctBag::add`];
    /// `other` is drained by this call.
    pub fn add_all(&self, other: &DistinctBag) -> Result<()> {
        let mut source = other.iter()?;
        let mut inner = self.inner.lock();
        inner.distinct += other.len();
        while let Some(tuple) = source.next_tuple()? {
            let BagInner {
                contents, distinct, ..
            } = &mut *inner;
            match contents {
                Contents::Accumulating(set) => {
                    if !set.insert(tuple) {
                        *distinct -= 1;
                    }
                }
                Contents::Draining { .. } => {
                    debug_assert!(false, "add_all called after draining started");
                }
            }
        }
        Ok(())
    }

    /// Flush the current in-memory content to a new on-disk run and
    /// clear memory. Returns the number of tuples written.
    ///
    /// An empty bag spills nothing and creates no file. A write
    /// failure abandons the new run (it is removed from the run list
    /// again), is logged, and reports zero spilled; the in-memory
    /// content is assumed still intact and left in place.
    pub fn spill(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.memory_is_empty() {
            return Ok(0);
        }

        let (path, writer) = match self.store.create_run() {
            Ok(created) => created,
            Err(e) => {
                error!(error = %e, "unable to create spill run file");
                return Ok(0);
            }
        };
        inner.runs.push(path);

        // While accumulating the set has no order, so sort a snapshot;
        // while draining the sequence is already sorted and must be
        // written exactly as the consumer will expect it.
        let written = match &inner.contents {
            Contents::Accumulating(set) => {
                let mut snapshot: Vec<&Tuple> = set.iter().collect();
                snapshot.sort_unstable();
                self.write_run(writer, snapshot.into_iter())
            }
            Contents::Draining { sorted, .. } => self.write_run(writer, sorted.iter()),
        };

        match written {
            Ok(spilled) => {
                match &mut inner.contents {
                    Contents::Accumulating(set) => set.clear(),
                    // The cursor survives the clear: the run just
                    // written holds the whole sorted sequence,
                    // delivered prefix included, so the iterator can
                    // fast-forward past cursor-many records.
                    Contents::Draining { sorted, .. } => sorted.clear(),
                }
                Ok(spilled)
            }
            Err(e) => {
                inner.runs.pop();
                error!(error = %e, "unable to spill bag contents to disk");
                Ok(0)
            }
        }
    }

    fn write_run<'t>(
        &self,
        mut writer: RunWriter,
        tuples: impl Iterator<Item = &'t Tuple>,
    ) -> Result<u64> {
        let mut spilled = 0u64;
        for tuple in tuples {
            writer.write(tuple)?;
            spilled += 1;
            if spilled & SPILL_PROGRESS_MASK == 0 {
                if let Some(progress) = &self.progress {
                    progress();
                }
            }
        }
        writer.finish()?;
        Ok(spilled)
    }

    /// Number of distinct tuples in the bag, wherever they live.
    pub fn len(&self) -> u64 {
        self.inner.lock().distinct
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of on-disk runs currently backing the bag.
    pub fn run_count(&self) -> usize {
        self.inner.lock().runs.len()
    }

    /// Begin draining: returns the iterator over all distinct tuples
    /// in ascending order, merging memory and every run.
    ///
    /// The first call irreversibly converts the in-memory
    /// representation to its sorted form and, if the run count exceeds
    /// the fan-in bound, pre-merges the oldest runs first. At most one
    /// iterator may exist per bag at a time.
    pub fn iter(&self) -> Result<DrainIter<'_>> {
        DrainIter::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BagConfig;
    use spillway_core::Value;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn tuple(i: i64, s: &str) -> Tuple {
        Tuple::new(vec![Value::Int(i), Value::Str(s.into())])
    }

    fn bag_in(dir: &std::path::Path) -> DistinctBag {
        DistinctBag::new(BagConfig {
            spill_dir: dir.to_path_buf(),
            fan_in: DEFAULT_TEST_FAN_IN,
        })
        .unwrap()
    }

    const DEFAULT_TEST_FAN_IN: usize = 100;

    #[test]
    fn test_add_deduplicates_and_counts() {
        let dir = tempdir().unwrap();
        let bag = bag_in(dir.path());

        bag.add(tuple(1, "a"));
        bag.add(tuple(1, "a"));
        bag.add(tuple(2, "b"));
        assert_eq!(bag.len(), 2);
    }

    #[test]
    fn test_fan_in_below_two_is_rejected() {
        let dir = tempdir().unwrap();
        for fan_in in [0, 1] {
            let err = DistinctBag::new(BagConfig {
                spill_dir: dir.path().to_path_buf(),
                fan_in,
            })
            .unwrap_err();
            assert!(matches!(err, SpillwayError::Config(_)));
        }
    }

    #[test]
    fn test_failed_spill_leaves_bag_usable() {
        let dir = tempdir().unwrap();
        let bag = bag_in(dir.path());
        for i in 0..5 {
            bag.add(tuple(i, "v"));
        }

        // Make run creation fail under the spill.
        std::fs::remove_dir_all(bag.store.dir()).unwrap();

        assert_eq!(bag.spill().unwrap(), 0);
        assert_eq!(bag.run_count(), 0);
        assert_eq!(bag.len(), 5);

        // Memory was left intact, so draining still yields everything.
        let got: Result<Vec<_>> = bag.iter().unwrap().collect();
        assert_eq!(got.unwrap(), (0..5).map(|i| tuple(i, "v")).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_spill_is_a_no_op() {
        let dir = tempdir().unwrap();
        let bag = bag_in(dir.path());

        assert_eq!(bag.spill().unwrap(), 0);
        assert_eq!(bag.run_count(), 0);
    }

    #[test]
    fn test_spill_writes_sorted_run_and_clears_memory() {
        let dir = tempdir().unwrap();
        let bag = bag_in(dir.path());

        bag.add(tuple(2, "b"));
        bag.add(tuple(1, "a"));
        bag.add(tuple(1, "a"));

        assert_eq!(bag.spill().unwrap(), 2);
        assert_eq!(bag.run_count(), 1);
        // logical counter is unaffected by where the tuples live
        assert_eq!(bag.len(), 2);
        // memory is now empty, so a second spill is a no-op
        assert_eq!(bag.spill().unwrap(), 0);
        assert_eq!(bag.run_count(), 1);

        let run = bag.inner.lock().runs[0].clone();
        let mut reader = bag.store.open_run(&run).unwrap();
        assert_eq!(reader.read_next().unwrap(), Some(tuple(1, "a")));
        assert_eq!(reader.read_next().unwrap(), Some(tuple(2, "b")));
        assert_eq!(reader.read_next().unwrap(), None);
    }

    #[test]
    fn test_add_all_counter_equals_final_distinct_count() {
        let dir = tempdir().unwrap();
        let a = bag_in(dir.path());
        let b = bag_in(dir.path());

        a.add(tuple(1, "x"));
        a.add(tuple(2, "y"));
        b.add(tuple(2, "y"));
        b.add(tuple(3, "z"));

        a.add_all(&b).unwrap();
        assert_eq!(a.len(), 3);

        let got: Result<Vec<_>> = a.iter().unwrap().collect();
        assert_eq!(
            got.unwrap(),
            vec![tuple(1, "x"), tuple(2, "y"), tuple(3, "z")]
        );
    }

    #[test]
    fn test_add_all_pulls_in_spilled_content() {
        let dir = tempdir().unwrap();
        let a = bag_in(dir.path());
        let b = bag_in(dir.path());

        b.add(tuple(1, "x"));
        b.add(tuple(2, "y"));
        b.spill().unwrap();
        b.add(tuple(3, "z"));

        a.add_all(&b).unwrap();
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_concurrent_producers_serialize_on_the_lock() {
        let dir = tempdir().unwrap();
        let bag = bag_in(dir.path());

        std::thread::scope(|s| {
            for _ in 0..4 {
                let bag = &bag;
                s.spawn(move || {
                    // every worker inserts the same 250 tuples
                    for i in 0..250 {
                        bag.add(tuple(i, "shared"));
                    }
                });
            }
        });
        assert_eq!(bag.len(), 250);
    }

    #[test]
    fn test_progress_fires_during_large_spill() {
        let dir = tempdir().unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let bag = bag_in(dir.path()).with_progress(Arc::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        for i in 0..20_000 {
            bag.add(Tuple::new(vec![Value::Int(i)]));
        }
        assert_eq!(bag.spill().unwrap(), 20_000);
        // one tick at the 16 384th written tuple
        assert_eq!(ticks.load(Ordering::Relaxed), 1);
    }
}
