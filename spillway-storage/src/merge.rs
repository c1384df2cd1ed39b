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

//! K-way merge iteration over memory and spill runs
//!
//! [`DrainIter`] produces the bag's distinct tuples in ascending
//! order. It has to cope with two things an ordinary merge does not:
//!
//! 1. Data lives partly in memory and partly in any number of on-disk
//!    runs, all of which must be merged with duplicates suppressed
//!    both across and within sources.
//! 2. The bag may spill *while* the iterator is mid-read. The iterator
//!    then switches from the in-memory sequence to the freshly written
//!    run by fast-forwarding past exactly the tuples it already
//!    delivered — valid because a spill always flushes the entire
//!    remaining sorted memory content, so the new run is prefix-aligned
//!    with what went out already.
//!
//! ## Working set
//!
//! The merge keeps at most one pending candidate per active source in
//! a `BTreeSet` ordered by tuple value. Refilling a slot reads from
//! that source *until an insert succeeds*: a failed insert means an
//! equal tuple is already pending from some source, so the duplicate
//! is simply dropped and reading continues. Source exhaustion on
//! refill is expected and permanently retires the slot.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use spillway_core::{Result, SpillwayError, Tuple};

use crate::bag::{BagInner, Contents, DistinctBag};
use crate::run::{RunReader, RunStore};

/// Progress is reported every 1 024 `next` calls.
const DRAIN_PROGRESS_MASK: u64 = 0x3ff;

/// Where a pending merge candidate was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Memory,
    Run(usize),
}

/// One pending (tuple, source) pair in the merge working set.
///
/// Equality and ordering deliberately ignore the source: the working
/// set is a `BTreeSet<MergeCandidate>`, so with tuple-only equality a
/// failed insert *is* the cross-source duplicate suppression. At most
/// one candidate per distinct tuple value can ever be pending.
#[derive(Debug)]
struct MergeCandidate {
    tuple: Tuple,
    source: Source,
}

impl PartialEq for MergeCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.tuple == other.tuple
    }
}

impl Eq for MergeCandidate {}

impl PartialOrd for MergeCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.tuple.cmp(&other.tuple)
    }
}

struct MergeState {
    /// Ordered working set, at most one candidate per active source
    set: BTreeSet<MergeCandidate>,
    /// Open reader per run, indexed like the bag's run list; `None`
    /// once a run is exhausted and its handle retired
    streams: Vec<Option<RunReader>>,
}

impl MergeState {
    fn empty() -> Self {
        Self {
            set: BTreeSet::new(),
            streams: Vec::new(),
        }
    }
}

/// Read from run `idx` until a unique tuple lands in the working set
/// or the run is exhausted (which retires its slot for good).
fn refill_from_run(
    set: &mut BTreeSet<MergeCandidate>,
    streams: &mut [Option<RunReader>],
    idx: usize,
) -> Result<()> {
    loop {
        let next = match streams[idx].as_mut() {
            Some(reader) => reader.read_next()?,
            None => return Ok(()),
        };
        match next {
            Some(tuple) => {
                let unique = set.insert(MergeCandidate {
                    tuple,
                    source: Source::Run(idx),
                });
                if unique {
                    return Ok(());
                }
            }
            None => {
                streams[idx] = None;
                return Ok(());
            }
        }
    }
}

/// Same refill protocol against the in-memory sequence. Caller holds
/// the bag lock. Memory may have been spilled empty since its last
/// candidate was queued; that just means nothing more gets added.
fn refill_from_memory(set: &mut BTreeSet<MergeCandidate>, inner: &mut BagInner) {
    while let Some(tuple) = inner.read_from_memory() {
        let unique = set.insert(MergeCandidate {
            tuple,
            source: Source::Memory,
        });
        if unique {
            return;
        }
    }
}

/// Iterator over the bag's distinct tuples in ascending order.
///
/// Exactly one per bag at a time; `add` must not be called once it
/// exists. The one producer-side operation allowed to race it is
/// [`DistinctBag::spill`].
pub struct DrainIter<'a> {
    bag: &'a DistinctBag,
    /// One-element lookahead so `has_next` can probe without losing
    /// the tuple it found
    lookahead: Option<Tuple>,
    merge: Option<MergeState>,
    calls: u64,
}

impl<'a> DrainIter<'a> {
    pub(crate) fn new(bag: &'a DistinctBag) -> Result<Self> {
        let mut inner = bag.inner.lock();
        if let Contents::Accumulating(_) = inner.contents {
            // Bound the number of runs the steady-state merge will
            // hold open, before memory is committed to its sorted
            // form.
            pre_merge(&mut inner, &bag.store, bag.fan_in)?;

            // First reader: sort now, in case the bag spills under us
            // later — the written order and our read order must agree.
            let previous = std::mem::replace(
                &mut inner.contents,
                Contents::Draining {
                    sorted: Vec::new(),
                    cursor: 0,
                },
            );
            if let Contents::Accumulating(set) = previous {
                let mut sorted: Vec<Tuple> = set.into_iter().collect();
                sorted.sort_unstable();
                inner.contents = Contents::Draining { sorted, cursor: 0 };
            }
        }
        drop(inner);

        Ok(Self {
            bag,
            lookahead: None,
            merge: None,
            calls: 0,
        })
    }

    /// Whether another tuple is available. Buffers the probed tuple so
    /// the following [`next_tuple`](Self::next_tuple) returns it.
    pub fn has_next(&mut self) -> Result<bool> {
        if self.lookahead.is_none() {
            self.lookahead = self.next_tuple()?;
        }
        Ok(self.lookahead.is_some())
    }

    /// Produce the next tuple, or `Ok(None)` once every source is
    /// exhausted.
    pub fn next_tuple(&mut self) -> Result<Option<Tuple>> {
        let call = self.calls;
        self.calls += 1;
        if call & DRAIN_PROGRESS_MASK == 0 {
            if let Some(progress) = &self.bag.progress {
                progress();
            }
        }

        if let Some(tuple) = self.lookahead.take() {
            return Ok(Some(tuple));
        }

        // Fast path and spill detection happen under the bag lock; the
        // fast-forward I/O itself runs outside it.
        let mut spilled_under_us = None;
        {
            let mut inner = self.bag.inner.lock();
            if inner.runs.is_empty() {
                return Ok(inner.read_from_memory());
            }
            if inner.delivered_from_memory() > 0 && inner.memory_is_empty() {
                // Memory was handed out from and has since been
                // flushed: a spill happened mid-read. The run to
                // resync against is necessarily the newest one —
                // spill never writes empty files and add() stopped
                // before we started.
                let newest = inner.runs.len() - 1;
                let delivered = inner.take_memory_cursor();
                spilled_under_us = Some((delivered, newest, inner.runs[newest].clone()));
            }
        }

        if let Some((delivered, idx, path)) = spilled_under_us {
            self.resync_with_spilled_run(delivered, idx, &path)?;
        }

        self.read_from_tree()
    }

    /// Open the run that a concurrent spill just wrote, skip the
    /// tuples the consumer already received, and seed the working set
    /// with the run's first undelivered tuple.
    fn resync_with_spilled_run(&mut self, delivered: usize, idx: usize, path: &Path) -> Result<()> {
        let mut reader = self.bag.store.open_run(path)?;
        for skipped in 0..delivered {
            match reader.read_next()? {
                Some(_) => {}
                None => {
                    // The run must contain at least everything already
                    // delivered from memory; running out here means
                    // the file is not the one we wrote.
                    error!(
                        path = %path.display(),
                        expected = delivered,
                        found = skipped,
                        "spill run ended during fast-forward"
                    );
                    return Err(SpillwayError::RunTruncated {
                        path: path.to_path_buf(),
                        expected: delivered as u64,
                        found: skipped as u64,
                    });
                }
            }
        }

        let state = self.merge.get_or_insert_with(MergeState::empty);
        debug_assert_eq!(state.streams.len(), idx, "run appeared without a spill");
        state.streams.push(Some(reader));
        refill_from_run(&mut state.set, &mut state.streams, idx)?;
        Ok(())
    }

    /// Steady-state merge step: pop the minimum candidate, refill its
    /// source's slot, return the tuple.
    fn read_from_tree(&mut self) -> Result<Option<Tuple>> {
        if self.merge.is_none() {
            self.merge = Some(self.init_merge()?);
        }
        let bag = self.bag;
        let Some(state) = self.merge.as_mut() else {
            return Ok(None);
        };
        let Some(candidate) = state.set.pop_first() else {
            return Ok(None);
        };

        match candidate.source {
            Source::Memory => {
                let mut inner = bag.inner.lock();
                refill_from_memory(&mut state.set, &mut inner);
            }
            Source::Run(idx) => refill_from_run(&mut state.set, &mut state.streams, idx)?,
        }

        Ok(Some(candidate.tuple))
    }

    /// First merge step: open every run, seed one candidate per run,
    /// then prime one from memory if it still holds unread tuples.
    /// Runs under the bag lock so a spill cannot slip a new run in
    /// between the list walk and the memory priming.
    fn init_merge(&self) -> Result<MergeState> {
        let mut inner = self.bag.inner.lock();
        let mut state = MergeState {
            set: BTreeSet::new(),
            // One extra slot in case a spill arrives later
            streams: Vec::with_capacity(inner.runs.len() + 1),
        };

        let run_paths = inner.runs.clone();
        for path in &run_paths {
            state.streams.push(Some(self.bag.store.open_run(path)?));
            let idx = state.streams.len() - 1;
            refill_from_run(&mut state.set, &mut state.streams, idx)?;
        }

        if !inner.memory_is_empty() {
            refill_from_memory(&mut state.set, &mut inner);
        }
        Ok(state)
    }
}

impl Iterator for DrainIter<'_> {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_tuple() {
            Ok(Some(tuple)) => Some(Ok(tuple)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Merge the oldest runs into fewer, larger ones until at most
/// `fan_in` remain. Runs once, at the moment the first merge begins,
/// with the bag lock held throughout.
///
/// Each pass opens the `fan_in` oldest runs, merges them with the same
/// duplicate-suppressing working set the live merge uses, appends the
/// result as the newest run and drops the consumed ones from the list.
/// Errors here are fatal: this rewrites runs the bag itself created,
/// so any I/O problem is an invariant violation.
pub(crate) fn pre_merge(inner: &mut BagInner, store: &RunStore, fan_in: usize) -> Result<()> {
    // Enforced at bag construction: each pass below removes fan_in
    // runs and adds one back, which only makes progress from 2 up.
    debug_assert!(fan_in >= 2);
    if inner.runs.len() <= fan_in {
        return Ok(());
    }
    debug!(
        runs = inner.runs.len(),
        fan_in, "pre-merging spill runs to bound merge fan-in"
    );

    while inner.runs.len() > fan_in {
        let consumed: Vec<PathBuf> = inner.runs.drain(..fan_in).collect();

        let mut set = BTreeSet::new();
        let mut streams: Vec<Option<RunReader>> = Vec::with_capacity(consumed.len());
        for path in &consumed {
            streams.push(Some(store.open_run(path)?));
            let idx = streams.len() - 1;
            refill_from_run(&mut set, &mut streams, idx)?;
        }

        let (out_path, mut writer) = store.create_run()?;
        let mut written = 0u64;
        while let Some(candidate) = set.pop_first() {
            writer.write(&candidate.tuple)?;
            written += 1;
            if let Source::Run(idx) = candidate.source {
                refill_from_run(&mut set, &mut streams, idx)?;
            }
        }
        writer.finish()?;

        inner.runs.push(out_path);
        debug!(
            consumed = consumed.len(),
            written, "pre-merge pass finished"
        );
    }
    Ok(())
}
