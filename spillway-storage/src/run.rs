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

//! Run files
//!
//! A run is an immutable, sorted, internally duplicate-free sequence
//! of codec-serialized tuples written back to back in one file — no
//! header, no footer. [`RunStore`] hands out sequentially numbered run
//! files inside a per-bag directory; the bag itself owns the ordered
//! list of live runs (insertion order = age order).
//!
//! Deleting run files is the surrounding runtime's job, so nothing
//! here unlinks them.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

use spillway_core::codec;
use spillway_core::{Result, SpillwayError, Tuple};

/// Allocates run files for one bag.
#[derive(Debug)]
pub struct RunStore {
    dir: PathBuf,
    next_run: AtomicU64,
}

impl RunStore {
    /// Create the store, making `dir` (the bag's private run
    /// directory) on the spot.
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            next_run: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate a fresh writable run file.
    pub fn create_run(&self) -> Result<(PathBuf, RunWriter)> {
        let seq = self.next_run.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("run-{seq:06}.spill"));
        let file = File::create(&path)?;
        let writer = RunWriter {
            writer: BufWriter::new(file),
        };
        Ok((path, writer))
    }

    /// Open a previously written run for sequential reading.
    ///
    /// The file was written by this very bag, so failure to open it is
    /// an invariant violation, not a retryable condition.
    pub fn open_run(&self, path: &Path) -> Result<RunReader> {
        let file = File::open(path).map_err(|source| {
            error!(path = %path.display(), error = %source, "unable to open our own spill run");
            SpillwayError::RunMissing {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Ok(RunReader {
            reader: BufReader::new(file),
        })
    }
}

/// Sequential writer over a single run file.
#[derive(Debug)]
pub struct RunWriter {
    writer: BufWriter<File>,
}

impl RunWriter {
    pub fn write(&mut self, tuple: &Tuple) -> Result<()> {
        codec::write_tuple(&mut self.writer, tuple)
    }

    /// Flush buffered records out to the file.
    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Sequential reader over a single run file.
#[derive(Debug)]
pub struct RunReader {
    reader: BufReader<File>,
}

impl RunReader {
    /// Read the next tuple; `Ok(None)` once the run is exhausted.
    pub fn read_next(&mut self) -> Result<Option<Tuple>> {
        codec::read_tuple(&mut self.reader)
    }
}
