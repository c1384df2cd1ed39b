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

//! Error types for Spillway
//!
//! The taxonomy keeps two failure families strictly apart:
//!
//! - `Io` covers ordinary, potentially transient I/O problems. A failed
//!   spill write lands here and is recovered locally by the caller.
//! - `RunMissing` / `RunTruncated` cover damage to a run file the bag
//!   itself wrote earlier. Those files are self-consistent by
//!   construction, so any problem reading them back signals external
//!   deletion or corruption. They carry no retry semantics.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpillwayError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Corrupt tuple encoding: {0}")]
    Codec(String),

    #[error("Invalid bag configuration: {0}")]
    Config(String),

    #[error("Spill run missing or unreadable: {path}")]
    RunMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Spill run truncated: {path}: expected {expected} records, found {found}")]
    RunTruncated {
        path: PathBuf,
        expected: u64,
        found: u64,
    },
}

impl SpillwayError {
    /// Whether this error is a violated internal invariant rather than
    /// an ordinary environmental failure. Fatal errors must abort the
    /// operation that hit them; retrying is meaningless.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SpillwayError::RunMissing { .. } | SpillwayError::RunTruncated { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SpillwayError>;
