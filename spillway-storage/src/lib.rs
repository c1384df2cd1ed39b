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

//! Spillway Storage
//!
//! The disk-spilling distinct tuple bag used by dataflow operators
//! whose working set may not fit in memory.
//!
//! # Components
//!
//! - [`DistinctBag`] - deduplicating collection with a dual in-memory
//!   representation and transparent overflow to disk
//! - [`DrainIter`] - k-way merge iterator over memory plus all spill
//!   runs, tolerant of spills racing the iteration
//! - [`RunStore`] - per-bag allocator for sorted on-disk run files
//! - [`BagConfig`] - spill directory and merge fan-in bound
//!
//! # Example
//!
//! ```no_run
//! use spillway_core::{Tuple, Value};
//! use spillway_storage::{BagConfig, DistinctBag};
//!
//! # fn main() -> spillway_core::Result<()> {
//! let bag = DistinctBag::new(BagConfig::default())?;
//! bag.add(Tuple::new(vec![Value::Int(2)]));
//! bag.add(Tuple::new(vec![Value::Int(1)]));
//! bag.add(Tuple::new(vec![Value::Int(2)]));
//!
//! bag.spill()?; // e.g. on a memory-pressure signal
//!
//! for tuple in bag.iter()? {
//!     println!("{}", tuple?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bag;
pub mod config;
pub mod merge;
pub mod run;

pub use bag::{DistinctBag, ProgressFn};
pub use config::{BagConfig, DEFAULT_FAN_IN};
pub use merge::DrainIter;
pub use run::{RunReader, RunStore, RunWriter};
