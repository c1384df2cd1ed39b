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

//! Spillway Core
//!
//! Fundamental types shared by the Spillway collection crates:
//!
//! - **Tuple model**: immutable typed records with a total order and
//!   hash/equality semantics that agree with it
//! - **Binary codec**: compact little-endian record encoding used for
//!   on-disk spill runs
//! - **Error taxonomy**: one crate-wide error enum that keeps
//!   "expected end of data" and "our own file went bad" apart

pub mod codec;
pub mod error;
pub mod tuple;

pub use codec::{read_tuple, write_tuple};
pub use error::{Result, SpillwayError};
pub use tuple::{Tuple, Value};
