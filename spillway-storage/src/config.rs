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

//! Bag configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Maximum number of spill runs merged simultaneously.
///
/// When a bag enters its first merge with more runs than this, the
/// oldest runs are pre-merged into fewer, larger ones until the count
/// fits. Bounds both open file handles and the merge working set; ~100
/// has empirically balanced merge-tree overhead against fan-in cost.
pub const DEFAULT_FAN_IN: usize = 100;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BagConfig {
    /// Directory under which each bag creates its own run subdirectory
    pub spill_dir: PathBuf,
    /// Fan-in bound enforced by the pre-merge pass; must be at least 2
    pub fan_in: usize,
}

impl Default for BagConfig {
    fn default() -> Self {
        Self {
            spill_dir: std::env::temp_dir().join("spillway"),
            fan_in: DEFAULT_FAN_IN,
        }
    }
}
