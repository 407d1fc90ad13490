// Copyright 2021-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! The join kernel interface.
//!
//! A launch runs a grid of thread-groups over the source rows of one task.
//! Every group continues from its `GroupState`, which is advanced in place.
//! A launch ends when every group is either done or suspended, because its
//! share of the destination buffer or one of its stacks is full.

pub mod emulated;
pub mod suspend;

pub use emulated::EmulatedDevice;
pub use suspend::{GroupState, NULL_REF};

use crate::error::Result;
use crate::inner_buffer::OuterJoinMaps;
use crate::plan::JoinProgram;
use std::sync::atomic::{AtomicUsize, Ordering};
use xpu_codegen::datum::Datum;
use xpu_runtime::runtime::memory::MemHandle;

/// Rows that feed depth 0 or the sweep depth of the groups
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LaunchSource {
    /// A staged outer chunk
    Outer { handle: MemHandle, nrows: usize },
    /// The unmatched rows of a right or full outer depth
    Sweep { depth: usize },
}

pub struct LaunchArgs<'a> {
    pub program: &'a JoinProgram,
    pub params: &'a [Datum],
    /// The inner buffer replica, as mapped by the calling worker
    pub kmrels: MemHandle,
    pub ojmaps: &'a OuterJoinMaps,
    pub source: LaunchSource,
    pub groups: &'a mut [GroupState],
    /// Capacity of the destination buffer
    pub dst_bytes: usize,
}

/// How a launch ended
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LaunchStatus {
    Done,
    /// At least one group must be resumed
    Suspended,
    /// A group hit a row that only the host can evaluate. The output of the
    /// launch must be discarded.
    CpuReCheck(String),
}

/// Row counts of a launch
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaunchCounters {
    /// Source rows read
    pub source_rows: u64,
    /// Source rows that passed the scan quals
    pub scan_rows: u64,
    /// Entries pushed per depth
    pub depth_rows: Vec<u64>,
}

impl LaunchCounters {
    pub fn new(ndepths: usize) -> Self {
        Self {
            source_rows: 0,
            scan_rows: 0,
            depth_rows: vec![0; ndepths + 1],
        }
    }

    pub fn add(&mut self, other: &LaunchCounters) {
        self.source_rows += other.source_rows;
        self.scan_rows += other.scan_rows;
        if self.depth_rows.len() < other.depth_rows.len() {
            self.depth_rows.resize(other.depth_rows.len(), 0);
        }
        for (s, o) in self.depth_rows.iter_mut().zip(other.depth_rows.iter()) {
            *s += o;
        }
    }
}

pub struct LaunchOutcome {
    pub status: LaunchStatus,
    /// Row images written to the destination buffer
    pub dst: Vec<u8>,
    pub nitems: usize,
    pub counters: LaunchCounters,
}

/// An accelerator that executes join kernels
pub trait JoinKernel: Send + Sync {
    fn device(&self) -> u16;

    /// Index of the device's outer-join map copy.
    fn ojmap_copy(&self) -> usize;

    fn launch(&self, args: LaunchArgs<'_>) -> Result<LaunchOutcome>;
}

/// Makes launch `at_launch` of a device report a host re-check after it ran
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FaultInjection {
    pub at_launch: usize,
}

/// Space accounting of a destination buffer shared by all groups
#[derive(Debug)]
pub(crate) struct DstBuffer {
    capacity: usize,
    usage: AtomicUsize,
}

impl DstBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            usage: AtomicUsize::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserves `len` bytes. Returns `false` if the buffer is full.
    pub(crate) fn reserve(&self, len: usize) -> bool {
        let mut current = self.usage.load(Ordering::SeqCst);
        loop {
            let next = match current.checked_add(len) {
                Some(n) if n <= self.capacity => n,
                _ => return false,
            };
            match self
                .usage
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_respect_capacity() {
        let dst = DstBuffer::new(100);
        assert!(dst.reserve(60));
        assert!(!dst.reserve(41));
        assert!(dst.reserve(40));
        assert!(!dst.reserve(1));
    }
}
