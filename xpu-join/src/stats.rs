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


//! Runtime statistics of a join.

use crate::kernel::LaunchCounters;
use std::sync::atomic::{AtomicU64, Ordering};
use xpu_runtime::utils::CachePadded;

type Counter = CachePadded<AtomicU64>;

fn counter() -> Counter {
    CachePadded::new(AtomicU64::new(0))
}

/// Counters shared by all workers of a join
#[derive(Debug)]
pub struct JoinStats {
    source_rows: Counter,
    scan_rows: Counter,
    depth_rows: Vec<Counter>,
    right_outer_rows: Counter,
    fallback_rows: Counter,
    fallback_tasks: Counter,
    result_rows: Counter,
    suspends: Counter,
    launches: Counter,
}

/// A point-in-time copy of `JoinStats`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StatsSnapshot {
    /// Outer rows read
    pub source_rows: u64,
    /// Outer rows that passed the scan quals
    pub scan_rows: u64,
    /// Joined rows per depth; index 0 counts the outer rows
    pub depth_rows: Vec<u64>,
    /// Null-extended rows emitted by the unmatched-row sweeps
    pub right_outer_rows: u64,
    /// Result rows produced on the host
    pub fallback_rows: u64,
    /// Tasks completed on the host after a device re-check
    pub fallback_tasks: u64,
    pub result_rows: u64,
    pub suspends: u64,
    pub launches: u64,
}

impl JoinStats {
    pub fn new(ndepths: usize) -> Self {
        Self {
            source_rows: counter(),
            scan_rows: counter(),
            depth_rows: (0..=ndepths).map(|_| counter()).collect(),
            right_outer_rows: counter(),
            fallback_rows: counter(),
            fallback_tasks: counter(),
            result_rows: counter(),
            suspends: counter(),
            launches: counter(),
        }
    }

    /// Adds the counters of a task that read outer rows.
    pub(crate) fn add_outer(&self, counters: &LaunchCounters) {
        self.source_rows
            .fetch_add(counters.source_rows, Ordering::Relaxed);
        self.scan_rows.fetch_add(counters.scan_rows, Ordering::Relaxed);
        self.add_depths(counters);
    }

    /// Adds the counters of a sweep of `depth`.
    pub(crate) fn add_sweep(&self, depth: usize, counters: &LaunchCounters) {
        if let Some(&rows) = counters.depth_rows.get(depth) {
            self.right_outer_rows.fetch_add(rows, Ordering::Relaxed);
        }
        self.add_depths(counters);
    }

    fn add_depths(&self, counters: &LaunchCounters) {
        for (c, &rows) in self.depth_rows.iter().zip(counters.depth_rows.iter()) {
            c.fetch_add(rows, Ordering::Relaxed);
        }
    }

    pub(crate) fn add_fallback(&self, rows: u64) {
        self.fallback_tasks.fetch_add(1, Ordering::Relaxed);
        self.fallback_rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn add_cpu_rows(&self, rows: u64) {
        self.fallback_rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn add_results(&self, rows: u64) {
        self.result_rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn add_launch(&self, suspended: bool) {
        self.launches.fetch_add(1, Ordering::Relaxed);
        if suspended {
            self.suspends.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &Counter| c.load(Ordering::Relaxed);
        StatsSnapshot {
            source_rows: load(&self.source_rows),
            scan_rows: load(&self.scan_rows),
            depth_rows: self.depth_rows.iter().map(load).collect(),
            right_outer_rows: load(&self.right_outer_rows),
            fallback_rows: load(&self.fallback_rows),
            fallback_tasks: load(&self.fallback_tasks),
            result_rows: load(&self.result_rows),
            suspends: load(&self.suspends),
            launches: load(&self.launches),
        }
    }
}
