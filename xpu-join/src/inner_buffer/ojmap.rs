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


//! Outer-join maps.
//!
//! Every right or full outer depth has one bit per inner row that records
//! whether any outer row matched it. Each device sets bits in its own copy;
//! the host copy is the merge target that the right-outer sweep reads.
//! Bits are only ever set, so merging is an idempotent OR.

use std::sync::atomic::{AtomicU64, Ordering};

fn words(nitems: usize) -> usize {
    (nitems + 63) / 64
}

fn bitmap(nitems: usize) -> Vec<AtomicU64> {
    (0..words(nitems)).map(|_| AtomicU64::new(0)).collect()
}

/// The maps of one depth: one copy per device and the host copy last
#[derive(Debug)]
struct DepthMaps {
    nitems: usize,
    copies: Vec<Vec<AtomicU64>>,
}

#[derive(Debug)]
pub struct OuterJoinMaps {
    num_devices: usize,
    depths: Vec<Option<DepthMaps>>,
}

impl OuterJoinMaps {
    /// Creates maps for `depths`, given as `(is_right_outer, nitems)` per
    /// inner depth in order.
    pub fn new(num_devices: usize, depths: &[(bool, usize)]) -> Self {
        let depths = depths
            .iter()
            .map(|&(right_outer, nitems)| {
                if right_outer {
                    Some(DepthMaps {
                        nitems,
                        copies: (0..=num_devices).map(|_| bitmap(nitems)).collect(),
                    })
                } else {
                    None
                }
            })
            .collect();
        Self { num_devices, depths }
    }

    /// Index of the host copy.
    pub fn host_copy(&self) -> usize {
        self.num_devices
    }

    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    fn depth(&self, depth: usize) -> Option<&DepthMaps> {
        depth
            .checked_sub(1)
            .and_then(|d| self.depths.get(d))
            .and_then(Option::as_ref)
    }

    /// Returns `true` if `depth` has a map.
    pub fn has_map(&self, depth: usize) -> bool {
        self.depth(depth).is_some()
    }

    /// Marks inner row `rowid` of `depth` as matched in `copy`. Depths
    /// without a map are ignored.
    pub fn mark(&self, copy: usize, depth: usize, rowid: u32) {
        if let Some(maps) = self.depth(depth) {
            let rowid = rowid as usize;
            if let Some(word) = maps
                .copies
                .get(copy)
                .and_then(|bits| bits.get(rowid / 64))
            {
                word.fetch_or(1 << (rowid % 64), Ordering::SeqCst);
            }
        }
    }

    /// Returns `true` if the host copy marks `rowid` of `depth` as matched.
    pub fn is_matched(&self, depth: usize, rowid: u32) -> bool {
        let host = self.host_copy();
        self.depth(depth)
            .and_then(|maps| maps.copies.get(host))
            .and_then(|bits| bits.get(rowid as usize / 64))
            .map_or(false, |word| {
                word.load(Ordering::SeqCst) & (1 << (rowid as usize % 64)) != 0
            })
    }

    /// ORs every device copy into the host copy.
    pub fn merge(&self) {
        for maps in self.depths.iter().flatten() {
            let (devices, host) = maps.copies.split_at(self.num_devices);
            for (i, word) in host[0].iter().enumerate() {
                let bits = devices
                    .iter()
                    .fold(0, |acc, copy| acc | copy[i].load(Ordering::SeqCst));
                word.fetch_or(bits, Ordering::SeqCst);
            }
        }
    }

    /// Number of rows of `depth` that the host copy marks as matched.
    pub fn matched_count(&self, depth: usize) -> usize {
        let host = self.host_copy();
        self.depth(depth).map_or(0, |maps| {
            maps.copies[host]
                .iter()
                .map(|w| w.load(Ordering::SeqCst).count_ones() as usize)
                .sum::<usize>()
                .min(maps.nitems)
        })
    }
}
