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


//! Suspend contexts of thread-groups.
//!
//! A thread-group keeps one partial-result stack per depth. Entry `i` of the
//! stack of depth `d` holds `d + 1` references, one per depth from 0 to `d`:
//! the outer row index for depth 0 and the inner row id for every inner
//! depth. `NULL_REF` marks the NULL side of an outer join.
//!
//! When a launch suspends, the group state stays where it is and the next
//! launch continues from it. The driver snapshots the encoded state after
//! every suspend, so that the CPU fallback can restart from the last state
//! whose output was already shipped.

use crate::error::{ErrorKind, Result};
use crate::tuple::{read_u32, read_u64};
use std::ops::Range;

/// Reference of a NULL-extended depth
pub const NULL_REF: u32 = u32::max_value();

/// Lane state of an exhausted lane
pub const LANE_DONE: u32 = u32::max_value();

/// Cursors of the stack of one depth
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DepthCursor {
    pub write_pos: u32,
    pub read_pos: u32,
    /// Per lane: 0 if not started, `LANE_DONE` if exhausted, otherwise the
    /// last probed hash item offset or the next nested-loop row id
    pub l_state: Vec<u32>,
    /// Per lane: the join quals matched at least once
    pub matched: Vec<bool>,
}

impl DepthCursor {
    fn new(lanes: usize) -> Self {
        Self {
            write_pos: 0,
            read_pos: 0,
            l_state: vec![0; lanes],
            matched: vec![false; lanes],
        }
    }

    pub fn is_pending(&self) -> bool {
        self.read_pos < self.write_pos
    }

    /// Number of entries the current batch covers.
    pub fn batch_len(&self) -> usize {
        ((self.write_pos - self.read_pos) as usize).min(self.l_state.len())
    }

    /// Starts a new batch.
    pub fn reset_lanes(&mut self) {
        self.l_state.iter_mut().for_each(|s| *s = 0);
        self.matched.iter_mut().for_each(|m| *m = false);
    }
}

/// Where a thread-group stopped
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SuspendContext {
    /// Depth the group worked on last
    pub depth: u32,
    /// Depth whose rows feed the group: 0 for outer rows, an inner depth for
    /// the unmatched-row sweep
    pub source_depth: u32,
    pub source_pos: u64,
    pub source_end: u64,
    /// Capacity of every stack, in entries
    pub rooms: u32,
    pub pd: Vec<DepthCursor>,
}

/// A thread-group with its stacks
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupState {
    pub context: SuspendContext,
    pub stacks: Vec<Vec<u32>>,
}

impl GroupState {
    /// A group that reads the rows `range` of `source_depth`.
    pub fn new(
        ndepths: usize,
        lanes: usize,
        rooms: usize,
        source_depth: usize,
        range: Range<usize>,
    ) -> Self {
        Self {
            context: SuspendContext {
                depth: source_depth as u32,
                source_depth: source_depth as u32,
                source_pos: range.start as u64,
                source_end: range.end as u64,
                rooms: rooms as u32,
                pd: (0..=ndepths).map(|_| DepthCursor::new(lanes)).collect(),
            },
            stacks: (0..=ndepths).map(|_| Vec::new()).collect(),
        }
    }

    /// Splits `nrows` source rows evenly into `grid` groups.
    pub fn split(
        grid: usize,
        ndepths: usize,
        lanes: usize,
        rooms: usize,
        source_depth: usize,
        nrows: usize,
    ) -> Vec<Self> {
        let grid = grid.max(1);
        let per_group = (nrows + grid - 1) / grid;
        (0..grid)
            .map(|g| {
                let start = (g * per_group).min(nrows);
                let end = (start + per_group).min(nrows);
                Self::new(ndepths, lanes, rooms, source_depth, start..end)
            })
            .collect()
    }

    pub fn ndepths(&self) -> usize {
        self.stacks.len() - 1
    }

    pub fn lanes(&self) -> usize {
        self.context.pd.first().map_or(0, |c| c.l_state.len())
    }

    /// Returns `true` if the group has neither pending entries nor source
    /// rows left.
    pub fn is_done(&self) -> bool {
        self.context.source_pos >= self.context.source_end
            && self.context.pd.iter().all(|c| !c.is_pending())
    }

    /// References of entry `index` of the stack of `depth`.
    pub fn entry(&self, depth: usize, index: u32) -> Result<&[u32]> {
        let width = depth + 1;
        let start = index as usize * width;
        self.stacks
            .get(depth)
            .and_then(|s| s.get(start..start + width))
            .ok_or_else(|| {
                ErrorKind::LogicError(format!(
                    "entry {} beyond the stack of depth {}",
                    index, depth
                ))
                .into()
            })
    }

    /// Pushes an entry onto the stack of `depth`.
    ///
    /// Returns `false` if the stack is full.
    pub fn push(&mut self, depth: usize, refs: &[u32]) -> Result<bool> {
        if refs.len() != depth + 1 {
            Err(ErrorKind::LogicError(format!(
                "{} references pushed onto the stack of depth {}",
                refs.len(),
                depth
            )))?;
        }
        let rooms = self.context.rooms;
        let cursor = &mut self.context.pd[depth];
        if cursor.write_pos >= rooms {
            return Ok(false);
        }
        self.stacks[depth].extend_from_slice(refs);
        cursor.write_pos += 1;
        Ok(true)
    }

    /// Empties the stack of `depth` once it is drained.
    pub fn normalize(&mut self, depth: usize) {
        let cursor = &mut self.context.pd[depth];
        if cursor.read_pos == cursor.write_pos {
            cursor.read_pos = 0;
            cursor.write_pos = 0;
            self.stacks[depth].clear();
        }
    }

    /// Encodes the group state.
    pub fn to_bytes(&self) -> Vec<u8> {
        let ctx = &self.context;
        let lanes = self.lanes();
        let mut out = Vec::new();
        for v in &[
            self.stacks.len() as u32,
            lanes as u32,
            ctx.rooms,
            ctx.depth,
            ctx.source_depth,
            0,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&ctx.source_pos.to_le_bytes());
        out.extend_from_slice(&ctx.source_end.to_le_bytes());
        for cursor in &ctx.pd {
            out.extend_from_slice(&cursor.write_pos.to_le_bytes());
            out.extend_from_slice(&cursor.read_pos.to_le_bytes());
            for s in &cursor.l_state {
                out.extend_from_slice(&s.to_le_bytes());
            }
            let mut flags = vec![0u8; (lanes + 3) / 4 * 4];
            for (f, m) in flags.iter_mut().zip(cursor.matched.iter()) {
                *f = *m as u8;
            }
            out.extend_from_slice(&flags);
        }
        for stack in &self.stacks {
            for r in stack {
                out.extend_from_slice(&r.to_le_bytes());
            }
        }
        out
    }

    /// Decodes a group state encoded by `to_bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let nstacks = read_u32(bytes, 0)? as usize;
        let lanes = read_u32(bytes, 4)? as usize;
        let rooms = read_u32(bytes, 8)?;
        let depth = read_u32(bytes, 12)?;
        let source_depth = read_u32(bytes, 16)?;
        let source_pos = read_u64(bytes, 24)?;
        let source_end = read_u64(bytes, 32)?;
        if nstacks == 0 || source_depth as usize >= nstacks {
            Err(ErrorKind::LogicError(format!(
                "suspend context with {} stacks and source depth {}",
                nstacks, source_depth
            )))?;
        }

        let mut pos = 40;
        let mut pd = Vec::with_capacity(nstacks);
        for _ in 0..nstacks {
            let write_pos = read_u32(bytes, pos)?;
            let read_pos = read_u32(bytes, pos + 4)?;
            pos += 8;
            let mut l_state = Vec::with_capacity(lanes);
            for _ in 0..lanes {
                l_state.push(read_u32(bytes, pos)?);
                pos += 4;
            }
            let flags = bytes.get(pos..pos + lanes).ok_or_else(|| {
                ErrorKind::LogicError("truncated suspend context".to_string())
            })?;
            let matched = flags.iter().map(|&f| f != 0).collect();
            pos += (lanes + 3) / 4 * 4;
            if read_pos > write_pos || write_pos > rooms {
                Err(ErrorKind::LogicError(format!(
                    "inconsistent stack cursors {}..{} of {} rooms",
                    read_pos, write_pos, rooms
                )))?;
            }
            pd.push(DepthCursor {
                write_pos,
                read_pos,
                l_state,
                matched,
            });
        }

        let mut stacks = Vec::with_capacity(nstacks);
        for (d, cursor) in pd.iter().enumerate() {
            let len = cursor.write_pos as usize * (d + 1);
            let mut stack = Vec::with_capacity(len);
            for _ in 0..len {
                stack.push(read_u32(bytes, pos)?);
                pos += 4;
            }
            stacks.push(stack);
        }

        Ok(Self {
            context: SuspendContext {
                depth,
                source_depth,
                source_pos,
                source_end,
                rooms,
                pd,
            },
            stacks,
        })
    }
}

/// Encodes the states of all groups of a launch.
pub fn snapshot(groups: &[GroupState]) -> Vec<Vec<u8>> {
    groups.iter().map(GroupState::to_bytes).collect()
}

/// Restores the states of all groups of a launch.
pub fn restore(snapshot: &[Vec<u8>]) -> Result<Vec<GroupState>> {
    snapshot.iter().map(|s| GroupState::from_bytes(s)).collect()
}
