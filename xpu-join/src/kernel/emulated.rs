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


//! An accelerator emulated on host threads.
//!
//! The device memory is provided by a `HostMemService`, thus the kernel
//! reads the inner buffer replica and the staged outer chunk through the
//! same handles a real device would use. Thread-groups run in parallel on
//! the rayon pool; the lanes of a group run one after another.

use super::suspend::{GroupState, LANE_DONE, NULL_REF};
use super::{
    DstBuffer, FaultInjection, JoinKernel, LaunchArgs, LaunchCounters, LaunchOutcome,
    LaunchSource, LaunchStatus,
};
use crate::error::{Error, ErrorKind, Result};
use crate::inner_buffer::{ChunkFlags, InnerChunk, KmrelsView, OuterJoinMaps};
use crate::plan::JoinProgram;
use crate::source::ChunkView;
use crate::tuple::{encode_row, row_image_len};
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use xpu_codegen::datum::{Datum, Row};
use xpu_codegen::interp::{
    exec_hash_value, exec_join_quals, exec_loadvars, exec_other_quals, exec_projection,
    exec_quals, EvalError, EvalResult, KernContext,
};
use xpu_codegen::kexp::KexpNode;
use xpu_runtime::runtime::memory::HostMemService;

/// Why a group stopped before it was done
enum Halt {
    Suspend,
    ReCheck(String),
    Fault(Error),
}

impl From<Error> for Halt {
    fn from(e: Error) -> Self {
        Halt::Fault(e)
    }
}

impl From<ErrorKind> for Halt {
    fn from(e: ErrorKind) -> Self {
        Halt::Fault(e.into())
    }
}

type Flow<T> = std::result::Result<T, Halt>;

fn ev<T>(r: EvalResult<T>) -> Flow<T> {
    r.map_err(|e| match e {
        EvalError::CpuReCheck(msg) => Halt::ReCheck(msg),
        EvalError::Fatal(msg) => Halt::Fault(ErrorKind::KernelFault(msg).into()),
    })
}

fn poisoned() -> Error {
    ErrorKind::LogicError("Device memory lock poisoned".to_string()).into()
}

/// An emulated device
pub struct EmulatedDevice {
    mem: Arc<HostMemService>,
    device: u16,
    ojmap_copy: usize,
    fault: Option<FaultInjection>,
    launches: AtomicUsize,
}

impl EmulatedDevice {
    pub fn new(mem: Arc<HostMemService>, device: u16, ojmap_copy: usize) -> Self {
        Self {
            mem,
            device,
            ojmap_copy,
            fault: None,
            launches: AtomicUsize::new(0),
        }
    }

    pub fn with_fault_injection(mut self, fault: FaultInjection) -> Self {
        self.fault = Some(fault);
        self
    }

    /// Number of launches so far.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl JoinKernel for EmulatedDevice {
    fn device(&self) -> u16 {
        self.device
    }

    fn ojmap_copy(&self) -> usize {
        self.ojmap_copy
    }

    fn launch(&self, args: LaunchArgs<'_>) -> Result<LaunchOutcome> {
        let launch = self.launches.fetch_add(1, Ordering::SeqCst);

        let kmrels_bytes = self.mem.mapped(args.kmrels)?;
        let kmrels_guard = kmrels_bytes.read().map_err(|_| poisoned())?;
        let kmrels = KmrelsView::new(&kmrels_guard[..])?;

        let chunk_bytes = match args.source {
            LaunchSource::Outer { handle, .. } => Some(self.mem.mapped(handle)?),
            LaunchSource::Sweep { .. } => None,
        };
        let chunk_guard = chunk_bytes
            .as_ref()
            .map(|b| b.read().map_err(|_| poisoned()))
            .transpose()?;
        let source = match (args.source, &chunk_guard) {
            (LaunchSource::Outer { nrows, .. }, Some(guard)) => {
                let view = ChunkView::new(&guard[..])?;
                if view.nrows() != nrows {
                    Err(ErrorKind::LogicError(format!(
                        "staged chunk holds {} rows instead of {}",
                        view.nrows(),
                        nrows
                    )))?;
                }
                RowSource::Outer(view)
            }
            (LaunchSource::Sweep { depth }, _) => RowSource::Sweep(depth),
            _ => Err(ErrorKind::LogicError("outer chunk is not mapped".to_string()))?,
        };

        let ndepths = kmrels.nrels();
        let dst = DstBuffer::new(args.dst_bytes);
        let runner = GroupRunner {
            program: args.program,
            params: args.params,
            kmrels: &kmrels,
            source: &source,
            ojmaps: args.ojmaps,
            ojmap_copy: self.ojmap_copy,
            dst: &dst,
            ndepths,
        };
        let runs: Vec<(Flow<()>, GroupOutput)> = args
            .groups
            .par_iter_mut()
            .map(|group| runner.run(group))
            .collect();

        let mut status = LaunchStatus::Done;
        let mut out = GroupOutput::new(ndepths);
        for (result, group_out) in runs {
            match result {
                Ok(()) => {}
                Err(Halt::Suspend) => {
                    if status == LaunchStatus::Done {
                        status = LaunchStatus::Suspended;
                    }
                }
                Err(Halt::ReCheck(msg)) => {
                    if let LaunchStatus::CpuReCheck(_) = status {
                    } else {
                        status = LaunchStatus::CpuReCheck(msg);
                    }
                }
                Err(Halt::Fault(e)) => return Err(e),
            }
            out.dst.extend_from_slice(&group_out.dst);
            out.nitems += group_out.nitems;
            out.counters.add(&group_out.counters);
        }

        if let Some(fault) = self.fault {
            if fault.at_launch == launch {
                if let LaunchStatus::CpuReCheck(_) = status {
                } else {
                    status = LaunchStatus::CpuReCheck(format!("fault injected at launch {}", launch));
                }
            }
        }

        debug!(
            device = self.device,
            launch,
            ?status,
            nitems = out.nitems,
            bytes = out.dst.len(),
            "kernel launch finished"
        );

        Ok(LaunchOutcome {
            status,
            dst: out.dst,
            nitems: out.nitems,
            counters: out.counters,
        })
    }
}

enum RowSource<'a> {
    Outer(ChunkView<'a>),
    Sweep(usize),
}

struct GroupOutput {
    dst: Vec<u8>,
    nitems: usize,
    counters: LaunchCounters,
}

impl GroupOutput {
    fn new(ndepths: usize) -> Self {
        Self {
            dst: Vec::new(),
            nitems: 0,
            counters: LaunchCounters::new(ndepths),
        }
    }
}

/// The inner depth a batch expands into
struct NextDepth<'a> {
    depth: usize,
    inner: InnerChunk<'a>,
    join_quals: Option<KexpNode<'a>>,
    loadvars: Option<KexpNode<'a>>,
}

struct GroupRunner<'r, 'a> {
    program: &'r JoinProgram,
    params: &'r [Datum],
    kmrels: &'r KmrelsView<'a>,
    source: &'r RowSource<'a>,
    ojmaps: &'r OuterJoinMaps,
    ojmap_copy: usize,
    dst: &'r DstBuffer,
    ndepths: usize,
}

impl<'r, 'a> GroupRunner<'r, 'a> {
    fn run(&self, group: &mut GroupState) -> (Flow<()>, GroupOutput) {
        let mut ctx = KernContext::new(self.program.nslots(), self.params);
        let mut out = GroupOutput::new(self.ndepths);
        let result = self.run_loop(group, &mut ctx, &mut out);
        (result, out)
    }

    fn run_loop(
        &self,
        group: &mut GroupState,
        ctx: &mut KernContext<'_>,
        out: &mut GroupOutput,
    ) -> Flow<()> {
        let source_depth = group.context.source_depth as usize;
        if group.ndepths() != self.ndepths || source_depth > self.ndepths {
            Err(ErrorKind::KernelFault(format!(
                "group of {} depths with source depth {} launched on {} depths",
                group.ndepths(),
                source_depth,
                self.ndepths
            )))?;
        }
        if group.context.source_end > u64::from(NULL_REF) {
            Err(ErrorKind::KernelFault(format!(
                "{} source rows exceed the row reference range",
                group.context.source_end
            )))?;
        }

        loop {
            let pending = (source_depth..=self.ndepths)
                .rev()
                .find(|&d| group.context.pd[d].is_pending());
            match pending {
                None => {
                    if group.context.source_pos >= group.context.source_end {
                        return Ok(());
                    }
                    group.context.depth = source_depth as u32;
                    self.fill_source(group, ctx, out)?;
                }
                Some(d) if d == self.ndepths => {
                    group.context.depth = d as u32;
                    self.project(group, ctx, out)?;
                }
                Some(d) => {
                    group.context.depth = d as u32;
                    self.expand(group, d, ctx, out)?;
                }
            }
        }
    }

    fn fetch(&self, depth: usize, rowref: u32) -> Result<Row> {
        if depth == 0 {
            match self.source {
                RowSource::Outer(view) => view.fetch_row(rowref as usize),
                RowSource::Sweep(sweep_depth) => Err(ErrorKind::LogicError(format!(
                    "sweep of depth {} references an outer row",
                    sweep_depth
                )))?,
            }
        } else {
            self.kmrels.chunk(depth)?.kds.row(rowref)
        }
    }

    /// Loads the rows referenced by `refs` into the slots.
    fn load_path(&self, ctx: &mut KernContext<'_>, refs: &[u32]) -> Flow<()> {
        for (depth, &rowref) in refs.iter().enumerate() {
            let node = match self.program.loadvars_at(depth) {
                Some(node) => node,
                None => continue,
            };
            if rowref == NULL_REF {
                ev(exec_loadvars(ctx, node, None))?;
            } else {
                let row = self.fetch(depth, rowref)?;
                ev(exec_loadvars(ctx, node, Some(&row[..])))?;
            }
        }
        Ok(())
    }

    /// Moves source rows onto the stack of the source depth.
    fn fill_source(
        &self,
        group: &mut GroupState,
        ctx: &mut KernContext<'_>,
        out: &mut GroupOutput,
    ) -> Flow<()> {
        let source_depth = group.context.source_depth as usize;
        while group.context.source_pos < group.context.source_end
            && group.context.pd[source_depth].write_pos < group.context.rooms
        {
            let index = group.context.source_pos as u32;
            group.context.source_pos += 1;
            out.counters.source_rows += 1;

            ctx.reset();
            let refs = if source_depth == 0 {
                let refs = vec![index];
                self.load_path(ctx, &refs)?;
                let scan_quals = self.program.scan_quals.as_ref().map(|b| b.root());
                if !ev(exec_quals(ctx, scan_quals))? {
                    continue;
                }
                refs
            } else {
                if self.ojmaps.is_matched(source_depth, index) {
                    continue;
                }
                let mut refs = vec![NULL_REF; source_depth + 1];
                refs[source_depth] = index;
                self.load_path(ctx, &refs)?;
                if !ev(exec_other_quals(ctx, self.program.join_quals_at(source_depth)))? {
                    continue;
                }
                refs
            };

            out.counters.scan_rows += 1;
            out.counters.depth_rows[source_depth] += 1;
            group.push(source_depth, &refs)?;
        }
        Ok(())
    }

    /// Expands the current batch of depth `depth` into depth `depth + 1`.
    fn expand(
        &self,
        group: &mut GroupState,
        depth: usize,
        ctx: &mut KernContext<'_>,
        out: &mut GroupOutput,
    ) -> Flow<()> {
        let next = NextDepth {
            depth: depth + 1,
            inner: self.kmrels.chunk(depth + 1)?,
            join_quals: self.program.join_quals_at(depth + 1),
            loadvars: self.program.loadvars_at(depth + 1),
        };
        let batch = group.context.pd[depth].batch_len();
        let read_pos = group.context.pd[depth].read_pos;

        for lane in 0..batch {
            if group.context.pd[depth].l_state[lane] == LANE_DONE {
                continue;
            }
            let mut refs = group.entry(depth, read_pos + lane as u32)?.to_vec();
            ctx.reset();
            self.load_path(ctx, &refs)?;
            refs.push(NULL_REF);

            if next.inner.flags.contains(ChunkFlags::NESTLOOP) {
                let nitems = next.inner.kds.nitems();
                let mut rowid = group.context.pd[depth].l_state[lane];
                while rowid < nitems {
                    let row = next.inner.kds.row(rowid)?;
                    self.try_candidate(group, lane, &next, rowid, &row, &mut refs, ctx, out)?;
                    rowid += 1;
                    group.context.pd[depth].l_state[lane] = rowid;
                }
            } else {
                let node = self.program.hash_value_at(next.depth).ok_or_else(|| {
                    ErrorKind::KernelFault(format!("depth {} has no hash keys", next.depth))
                })?;
                let (hash, all_null) = ev(exec_hash_value(ctx, node))?;
                if !all_null {
                    let l_state = group.context.pd[depth].l_state[lane];
                    let mut offset = if l_state == 0 {
                        next.inner.kds.chain_head(hash)?
                    } else {
                        next.inner.kds.item(l_state)?.next
                    };
                    while offset != 0 {
                        let item = next.inner.kds.item(offset)?;
                        if item.hash == hash {
                            let row = next.inner.kds.item_row(offset)?;
                            self.try_candidate(
                                group, lane, &next, item.rowid, &row, &mut refs, ctx, out,
                            )?;
                        }
                        group.context.pd[depth].l_state[lane] = offset;
                        offset = item.next;
                    }
                }
            }

            let left_outer = next.inner.flags.contains(ChunkFlags::LEFT_OUTER);
            if left_outer && !group.context.pd[depth].matched[lane] {
                if let Some(node) = next.loadvars {
                    ev(exec_loadvars(ctx, node, None))?;
                }
                if ev(exec_other_quals(ctx, next.join_quals))? {
                    refs[next.depth] = NULL_REF;
                    if !group.push(next.depth, &refs)? {
                        return Err(Halt::Suspend);
                    }
                    out.counters.depth_rows[next.depth] += 1;
                }
            }
            group.context.pd[depth].l_state[lane] = LANE_DONE;
        }

        let cursor = &mut group.context.pd[depth];
        cursor.read_pos += batch as u32;
        cursor.reset_lanes();
        group.normalize(depth);
        Ok(())
    }

    /// Joins one inner row to the path of `lane`.
    ///
    /// Suspends without side effects on the lane state if the stack of the
    /// next depth is full, so the candidate is evaluated again on resume.
    fn try_candidate(
        &self,
        group: &mut GroupState,
        lane: usize,
        next: &NextDepth<'_>,
        rowid: u32,
        row: &[Datum],
        refs: &mut [u32],
        ctx: &mut KernContext<'_>,
        out: &mut GroupOutput,
    ) -> Flow<()> {
        if let Some(node) = next.loadvars {
            ev(exec_loadvars(ctx, node, Some(row)))?;
        }
        let (join_ok, other_ok) = ev(exec_join_quals(ctx, next.join_quals))?;
        if !join_ok {
            return Ok(());
        }
        group.context.pd[next.depth - 1].matched[lane] = true;
        if next.inner.flags.contains(ChunkFlags::RIGHT_OUTER) {
            self.ojmaps.mark(self.ojmap_copy, next.depth, rowid);
        }
        if other_ok {
            refs[next.depth] = rowid;
            if !group.push(next.depth, refs)? {
                return Err(Halt::Suspend);
            }
            out.counters.depth_rows[next.depth] += 1;
        }
        Ok(())
    }

    /// Projects the complete paths into the destination buffer.
    fn project(
        &self,
        group: &mut GroupState,
        ctx: &mut KernContext<'_>,
        out: &mut GroupOutput,
    ) -> Flow<()> {
        let depth = self.ndepths;
        while group.context.pd[depth].is_pending() {
            let index = group.context.pd[depth].read_pos;
            let refs = group.entry(depth, index)?.to_vec();
            ctx.reset();
            self.load_path(ctx, &refs)?;
            let row = ev(exec_projection(ctx, self.program.projection.root()))?;

            let len = row_image_len(&row);
            if len > self.dst.capacity() {
                Err(ErrorKind::KernelFault(format!(
                    "row of {} bytes exceeds the destination buffer of {} bytes",
                    len,
                    self.dst.capacity()
                )))?;
            }
            if !self.dst.reserve(len) {
                return Err(Halt::Suspend);
            }
            encode_row(&row, &mut out.dst)?;
            out.nitems += 1;
            group.context.pd[depth].read_pos += 1;
        }
        group.normalize(depth);
        Ok(())
    }
}
