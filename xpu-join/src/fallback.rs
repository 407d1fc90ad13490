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


//! CPU fallback.
//!
//! Completes a task on the host when the device cannot evaluate a row. The
//! host walks the same inner buffer as the kernel, but evaluates the plan's
//! expression trees with the host evaluator instead of the bytecode.
//!
//! Resuming from a group state first finishes every pending stack entry.
//! Entries in the current batch of a depth continue from their lane state,
//! thus rows that the device already pushed to the next depth are neither
//! lost nor joined twice. Afterwards, the remaining source rows are joined
//! from scratch.

use crate::error::{Error, ErrorKind, Result};
use crate::inner_buffer::{ChunkFlags, KmrelsView, OuterJoinMaps};
use crate::kernel::suspend::{GroupState, LANE_DONE, NULL_REF};
use crate::kernel::LaunchCounters;
use crate::plan::JoinPlan;
use crate::source::SourceChunk;
use std::ops::Range;
use xpu_codegen::catalog::hash::hash_keys;
use xpu_codegen::catalog::DevCatalog;
use xpu_codegen::datum::{Datum, Row};
use xpu_codegen::expr::Expr;
use xpu_codegen::host_eval::{HostEnv, HostEvaluator};
use xpu_codegen::interp::EvalError;

/// Rows that feed the source depth
#[derive(Clone, Copy)]
pub enum FallbackSource<'a> {
    Outer(&'a SourceChunk),
    /// The unmatched rows of a right or full outer depth
    Sweep(usize),
}

#[derive(Debug, Default)]
pub struct FallbackOutput {
    pub rows: Vec<Row>,
    pub counters: LaunchCounters,
}

fn host_error(e: EvalError) -> Error {
    ErrorKind::ExecutionError(e.to_string()).into()
}

/// The host side of a join task
pub struct CpuFallback<'a> {
    plan: &'a JoinPlan,
    evaluator: HostEvaluator<'a>,
    kmrels: KmrelsView<'a>,
    ojmaps: &'a OuterJoinMaps,
    source: FallbackSource<'a>,
}

impl<'a> CpuFallback<'a> {
    pub fn new(
        plan: &'a JoinPlan,
        catalog: &'a DevCatalog,
        kmrels: KmrelsView<'a>,
        ojmaps: &'a OuterJoinMaps,
        source: FallbackSource<'a>,
    ) -> Self {
        Self {
            plan,
            evaluator: HostEvaluator::new(catalog),
            kmrels,
            ojmaps,
            source,
        }
    }

    fn ndepths(&self) -> usize {
        self.plan.ndepths()
    }

    fn source_depth(&self) -> usize {
        match self.source {
            FallbackSource::Outer(_) => 0,
            FallbackSource::Sweep(depth) => depth,
        }
    }

    /// Joins the source rows `range` from scratch.
    pub fn run(&self, range: Range<usize>) -> Result<FallbackOutput> {
        let mut out = FallbackOutput {
            rows: Vec::new(),
            counters: LaunchCounters::new(self.ndepths()),
        };
        for index in range {
            self.source_row(index, &mut out)?;
        }
        Ok(out)
    }

    /// Completes the groups of a task from their suspended state.
    pub fn resume(&self, groups: &[GroupState]) -> Result<FallbackOutput> {
        let mut out = FallbackOutput {
            rows: Vec::new(),
            counters: LaunchCounters::new(self.ndepths()),
        };
        for group in groups {
            let ctx = &group.context;
            if group.ndepths() != self.ndepths() || ctx.source_depth as usize != self.source_depth()
            {
                Err(ErrorKind::LogicError(format!(
                    "group of {} depths with source depth {} resumed on {} depths with source depth {}",
                    group.ndepths(),
                    ctx.source_depth,
                    self.ndepths(),
                    self.source_depth()
                )))?;
            }

            for depth in self.source_depth()..=self.ndepths() {
                let cursor = &ctx.pd[depth];
                let batch = cursor.batch_len();
                for index in cursor.read_pos..cursor.write_pos {
                    let lane = (index - cursor.read_pos) as usize;
                    let (l_state, matched) = if lane < batch {
                        (cursor.l_state[lane], cursor.matched[lane])
                    } else {
                        (0, false)
                    };
                    if l_state == LANE_DONE {
                        continue;
                    }
                    let mut rows = self.load_refs(group.entry(depth, index)?)?;
                    if depth == self.ndepths() {
                        self.project(&rows, &mut out)?;
                    } else {
                        self.probe(&mut rows, depth, l_state, matched, &mut out)?;
                    }
                }
            }

            for index in ctx.source_pos..ctx.source_end {
                self.source_row(index as usize, &mut out)?;
            }
        }
        Ok(out)
    }

    fn load_refs(&self, refs: &[u32]) -> Result<Vec<Option<Row>>> {
        let mut rows = vec![None; self.ndepths() + 1];
        for (depth, &rowref) in refs.iter().enumerate() {
            if rowref == NULL_REF {
                continue;
            }
            rows[depth] = Some(if depth == 0 {
                self.outer_row(rowref as usize)?
            } else {
                self.kmrels.chunk(depth)?.kds.row(rowref)?
            });
        }
        Ok(rows)
    }

    fn outer_row(&self, index: usize) -> Result<Row> {
        match self.source {
            FallbackSource::Outer(chunk) => chunk.fetch_row(index).ok_or_else(|| {
                ErrorKind::LogicError(format!(
                    "outer row {} beyond chunk of {} rows",
                    index,
                    chunk.nrows()
                ))
                .into()
            }),
            FallbackSource::Sweep(_) => {
                Err(ErrorKind::LogicError("sweep references an outer row".to_string()))?
            }
        }
    }

    fn eval_quals(&self, quals: &[Expr], rows: &[Option<Row>]) -> Result<bool> {
        let view: Vec<Option<&[Datum]>> = rows.iter().map(|r| r.as_deref()).collect();
        let env = HostEnv {
            input_rels: &self.plan.input_rels,
            rows: &view,
            params: &self.plan.params,
        };
        self.evaluator.eval_quals(quals, &env).map_err(host_error)
    }

    fn eval_all(&self, exprs: &[&Expr], rows: &[Option<Row>]) -> Result<Vec<Datum>> {
        let view: Vec<Option<&[Datum]>> = rows.iter().map(|r| r.as_deref()).collect();
        let env = HostEnv {
            input_rels: &self.plan.input_rels,
            rows: &view,
            params: &self.plan.params,
        };
        exprs
            .iter()
            .map(|e| self.evaluator.eval(e, &env).map_err(host_error))
            .collect()
    }

    /// Feeds source row `index` into the join.
    fn source_row(&self, index: usize, out: &mut FallbackOutput) -> Result<()> {
        let source_depth = self.source_depth();
        let mut rows = vec![None; self.ndepths() + 1];
        out.counters.source_rows += 1;

        if source_depth == 0 {
            rows[0] = Some(self.outer_row(index)?);
            if !self.eval_quals(&self.plan.scan_quals, &rows)? {
                return Ok(());
            }
        } else {
            if self.ojmaps.is_matched(source_depth, index as u32) {
                return Ok(());
            }
            rows[source_depth] = Some(self.kmrels.chunk(source_depth)?.kds.row(index as u32)?);
            let other_quals = &self.plan.depths[source_depth - 1].other_quals;
            if !self.eval_quals(other_quals, &rows)? {
                return Ok(());
            }
        }

        out.counters.scan_rows += 1;
        out.counters.depth_rows[source_depth] += 1;
        self.extend(&mut rows, source_depth, out)
    }

    /// Emits every result row that extends the path `rows[..=depth]`.
    fn extend(&self, rows: &mut Vec<Option<Row>>, depth: usize, out: &mut FallbackOutput) -> Result<()> {
        if depth == self.ndepths() {
            self.project(rows, out)
        } else {
            self.probe(rows, depth, 0, false, out)
        }
    }

    /// Joins the path `rows[..=depth]` with the rows of `depth + 1` that
    /// follow the lane state `l_state`.
    fn probe(
        &self,
        rows: &mut Vec<Option<Row>>,
        depth: usize,
        l_state: u32,
        mut matched: bool,
        out: &mut FallbackOutput,
    ) -> Result<()> {
        let next = depth + 1;
        let chunk = self.kmrels.chunk(next)?;
        let depth_plan = &self.plan.depths[depth];

        if chunk.flags.contains(ChunkFlags::NESTLOOP) {
            for rowid in l_state..chunk.kds.nitems() {
                let row = chunk.kds.row(rowid)?;
                matched |= self.join_row(rows, next, rowid, row, out)?;
            }
        } else {
            let outer_keys: Vec<&Expr> = depth_plan.outer_keys.iter().collect();
            let keys = self.eval_all(&outer_keys, rows)?;
            let (hash, all_null) = hash_keys(keys.iter().map(Option::as_ref));
            if !all_null {
                let mut offset = if l_state == 0 {
                    chunk.kds.chain_head(hash)?
                } else {
                    chunk.kds.item(l_state)?.next
                };
                while offset != 0 {
                    let item = chunk.kds.item(offset)?;
                    if item.hash == hash {
                        let row = chunk.kds.item_row(offset)?;
                        matched |= self.join_row(rows, next, item.rowid, row, out)?;
                    }
                    offset = item.next;
                }
            }
        }

        if chunk.flags.contains(ChunkFlags::LEFT_OUTER) && !matched {
            rows[next] = None;
            if self.eval_quals(&depth_plan.other_quals, rows)? {
                out.counters.depth_rows[next] += 1;
                self.extend(rows, next, out)?;
            }
        }
        rows[next] = None;
        Ok(())
    }

    /// Joins one inner row. Returns `true` if the join quals matched.
    fn join_row(
        &self,
        rows: &mut Vec<Option<Row>>,
        next: usize,
        rowid: u32,
        row: Row,
        out: &mut FallbackOutput,
    ) -> Result<bool> {
        let depth_plan = &self.plan.depths[next - 1];
        rows[next] = Some(row);
        if !self.eval_quals(&depth_plan.join_quals, rows)? {
            return Ok(false);
        }
        if depth_plan.join_type.is_right_outer() {
            self.ojmaps.mark(self.ojmaps.host_copy(), next, rowid);
        }
        if self.eval_quals(&depth_plan.other_quals, rows)? {
            out.counters.depth_rows[next] += 1;
            self.extend(rows, next, out)?;
        }
        Ok(true)
    }

    fn project(&self, rows: &[Option<Row>], out: &mut FallbackOutput) -> Result<()> {
        let targets: Vec<&Expr> = self
            .plan
            .tlist
            .iter()
            .filter(|t| !t.resjunk)
            .map(|t| &t.expr)
            .collect();
        let row = self.eval_all(&targets, rows)?;
        out.rows.push(row);
        Ok(())
    }
}
