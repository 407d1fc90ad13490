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


//! Join plans and their compiled device programs.
//!
//! A `JoinPlan` describes an N-way join: depth 0 is the outer relation, and
//! depths 1..=N are the inner relations in join order. The plan keeps the
//! expression trees, because the CPU fallback evaluates them on the host.
//! `JoinProgram` holds the bytecode that the device executes.

use crate::error::{ErrorKind, Result};
use xpu_codegen::catalog::DevCatalog;
use xpu_codegen::codegen::{CodegenContext, CodegenSummary, JoinQualsDesc};
use xpu_codegen::datum::Datum;
use xpu_codegen::expr::{Expr, InputRel, TargetEntry};
use xpu_codegen::kexp::{Bytecode, KexpNode};

/// Join type of an inner depth
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinType {
    /// Unmatched outer rows are emitted null-extended.
    pub fn is_left_outer(self) -> bool {
        self == JoinType::Left || self == JoinType::Full
    }

    /// Unmatched inner rows are emitted null-extended.
    pub fn is_right_outer(self) -> bool {
        self == JoinType::Right || self == JoinType::Full
    }
}

/// One inner depth of a join
#[derive(Clone, Debug, PartialEq)]
pub struct DepthPlan {
    pub join_type: JoinType,
    /// Decide whether the rows match
    pub join_quals: Vec<Expr>,
    /// Filter joined rows, including null-extended rows
    pub other_quals: Vec<Expr>,
    /// Hash keys evaluated over the rows of the shallower depths; empty for
    /// a nested-loop join
    pub outer_keys: Vec<Expr>,
    /// Hash keys evaluated over the rows of this depth
    pub inner_keys: Vec<Expr>,
}

impl DepthPlan {
    /// A nested-loop depth.
    pub fn nest_loop(join_type: JoinType, join_quals: Vec<Expr>) -> Self {
        Self {
            join_type,
            join_quals,
            other_quals: Vec::new(),
            outer_keys: Vec::new(),
            inner_keys: Vec::new(),
        }
    }

    /// A hash-join depth. The join quals must imply key equality.
    pub fn hash(
        join_type: JoinType,
        join_quals: Vec<Expr>,
        outer_keys: Vec<Expr>,
        inner_keys: Vec<Expr>,
    ) -> Self {
        Self {
            join_type,
            join_quals,
            other_quals: Vec::new(),
            outer_keys,
            inner_keys,
        }
    }

    pub fn with_other_quals(mut self, other_quals: Vec<Expr>) -> Self {
        self.other_quals = other_quals;
        self
    }

    pub fn is_hash_join(&self) -> bool {
        !self.inner_keys.is_empty()
    }
}

/// An N-way join
#[derive(Clone, Debug, PartialEq)]
pub struct JoinPlan {
    /// The outer relation followed by the inner relation of every depth
    pub input_rels: Vec<InputRel>,
    /// Qualifiers of the outer scan
    pub scan_quals: Vec<Expr>,
    pub depths: Vec<DepthPlan>,
    pub tlist: Vec<TargetEntry>,
    pub params: Vec<Datum>,
}

impl JoinPlan {
    /// Number of inner depths.
    pub fn ndepths(&self) -> usize {
        self.depths.len()
    }

    /// The plan of inner depth `depth`, counting from 1.
    pub fn depth(&self, depth: usize) -> Option<&DepthPlan> {
        depth.checked_sub(1).and_then(|d| self.depths.get(d))
    }

    /// Checks the structural consistency of the plan.
    pub fn validate(&self) -> Result<()> {
        if self.depths.is_empty() {
            Err(ErrorKind::InvalidArgument(
                "a join requires at least one inner depth".to_string(),
            ))?;
        }
        if self.input_rels.len() != self.depths.len() + 1 {
            Err(ErrorKind::InvalidArgument(format!(
                "{} input relations given for {} depths",
                self.input_rels.len(),
                self.depths.len()
            )))?;
        }
        for (i, depth) in self.depths.iter().enumerate() {
            if depth.outer_keys.len() != depth.inner_keys.len() {
                Err(ErrorKind::InvalidArgument(format!(
                    "depth {} has {} outer and {} inner hash keys",
                    i + 1,
                    depth.outer_keys.len(),
                    depth.inner_keys.len()
                )))?;
            }
        }
        if self.tlist.iter().all(|t| t.resjunk) {
            Err(ErrorKind::InvalidArgument(
                "the target list has no regular entries".to_string(),
            ))?;
        }
        Ok(())
    }
}

/// Device bytecode of a join
#[derive(Debug)]
pub struct JoinProgram {
    /// Qualifiers of the outer scan
    pub scan_quals: Option<Bytecode>,
    /// Packed JoinQuals, one item per inner depth
    pub join_quals: Option<Bytecode>,
    /// Packed HashValue of the outer keys, one item per hash-join depth
    pub hash_values: Option<Bytecode>,
    pub projection: Bytecode,
    /// Packed LoadVars, one item per depth
    pub loadvars: Option<Bytecode>,
    pub summary: CodegenSummary,
}

impl JoinProgram {
    /// Compiles the device program of `plan`.
    ///
    /// Fails with an `Unsupported` codegen error if any expression has no
    /// device translation; the caller then runs the join on the host.
    pub fn compile(plan: &JoinPlan, catalog: &DevCatalog) -> Result<Self> {
        plan.validate()?;
        let mut ctx = CodegenContext::new(catalog, plan.input_rels.clone());

        let scan_quals = ctx.codegen_scan_quals(&plan.scan_quals)?;
        let quals: Vec<JoinQualsDesc> = plan
            .depths
            .iter()
            .map(|d| JoinQualsDesc {
                join_quals: d.join_quals.clone(),
                other_quals: d.other_quals.clone(),
            })
            .collect();
        let join_quals = ctx.codegen_join_quals(&quals)?;
        let keys: Vec<Vec<Expr>> = plan.depths.iter().map(|d| d.outer_keys.clone()).collect();
        let hash_values = ctx.codegen_hash_keys(&keys)?;
        let projection = ctx.codegen_projection(&plan.tlist)?;
        let loadvars = ctx.codegen_join_loadvars()?;

        Ok(Self {
            scan_quals,
            join_quals,
            hash_values,
            projection,
            loadvars,
            summary: ctx.finish(),
        })
    }

    pub fn loadvars_at(&self, depth: usize) -> Option<KexpNode<'_>> {
        packed_item(&self.loadvars, depth)
    }

    pub fn join_quals_at(&self, depth: usize) -> Option<KexpNode<'_>> {
        packed_item(&self.join_quals, depth)
    }

    pub fn hash_value_at(&self, depth: usize) -> Option<KexpNode<'_>> {
        packed_item(&self.hash_values, depth)
    }

    pub fn nslots(&self) -> usize {
        self.summary.kvars_nslots
    }
}

fn packed_item(packed: &Option<Bytecode>, index: usize) -> Option<KexpNode<'_>> {
    packed.as_ref().and_then(|b| b.root().packed_item(index))
}
