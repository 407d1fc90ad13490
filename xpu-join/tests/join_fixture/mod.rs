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


//! Shared helpers of the join tests.
//!
//! The relations follow the `datagen` workload layout. The outer relation is
//! `(fk_1, ..., fk_n, payload)` and every inner relation is
//! `(key, payload, name)`. The projection emits the outer payload followed
//! by the payload of every inner depth.

#![allow(dead_code)]

use std::error::Error;
use std::sync::Arc;
use xpu_codegen::catalog::{oid, BuiltinCatalog, DevCatalog};
use xpu_codegen::datum::{Datum, Row, Value};
use xpu_codegen::expr::{Expr, InputRel, TargetEntry};
use xpu_codegen::host_eval::{HostEnv, HostEvaluator};
use xpu_join::plan::{DepthPlan, JoinPlan, JoinType};
use xpu_runtime::runtime::memory::HostMemService;

pub type TestResult = Result<(), Box<dyn Error>>;

pub struct Fixture {
    pub host: Arc<BuiltinCatalog>,
    pub catalog: Arc<DevCatalog>,
    pub mem: Arc<HostMemService>,
}

impl Fixture {
    pub fn new(num_devices: u16) -> Self {
        Self::with_capacity(num_devices, 256 * 1024 * 1024)
    }

    pub fn with_capacity(num_devices: u16, device_capacity: usize) -> Self {
        let host = Arc::new(BuiltinCatalog::new());
        let catalog = DevCatalog::new(host.clone());
        let mem = Arc::new(HostMemService::new(num_devices, device_capacity));
        Self { host, catalog, mem }
    }

    pub fn int4_eq(&self, l: Expr, r: Expr) -> Expr {
        let opno = self
            .host
            .oper_oid("=", oid::INT4, oid::INT4)
            .expect("builtin operator");
        Expr::op(opno, oid::BOOL, l, r)
    }

    pub fn int4_lt(&self, l: Expr, r: Expr) -> Expr {
        let opno = self
            .host
            .oper_oid("<", oid::INT4, oid::INT4)
            .expect("builtin operator");
        Expr::op(opno, oid::BOOL, l, r)
    }

    pub fn text_eq(&self, l: Expr, r: Expr) -> Expr {
        let opno = self
            .host
            .oper_oid("=", oid::TEXT, oid::TEXT)
            .expect("builtin operator");
        Expr::op(opno, oid::BOOL, l, r)
    }

    pub fn upper(&self, arg: Expr) -> Expr {
        let func = self
            .host
            .func_oid("upper", &[oid::TEXT])
            .expect("builtin upper");
        Expr::Func {
            func_oid: func,
            args: vec![arg],
            collation: oid::C_COLLATION,
            result_type: oid::TEXT,
        }
    }

    /// Outer foreign key of `depth`.
    pub fn outer_key(depth: usize) -> Expr {
        Expr::var(1, depth as i32, oid::INT4)
    }

    /// Key of the inner relation of `depth`.
    pub fn inner_key(depth: usize) -> Expr {
        Expr::var(depth as u32 + 1, 1, oid::INT4)
    }

    pub fn hash_depth(&self, depth: usize, join_type: JoinType) -> DepthPlan {
        DepthPlan::hash(
            join_type,
            vec![self.int4_eq(Self::outer_key(depth), Self::inner_key(depth))],
            vec![Self::outer_key(depth)],
            vec![Self::inner_key(depth)],
        )
    }

    pub fn nestloop_depth(&self, depth: usize, join_type: JoinType) -> DepthPlan {
        DepthPlan::nest_loop(
            join_type,
            vec![self.int4_eq(Self::outer_key(depth), Self::inner_key(depth))],
        )
    }

    pub fn plan(&self, depths: Vec<DepthPlan>) -> JoinPlan {
        let n = depths.len();
        let input_rels = (1..=n as u32 + 1)
            .map(|varno| InputRel::Scan { varno })
            .collect();
        let mut tlist = vec![TargetEntry::new(
            Expr::var(1, n as i32 + 1, oid::INT8),
            1,
        )];
        tlist.extend((1..=n).map(|d| {
            TargetEntry::new(Expr::var(d as u32 + 1, 2, oid::INT8), d as i32 + 1)
        }));
        JoinPlan {
            input_rels,
            scan_quals: Vec::new(),
            depths,
            tlist,
            params: Vec::new(),
        }
    }
}

pub fn outer_row(keys: &[Option<i32>], payload: i64) -> Row {
    let mut row: Row = keys.iter().map(|k| k.map(Value::Int4)).collect();
    row.push(Some(Value::Int8(payload)));
    row
}

pub fn inner_row(key: Option<i32>, payload: i64, name: &str) -> Row {
    vec![
        key.map(Value::Int4),
        Some(Value::Int8(payload)),
        Some(Value::Text(name.to_string())),
    ]
}

struct Reference<'a> {
    plan: &'a JoinPlan,
    evaluator: HostEvaluator<'a>,
    inners: &'a [Vec<Row>],
    matched: Vec<Vec<bool>>,
    out: Vec<Row>,
}

impl<'a> Reference<'a> {
    fn quals(&self, quals: &[Expr], path: &[Option<Row>]) -> Result<bool, Box<dyn Error>> {
        let rows: Vec<Option<&[Datum]>> = path.iter().map(|r| r.as_deref()).collect();
        let env = HostEnv {
            input_rels: &self.plan.input_rels,
            rows: &rows,
            params: &self.plan.params,
        };
        Ok(self.evaluator.eval_quals(quals, &env)?)
    }

    fn project(&mut self, path: &[Option<Row>]) -> Result<(), Box<dyn Error>> {
        let rows: Vec<Option<&[Datum]>> = path.iter().map(|r| r.as_deref()).collect();
        let env = HostEnv {
            input_rels: &self.plan.input_rels,
            rows: &rows,
            params: &self.plan.params,
        };
        let mut row = Vec::new();
        for target in self.plan.tlist.iter().filter(|t| !t.resjunk) {
            row.push(self.evaluator.eval(&target.expr, &env)?);
        }
        self.out.push(row);
        Ok(())
    }

    fn extend(&mut self, path: &mut Vec<Option<Row>>, depth: usize) -> Result<(), Box<dyn Error>> {
        if depth == self.plan.ndepths() {
            return self.project(path);
        }
        let next = depth + 1;
        let plan = self.plan;
        let depth_plan = &plan.depths[depth];
        let inners = self.inners;
        let mut any = false;

        for (rowid, row) in inners[depth].iter().enumerate() {
            path[next] = Some(row.clone());
            if !self.quals(&depth_plan.join_quals, path)? {
                continue;
            }
            any = true;
            if depth_plan.join_type.is_right_outer() {
                self.matched[depth][rowid] = true;
            }
            if self.quals(&depth_plan.other_quals, path)? {
                self.extend(path, next)?;
            }
        }
        path[next] = None;

        if depth_plan.join_type.is_left_outer() && !any && self.quals(&depth_plan.other_quals, path)? {
            self.extend(path, next)?;
        }
        Ok(())
    }
}

/// Joins with nested loops on the host.
pub fn reference_join(
    plan: &JoinPlan,
    catalog: &DevCatalog,
    outer: &[Row],
    inners: &[Vec<Row>],
) -> Result<Vec<Row>, Box<dyn Error>> {
    let n = plan.ndepths();
    let mut reference = Reference {
        plan,
        evaluator: HostEvaluator::new(catalog),
        inners,
        matched: inners.iter().map(|r| vec![false; r.len()]).collect(),
        out: Vec::new(),
    };

    for row in outer {
        let mut path = vec![None; n + 1];
        path[0] = Some(row.clone());
        if reference.quals(&plan.scan_quals, &path)? {
            reference.extend(&mut path, 0)?;
        }
    }

    for depth in 1..=n {
        let depth_plan = &plan.depths[depth - 1];
        if !depth_plan.join_type.is_right_outer() {
            continue;
        }
        for (rowid, row) in inners[depth - 1].iter().enumerate() {
            if reference.matched[depth - 1][rowid] {
                continue;
            }
            let mut path = vec![None; n + 1];
            path[depth] = Some(row.clone());
            if reference.quals(&depth_plan.other_quals, &path)? {
                reference.extend(&mut path, depth)?;
            }
        }
    }
    Ok(reference.out)
}

/// Rows as a sorted multiset.
pub fn multiset(rows: &[Row]) -> Vec<String> {
    let mut rows: Vec<String> = rows.iter().map(|r| format!("{:?}", r)).collect();
    rows.sort();
    rows
}

pub fn assert_same_rows(actual: &[Row], expected: &[Row]) {
    assert_eq!(actual.len(), expected.len(), "row count differs");
    assert_eq!(multiset(actual), multiset(expected));
}
