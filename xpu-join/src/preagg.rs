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


//! Group-by pre-aggregation.
//!
//! Rows are grouped by the compiled key hash and key comparison, and every
//! group keeps one partial accumulator per aggregate. A group is emitted as
//! one row that concatenates the partial states of its aggregates:
//!
//! | Aggregate   | Emitted attributes                 |
//! |-------------|------------------------------------|
//! | key         | the key value                      |
//! | count       | `int8`                             |
//! | min/max/sum | `int8` or `float8`, NULL if empty  |
//! | avg         | `n`, `sum`                         |
//! | stddev      | `n`, `sum`, `sum of squares`       |
//! | covar       | `n`, `sum x`, `sum y`, `sum x * y` |

use crate::error::{ErrorKind, Result};
use std::collections::HashMap;
use tracing::debug;
use xpu_codegen::catalog::DevCatalog;
use xpu_codegen::codegen::CodegenContext;
use xpu_codegen::datum::{Datum, Row, Value};
use xpu_codegen::expr::{Expr, InputRel, PartialAgg};
use xpu_codegen::interp::{self, EvalError, KernContext};
use xpu_codegen::kexp::{AggDesc, Bytecode};
use xpu_codegen::opcodes::AggAction;

fn exec_error(e: EvalError) -> crate::error::Error {
    ErrorKind::ExecutionError(e.to_string()).into()
}

/// The compiled group-by stage over one input relation
#[derive(Debug)]
pub struct GroupByProgram {
    keyhash: Bytecode,
    keyload: Bytecode,
    keycomp: Bytecode,
    aggfuncs: Bytecode,
    scan_loadvars: Option<Bytecode>,
    key_slots: Vec<u32>,
    nslots: usize,
    params: Vec<Datum>,
}

impl GroupByProgram {
    pub fn compile(
        catalog: &DevCatalog,
        input: InputRel,
        keys: &[Expr],
        aggs: &[PartialAgg],
        params: Vec<Datum>,
    ) -> Result<Self> {
        let mut ctx = CodegenContext::new(catalog, vec![input]);
        let groupby = ctx.codegen_groupby(keys)?;
        let aggfuncs = ctx.codegen_aggfuncs(aggs, keys)?;
        let scan_loadvars = ctx.codegen_scan_loadvars()?;
        let nslots = ctx.kvars_nslots();

        Ok(Self {
            keyhash: groupby.keyhash,
            keyload: groupby.keyload,
            keycomp: groupby.keycomp,
            aggfuncs,
            scan_loadvars,
            key_slots: groupby.key_slots,
            nslots,
            params,
        })
    }

    pub fn nkeys(&self) -> usize {
        self.key_slots.len()
    }
}

#[derive(Clone, Debug)]
enum Accum {
    Key(Datum),
    Count(i64),
    MinInt(Option<i64>),
    MaxInt(Option<i64>),
    SumInt(Option<i64>),
    MinFp(Option<f64>),
    MaxFp(Option<f64>),
    SumFp(Option<f64>),
    AvgInt { n: i64, sum: i64 },
    AvgFp { n: i64, sum: f64 },
    Stddev { n: i64, sum: f64, sumsq: f64 },
    Covar { n: i64, sx: f64, sy: f64, sxy: f64 },
}

fn as_i64(value: &Value) -> Result<i64> {
    match *value {
        Value::Int1(v) => Ok(v.into()),
        Value::Int2(v) => Ok(v.into()),
        Value::Int4(v) => Ok(v.into()),
        Value::Int8(v) => Ok(v),
        ref other => Err(ErrorKind::ExecutionError(format!(
            "expected an integer, got {:?}",
            other.type_code()
        )))?,
    }
}

fn as_f64(value: &Value) -> Result<f64> {
    match *value {
        Value::Float4(v) => Ok(v.into()),
        Value::Float8(v) => Ok(v),
        ref other => as_i64(other).map(|v| v as f64),
    }
}

fn overflow() -> crate::error::Error {
    ErrorKind::ExecutionError("bigint out of range".to_string()).into()
}

impl Accum {
    fn new(desc: &AggDesc, arg0: &Datum) -> Self {
        match desc.action {
            AggAction::Vref => Accum::Key(arg0.clone()),
            AggAction::NRowsAny | AggAction::NRowsCond => Accum::Count(0),
            AggAction::PMinInt => Accum::MinInt(None),
            AggAction::PMaxInt => Accum::MaxInt(None),
            AggAction::PSumInt => Accum::SumInt(None),
            AggAction::PMinFp => Accum::MinFp(None),
            AggAction::PMaxFp => Accum::MaxFp(None),
            AggAction::PSumFp => Accum::SumFp(None),
            AggAction::PAvgInt => Accum::AvgInt { n: 0, sum: 0 },
            AggAction::PAvgFp => Accum::AvgFp { n: 0, sum: 0.0 },
            AggAction::Stddev => Accum::Stddev {
                n: 0,
                sum: 0.0,
                sumsq: 0.0,
            },
            AggAction::Covar => Accum::Covar {
                n: 0,
                sx: 0.0,
                sy: 0.0,
                sxy: 0.0,
            },
        }
    }

    fn update(&mut self, desc: &AggDesc, arg0: &Datum, arg1: &Datum) -> Result<()> {
        if let Accum::Count(n) = self {
            if desc.action == AggAction::NRowsAny || arg0.is_some() {
                *n += 1;
            }
            return Ok(());
        }
        if let (Accum::Covar { n, sx, sy, sxy }, Some(x), Some(y)) = (&mut *self, arg0, arg1) {
            let (x, y) = (as_f64(x)?, as_f64(y)?);
            *n += 1;
            *sx += x;
            *sy += y;
            *sxy += x * y;
            return Ok(());
        }
        let value = match arg0 {
            Some(v) => v,
            None => return Ok(()),
        };

        match self {
            Accum::Key(_) | Accum::Count(_) | Accum::Covar { .. } => {}
            Accum::MinInt(acc) => {
                let v = as_i64(value)?;
                *acc = Some(acc.map_or(v, |a| a.min(v)));
            }
            Accum::MaxInt(acc) => {
                let v = as_i64(value)?;
                *acc = Some(acc.map_or(v, |a| a.max(v)));
            }
            Accum::SumInt(acc) => {
                let v = as_i64(value)?;
                *acc = Some(match *acc {
                    Some(a) => a.checked_add(v).ok_or_else(overflow)?,
                    None => v,
                });
            }
            Accum::MinFp(acc) => {
                let v = as_f64(value)?;
                *acc = Some(acc.map_or(v, |a| a.min(v)));
            }
            Accum::MaxFp(acc) => {
                let v = as_f64(value)?;
                *acc = Some(acc.map_or(v, |a| a.max(v)));
            }
            Accum::SumFp(acc) => {
                let v = as_f64(value)?;
                *acc = Some(acc.unwrap_or(0.0) + v);
            }
            Accum::AvgInt { n, sum } => {
                *sum = sum.checked_add(as_i64(value)?).ok_or_else(overflow)?;
                *n += 1;
            }
            Accum::AvgFp { n, sum } => {
                *sum += as_f64(value)?;
                *n += 1;
            }
            Accum::Stddev { n, sum, sumsq } => {
                let v = as_f64(value)?;
                *n += 1;
                *sum += v;
                *sumsq += v * v;
            }
        }
        Ok(())
    }

    fn emit(&self, row: &mut Row) {
        let int8 = |v: i64| Some(Value::Int8(v));
        let float8 = |v: f64| Some(Value::Float8(v));
        match self {
            Accum::Key(key) => row.push(key.clone()),
            Accum::Count(n) => row.push(int8(*n)),
            Accum::MinInt(v) | Accum::MaxInt(v) | Accum::SumInt(v) => {
                row.push(v.map(Value::Int8))
            }
            Accum::MinFp(v) | Accum::MaxFp(v) | Accum::SumFp(v) => {
                row.push(v.map(Value::Float8))
            }
            Accum::AvgInt { n, sum } => {
                row.push(int8(*n));
                row.push(int8(*sum));
            }
            Accum::AvgFp { n, sum } => {
                row.push(int8(*n));
                row.push(float8(*sum));
            }
            Accum::Stddev { n, sum, sumsq } => {
                row.push(int8(*n));
                row.push(float8(*sum));
                row.push(float8(*sumsq));
            }
            Accum::Covar { n, sx, sy, sxy } => {
                row.push(int8(*n));
                row.push(float8(*sx));
                row.push(float8(*sy));
                row.push(float8(*sxy));
            }
        }
    }
}

struct Group {
    key: Row,
    accums: Vec<Accum>,
}

/// Groups rows and keeps partial aggregates per group
pub struct PreAggregator<'p> {
    program: &'p GroupByProgram,
    ctx: KernContext<'p>,
    /// Groups by key hash
    index: HashMap<u32, Vec<usize>>,
    groups: Vec<Group>,
    nrows: u64,
}

impl<'p> PreAggregator<'p> {
    pub fn new(program: &'p GroupByProgram) -> Self {
        Self {
            program,
            ctx: KernContext::new(program.nslots, &program.params),
            index: HashMap::new(),
            groups: Vec::new(),
            nrows: 0,
        }
    }

    pub fn ngroups(&self) -> usize {
        self.groups.len()
    }

    /// Adds one input row.
    pub fn consume(&mut self, row: &[Datum]) -> Result<()> {
        let program = self.program;
        self.ctx.reset();
        if let Some(loadvars) = &program.scan_loadvars {
            interp::exec_loadvars(&mut self.ctx, loadvars.root(), Some(row)).map_err(exec_error)?;
        }
        let (hash, _) =
            interp::exec_hash_value(&mut self.ctx, program.keyhash.root()).map_err(exec_error)?;
        let key: Row = program
            .key_slots
            .iter()
            .map(|&slot| self.ctx.kvars.get(slot as usize).cloned().flatten())
            .collect();
        let args =
            interp::exec_aggfuncs(&mut self.ctx, program.aggfuncs.root()).map_err(exec_error)?;

        let group = match self.find_group(hash, &key)? {
            Some(group) => group,
            None => {
                let accums = args.iter().map(|(desc, arg0, _)| Accum::new(desc, arg0)).collect();
                self.groups.push(Group { key, accums });
                let group = self.groups.len() - 1;
                self.index.entry(hash).or_insert_with(Vec::new).push(group);
                group
            }
        };

        for (accum, (desc, arg0, arg1)) in self.groups[group].accums.iter_mut().zip(args.iter()) {
            accum.update(desc, arg0, arg1)?;
        }
        self.nrows += 1;
        Ok(())
    }

    fn find_group(&mut self, hash: u32, key: &[Datum]) -> Result<Option<usize>> {
        let candidates = match self.index.get(&hash) {
            Some(candidates) => candidates,
            None => return Ok(None),
        };
        // NULL keys group together, but the device comparison treats NULL as
        // unequal.
        let has_null = key.iter().any(Option::is_none);
        for &group in candidates {
            let group_key = &self.groups[group].key;
            let equal = if has_null || group_key.iter().any(Option::is_none) {
                group_key.as_slice() == key
            } else {
                let program = self.program;
                interp::exec_loadvars(&mut self.ctx, program.keyload.root(), Some(group_key))
                    .map_err(exec_error)?;
                interp::exec_quals(&mut self.ctx, Some(program.keycomp.root()))
                    .map_err(exec_error)?
            };
            if equal {
                return Ok(Some(group));
            }
        }
        Ok(None)
    }

    /// Emits one row per group, in order of first appearance.
    pub fn finish(self) -> Vec<Row> {
        debug!(rows = self.nrows, groups = self.groups.len(), "pre-aggregation finished");
        self.groups
            .into_iter()
            .map(|group| {
                let mut row = Vec::new();
                group.accums.iter().for_each(|a| a.emit(&mut row));
                row
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xpu_codegen::catalog::{oid, BuiltinCatalog};

    fn catalog() -> std::sync::Arc<DevCatalog> {
        DevCatalog::new(std::sync::Arc::new(BuiltinCatalog::new()))
    }

    #[test]
    fn integer_sum_overflows() {
        let desc = AggDesc {
            action: AggAction::PSumInt,
            arg0: 0,
            arg1: -1,
        };
        let mut acc = Accum::SumInt(None);
        acc.update(&desc, &Some(Value::Int8(i64::MAX)), &None)
            .expect("first value fits");
        assert!(acc.update(&desc, &Some(Value::Int8(1)), &None).is_err());
    }

    #[test]
    fn null_keys_form_one_group() {
        let catalog = catalog();
        let keys = vec![Expr::var(1, 1, oid::INT4)];
        let aggs = vec![PartialAgg::Key(0), PartialAgg::CountStar];
        let program = GroupByProgram::compile(
            &catalog,
            InputRel::Scan { varno: 1 },
            &keys,
            &aggs,
            Vec::new(),
        )
        .expect("group-by compiles");

        let mut agg = PreAggregator::new(&program);
        for key in &[None, Some(1), None, Some(1), Some(2)] {
            agg.consume(&[key.map(Value::Int4)]).expect("row is consumed");
        }
        assert_eq!(agg.ngroups(), 3);
        let rows = agg.finish();
        assert_eq!(rows[0], vec![None, Some(Value::Int8(2))]);
        assert_eq!(rows[1], vec![Some(Value::Int4(1)), Some(Value::Int8(2))]);
    }
}
