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

//! Host-side expression evaluator.
//!
//! Evaluates expression trees directly, without bytecode, with host
//! precision. Join fallback uses it to re-evaluate rows that the device
//! could not. Besides the device-translatable expression kinds, it also
//! evaluates COALESCE, CASE, GREATEST/LEAST, and binary-compatible
//! relabeling.

use crate::catalog::DevCatalog;
use crate::datum::{Datum, Value};
use crate::expr::{BoolOp, BoolTestKind, Expr, InputRel};
use crate::func_ops::{apply, EvalError, EvalResult, Precision};
use crate::opcodes::DevKind;
use std::cmp::Ordering;

/// Rows visible to an expression, one per input depth
#[derive(Clone, Copy, Debug)]
pub struct HostEnv<'a> {
    pub input_rels: &'a [InputRel],
    /// The row of every depth; `None` for the NULL side of an outer join
    pub rows: &'a [Option<&'a [Datum]>],
    pub params: &'a [Datum],
}

impl<'a> HostEnv<'a> {
    /// Looks `expr` up in the input relations.
    ///
    /// Returns `None` if no input provides it, `Some(datum)` otherwise.
    fn lookup_input(&self, expr: &Expr) -> EvalResult<Option<Datum>> {
        for (depth, rel) in self.input_rels.iter().enumerate() {
            if let Some(resno) = rel.resno_of(expr) {
                let row = match self.rows.get(depth) {
                    Some(row) => *row,
                    None => {
                        return Err(EvalError::Fatal(format!(
                            "no row bound for depth {}",
                            depth
                        )))
                    }
                };
                return match row {
                    None => Ok(Some(None)),
                    Some(r) => r
                        .get((resno - 1) as usize)
                        .cloned()
                        .map(Some)
                        .ok_or_else(|| {
                            EvalError::Fatal(format!(
                                "attribute {} beyond row of depth {}",
                                resno, depth
                            ))
                        }),
                };
            }
        }
        Ok(None)
    }
}

pub struct HostEvaluator<'a> {
    catalog: &'a DevCatalog,
}

impl<'a> HostEvaluator<'a> {
    pub fn new(catalog: &'a DevCatalog) -> Self {
        Self { catalog }
    }

    /// Evaluates an implicitly AND-ed list of qualifiers. NULL counts as
    /// false.
    pub fn eval_quals(&self, quals: &[Expr], env: &HostEnv<'_>) -> EvalResult<bool> {
        for qual in quals {
            if self.eval_bool(qual, env)? != Some(true) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn eval_bool(&self, expr: &Expr, env: &HostEnv<'_>) -> EvalResult<Option<bool>> {
        match self.eval(expr, env)? {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(b)),
            Some(other) => Err(EvalError::Fatal(format!(
                "expected bool, got {:?}",
                other.type_code()
            ))),
        }
    }

    fn call(
        &self,
        func_oid: u32,
        args: &[Expr],
        collation: u32,
        env: &HostEnv<'_>,
    ) -> EvalResult<Datum> {
        let arg_types: Vec<u32> = args.iter().map(Expr::type_oid).collect();
        let func = self
            .catalog
            .resolve_function(func_oid, &arg_types, collation, DevKind::empty())
            .map_err(|e| EvalError::Fatal(e.to_string()))?;
        let values = args
            .iter()
            .map(|a| self.eval(a, env))
            .collect::<EvalResult<Vec<_>>>()?;
        apply(func.op, func.ret_code(), &values, Precision::Host)
    }

    /// Evaluates an expression.
    pub fn eval(&self, expr: &Expr, env: &HostEnv<'_>) -> EvalResult<Datum> {
        if let Some(datum) = env.lookup_input(expr)? {
            return Ok(datum);
        }

        match expr {
            Expr::Const { value, .. } => Ok(value.clone()),
            Expr::Param { param_id, .. } => env
                .params
                .get(*param_id as usize)
                .cloned()
                .ok_or_else(|| EvalError::Fatal(format!("parameter {} is not bound", param_id))),
            Expr::Var { varno, attno, .. } => Err(EvalError::Fatal(format!(
                "Var({}, {}) is not provided by any input",
                varno, attno
            ))),
            Expr::Func {
                func_oid,
                args,
                collation,
                ..
            } => self.call(*func_oid, args, *collation, env),
            Expr::Op {
                opno,
                args,
                collation,
                ..
            } => match self.catalog.host().operator_func(*opno) {
                Some(func_oid) => self.call(func_oid, args, *collation, env),
                None => Err(EvalError::Fatal(format!("operator {} does not exist", opno))),
            },
            Expr::Bool { op, args } => match op {
                BoolOp::Not => match args.as_slice() {
                    [arg] => Ok(self.eval_bool(arg, env)?.map(|b| Value::Bool(!b))),
                    _ => Err(EvalError::Fatal("NOT takes one argument".to_string())),
                },
                BoolOp::And | BoolOp::Or => {
                    let short_circuit = *op == BoolOp::Or;
                    let mut any_null = false;
                    for arg in args {
                        match self.eval_bool(arg, env)? {
                            Some(b) if b == short_circuit => return Ok(Some(Value::Bool(b))),
                            Some(_) => {}
                            None => any_null = true,
                        }
                    }
                    Ok(if any_null {
                        None
                    } else {
                        Some(Value::Bool(!short_circuit))
                    })
                }
            },
            Expr::NullTest { arg, is_null } => {
                let value = self.eval(arg, env)?;
                Ok(Some(Value::Bool(value.is_none() == *is_null)))
            }
            Expr::BoolTest { arg, test } => {
                let b = self.eval_bool(arg, env)?;
                let result = match test {
                    BoolTestKind::IsTrue => b == Some(true),
                    BoolTestKind::IsNotTrue => b != Some(true),
                    BoolTestKind::IsFalse => b == Some(false),
                    BoolTestKind::IsNotFalse => b != Some(false),
                    BoolTestKind::IsUnknown => b.is_none(),
                    BoolTestKind::IsNotUnknown => b.is_some(),
                };
                Ok(Some(Value::Bool(result)))
            }
            Expr::Coalesce { args, .. } => {
                for arg in args {
                    if let Some(value) = self.eval(arg, env)? {
                        return Ok(Some(value));
                    }
                }
                Ok(None)
            }
            Expr::Case { whens, default, .. } => {
                for (cond, result) in whens {
                    if self.eval_bool(cond, env)? == Some(true) {
                        return self.eval(result, env);
                    }
                }
                match default {
                    Some(d) => self.eval(d, env),
                    None => Ok(None),
                }
            }
            Expr::MinMax { greatest, args, .. } => {
                let mut best: Option<Value> = None;
                for arg in args {
                    if let Some(value) = self.eval(arg, env)? {
                        let replace = match &best {
                            None => true,
                            Some(b) => {
                                let wanted = if *greatest {
                                    Ordering::Greater
                                } else {
                                    Ordering::Less
                                };
                                value.sql_cmp(b) == Some(wanted)
                            }
                        };
                        if replace {
                            best = Some(value);
                        }
                    }
                }
                Ok(best)
            }
            Expr::RelabelType { arg, .. } => self.eval(arg, env),
            Expr::CoerceViaIo { .. } | Expr::ScalarArrayOp { .. } | Expr::ScalarSubquery { .. } => {
                Err(EvalError::Fatal(format!(
                    "{} is not supported by the host evaluator",
                    expr.kind_name()
                )))
            }
        }
    }
}
