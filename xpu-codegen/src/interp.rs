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

//! Bytecode interpreter.
//!
//! Evaluates validated bytecode over a kvars buffer, one row at a time.
//! This is what a device kernel executes per row. Per-row failures are
//! reported as `EvalError`; the caller decides whether to fall back to the
//! host.

use crate::catalog::func_catalog;
use crate::catalog::hash::hash_keys;
use crate::datum::{Datum, Row, Value};
use crate::error::Error;
use crate::func_ops::{apply, Precision};
use crate::kexp::{AggDesc, KexpNode, Payload};
use crate::opcodes::{KexpFlags, OpCode};

pub use crate::func_ops::{EvalError, EvalResult};

fn fatal_from(e: Error) -> EvalError {
    EvalError::Fatal(e.to_string())
}

fn not_expected<T>(node: KexpNode<'_>, what: &str) -> EvalResult<T> {
    Err(EvalError::Fatal(format!(
        "{:?} at offset {} is not {}",
        node.opcode(),
        node.offset(),
        what
    )))
}

/// Per-thread evaluation state
#[derive(Clone, Debug)]
pub struct KernContext<'a> {
    /// Values of the variable slots
    pub kvars: Vec<Datum>,
    params: &'a [Datum],
    precision: Precision,
}

impl<'a> KernContext<'a> {
    pub fn new(nslots: usize, params: &'a [Datum]) -> Self {
        Self {
            kvars: vec![None; nslots],
            params,
            precision: Precision::Device,
        }
    }

    /// Evaluates with host precision instead of device precision.
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Clears all slots.
    pub fn reset(&mut self) {
        self.kvars.iter_mut().for_each(|v| *v = None);
    }

    fn set_slot(&mut self, slot: u32, value: Datum) -> EvalResult<()> {
        match self.kvars.get_mut(slot as usize) {
            Some(s) => {
                *s = value;
                Ok(())
            }
            None => Err(EvalError::Fatal(format!("slot {} out of range", slot))),
        }
    }

    fn slot(&self, slot: u32) -> EvalResult<Datum> {
        self.kvars
            .get(slot as usize)
            .cloned()
            .ok_or_else(|| EvalError::Fatal(format!("slot {} out of range", slot)))
    }
}

fn eval_bool(ctx: &mut KernContext<'_>, node: KexpNode<'_>) -> EvalResult<Option<bool>> {
    match exec_expression(ctx, node)? {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(other) => Err(EvalError::Fatal(format!(
            "expected bool, got {:?}",
            other.type_code()
        ))),
    }
}

/// Evaluates an expression node.
pub fn exec_expression(ctx: &mut KernContext<'_>, node: KexpNode<'_>) -> EvalResult<Datum> {
    match node.opcode() {
        OpCode::Const => match node.payload().map_err(fatal_from)? {
            Payload::Const { value, .. } => Ok(value),
            _ => not_expected(node, "a constant"),
        },
        OpCode::Param => {
            let id = node.payload_u32() as usize;
            ctx.params
                .get(id)
                .cloned()
                .ok_or_else(|| EvalError::Fatal(format!("parameter {} is not bound", id)))
        }
        OpCode::Var => ctx.slot(node.payload_u32()),
        OpCode::SaveExpr => {
            let child = match node.child(0) {
                Some(c) => c,
                None => return not_expected(node, "a complete SaveExpr"),
            };
            let value = exec_expression(ctx, child)?;
            ctx.set_slot(node.payload_u32(), value.clone())?;
            Ok(value)
        }
        OpCode::Func(index) => {
            let entry = match func_catalog().get(index as usize) {
                Some(e) => e,
                None => return not_expected(node, "a known function"),
            };
            let mut args = Vec::with_capacity(node.nr_args());
            for child in node.children() {
                args.push(exec_expression(ctx, child)?);
            }
            apply(entry.op, node.exptype(), &args, ctx.precision)
        }
        OpCode::BoolAnd => {
            let mut any_null = false;
            for child in node.children() {
                match eval_bool(ctx, child)? {
                    Some(false) => return Ok(Some(Value::Bool(false))),
                    None => any_null = true,
                    Some(true) => {}
                }
            }
            Ok(if any_null { None } else { Some(Value::Bool(true)) })
        }
        OpCode::BoolOr => {
            let mut any_null = false;
            for child in node.children() {
                match eval_bool(ctx, child)? {
                    Some(true) => return Ok(Some(Value::Bool(true))),
                    None => any_null = true,
                    Some(false) => {}
                }
            }
            Ok(if any_null { None } else { Some(Value::Bool(false)) })
        }
        OpCode::BoolNot => match node.child(0) {
            Some(child) => Ok(eval_bool(ctx, child)?.map(|b| Value::Bool(!b))),
            None => not_expected(node, "a complete NOT"),
        },
        OpCode::IsNull | OpCode::IsNotNull => {
            let child = match node.child(0) {
                Some(c) => c,
                None => return not_expected(node, "a complete null test"),
            };
            let is_null = exec_expression(ctx, child)?.is_none();
            Ok(Some(Value::Bool(is_null == (node.opcode() == OpCode::IsNull))))
        }
        op @ OpCode::IsTrue
        | op @ OpCode::IsNotTrue
        | op @ OpCode::IsFalse
        | op @ OpCode::IsNotFalse
        | op @ OpCode::IsUnknown
        | op @ OpCode::IsNotUnknown => {
            let child = match node.child(0) {
                Some(c) => c,
                None => return not_expected(node, "a complete boolean test"),
            };
            let b = eval_bool(ctx, child)?;
            let result = match op {
                OpCode::IsTrue => b == Some(true),
                OpCode::IsNotTrue => b != Some(true),
                OpCode::IsFalse => b == Some(false),
                OpCode::IsNotFalse => b != Some(false),
                OpCode::IsUnknown => b.is_none(),
                _ => b.is_some(),
            };
            Ok(Some(Value::Bool(result)))
        }
        OpCode::HashValue => {
            let (hash, _) = exec_hash_value(ctx, node)?;
            Ok(Some(Value::Int4(hash as i32)))
        }
        OpCode::LoadVars
        | OpCode::Projection
        | OpCode::JoinQuals
        | OpCode::Packed
        | OpCode::AggFuncs => not_expected(node, "an expression"),
    }
}

/// Loads the attributes listed by a LoadVars node from `row` into slots.
///
/// A missing row (the NULL side of an outer join) loads NULLs.
pub fn exec_loadvars(
    ctx: &mut KernContext<'_>,
    node: KexpNode<'_>,
    row: Option<&[Datum]>,
) -> EvalResult<()> {
    let entries = match node.payload().map_err(fatal_from)? {
        Payload::LoadVars { entries, .. } => entries,
        _ => return not_expected(node, "LoadVars"),
    };
    for entry in entries {
        let value = match row {
            None => None,
            Some(r) => match r.get((entry.resno - 1) as usize) {
                Some(v) => v.clone(),
                None => {
                    return Err(EvalError::Fatal(format!(
                        "attribute {} beyond row of {} attributes",
                        entry.resno,
                        r.len()
                    )))
                }
            },
        };
        ctx.set_slot(entry.slot_id, value)?;
    }
    Ok(())
}

/// Evaluates a qualifier. NULL counts as false; a missing qualifier as
/// true.
pub fn exec_quals(ctx: &mut KernContext<'_>, node: Option<KexpNode<'_>>) -> EvalResult<bool> {
    match node {
        None => Ok(true),
        Some(n) => Ok(eval_bool(ctx, n)? == Some(true)),
    }
}

/// Evaluates a JoinQuals node.
///
/// Returns whether the join quals hold (the rows match) and whether the
/// pushed-down other quals hold too (the row is emitted). A missing node
/// matches everything.
pub fn exec_join_quals(
    ctx: &mut KernContext<'_>,
    node: Option<KexpNode<'_>>,
) -> EvalResult<(bool, bool)> {
    let node = match node {
        None => return Ok((true, true)),
        Some(n) => n,
    };
    if node.opcode() != OpCode::JoinQuals {
        return not_expected(node, "JoinQuals");
    }
    let mut other_ok = true;
    for child in node.children() {
        let pushed_down = child.flags().contains(KexpFlags::IS_PUSHED_DOWN);
        if pushed_down && !other_ok {
            continue;
        }
        let ok = eval_bool(ctx, child)? == Some(true);
        if !ok {
            if pushed_down {
                other_ok = false;
            } else {
                return Ok((false, false));
            }
        }
    }
    Ok((true, other_ok))
}

/// Evaluates only the pushed-down quals of a JoinQuals node, e.g., for a
/// null-extended row of an outer join.
pub fn exec_other_quals(
    ctx: &mut KernContext<'_>,
    node: Option<KexpNode<'_>>,
) -> EvalResult<bool> {
    let node = match node {
        None => return Ok(true),
        Some(n) => n,
    };
    for child in node.children() {
        if child.flags().contains(KexpFlags::IS_PUSHED_DOWN)
            && eval_bool(ctx, child)? != Some(true)
        {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Evaluates a HashValue node into the key hash and whether all keys are
/// NULL.
pub fn exec_hash_value(ctx: &mut KernContext<'_>, node: KexpNode<'_>) -> EvalResult<(u32, bool)> {
    if node.opcode() != OpCode::HashValue {
        return not_expected(node, "HashValue");
    }
    let mut keys = Vec::with_capacity(node.nr_args());
    for child in node.children() {
        keys.push(exec_expression(ctx, child)?);
    }
    Ok(hash_keys(keys.iter().map(Option::as_ref)))
}

/// Evaluates a Projection node into an output row.
pub fn exec_projection(ctx: &mut KernContext<'_>, node: KexpNode<'_>) -> EvalResult<Row> {
    let slots = match node.payload().map_err(fatal_from)? {
        Payload::Projection { slots } => slots,
        _ => return not_expected(node, "Projection"),
    };
    for child in node.children() {
        exec_expression(ctx, child)?;
    }
    slots.into_iter().map(|s| ctx.slot(s)).collect()
}

/// Evaluates the arguments of an AggFuncs node.
///
/// Returns every aggregate descriptor with the values of its argument
/// slots.
pub fn exec_aggfuncs(
    ctx: &mut KernContext<'_>,
    node: KexpNode<'_>,
) -> EvalResult<Vec<(AggDesc, Datum, Datum)>> {
    let descs = match node.payload().map_err(fatal_from)? {
        Payload::AggFuncs { descs } => descs,
        _ => return not_expected(node, "AggFuncs"),
    };
    for child in node.children() {
        exec_expression(ctx, child)?;
    }
    descs
        .into_iter()
        .map(|d| {
            let arg = |slot: i32| {
                if slot < 0 {
                    Ok(None)
                } else {
                    ctx.slot(slot as u32)
                }
            };
            Ok((d, arg(d.arg0)?, arg(d.arg1)?))
        })
        .collect()
}
