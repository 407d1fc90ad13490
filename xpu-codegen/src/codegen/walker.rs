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

//! Translation of a single expression tree.

use super::slots::{SlotSpace, SAVED_DEPTH};
use super::CodegenContext;
use crate::error::{ErrorKind, Result};
use crate::expr::{BoolOp, BoolTestKind, Expr};
use crate::kexp::{KexpWriter, Payload, VarDesc};
use crate::opcodes::{KexpFlags, OpCode, TypeOpCode};

impl<'a> CodegenContext<'a> {
    /// Assigns a load slot if an input relation provides `expr`.
    pub(super) fn input_slot(&mut self, expr: &Expr) -> Result<Option<u32>> {
        for (depth, rel) in self.input_rels.iter().enumerate() {
            if let Some(resno) = rel.resno_of(expr) {
                let ty = self.catalog.resolve_type(expr.type_oid())?;
                let slot = self
                    .slots
                    .assign(SlotSpace::Load, depth as i32, resno, expr, &ty);
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// A slot that already holds the value of `expr` when evaluation
    /// reaches it: an input attribute, or an expression saved by a node
    /// evaluated before.
    pub(super) fn reusable_slot(&mut self, expr: &Expr) -> Result<Option<u32>> {
        if let Some(slot) = self.input_slot(expr)? {
            return Ok(Some(slot));
        }
        Ok(self.slots.lookup(SlotSpace::Saved, expr))
    }

    /// Returns the slot that will hold `expr`, and whether the caller must
    /// emit a SaveExpr to fill it.
    pub(super) fn plan_slot(&mut self, expr: &Expr) -> Result<(u32, bool)> {
        if let Some(slot) = self.reusable_slot(expr)? {
            return Ok((slot, false));
        }
        let ty = self.catalog.resolve_type(expr.type_oid())?;
        let slot = self
            .slots
            .assign(SlotSpace::Saved, SAVED_DEPTH, 0, expr, &ty);
        Ok((slot, true))
    }

    pub(super) fn emit_var(
        &self,
        w: &mut KexpWriter,
        slot_id: u32,
        flags: KexpFlags,
    ) -> Result<TypeOpCode> {
        let entry = self
            .slots
            .get(slot_id)
            .ok_or_else(|| ErrorKind::LogicError(format!("slot {} is not assigned", slot_id)))?;
        let mark = w.begin(entry.type_code, OpCode::Var, flags);
        w.put_payload(&Payload::Var(VarDesc {
            slot_id,
            typlen: entry.typlen,
            typbyval: entry.typbyval,
            typalign: entry.typalign,
        }));
        w.finish(mark, 0)?;
        Ok(entry.type_code)
    }

    /// Emits a SaveExpr that evaluates `expr` into `slot_id`.
    pub(super) fn emit_save_expr(
        &mut self,
        w: &mut KexpWriter,
        slot_id: u32,
        expr: &Expr,
    ) -> Result<()> {
        let type_code = self
            .slots
            .get(slot_id)
            .map(|e| e.type_code)
            .ok_or_else(|| ErrorKind::LogicError(format!("slot {} is not assigned", slot_id)))?;
        let mut mark = w.begin(type_code, OpCode::SaveExpr, KexpFlags::empty());
        w.put_payload(&Payload::SaveExpr { slot_id });
        w.start_args(&mut mark);
        self.codegen_node(w, expr, KexpFlags::empty())?;
        w.finish(mark, 1)?;
        Ok(())
    }

    /// Emits `expr`, reading it from a slot if one already holds it.
    /// Returns the result type.
    pub(super) fn codegen_expr(
        &mut self,
        w: &mut KexpWriter,
        expr: &Expr,
        flags: KexpFlags,
    ) -> Result<TypeOpCode> {
        match self.reusable_slot(expr)? {
            Some(slot) => self.emit_var(w, slot, flags),
            None => self.codegen_node(w, expr, flags),
        }
    }

    /// Emits a boolean-valued `expr`.
    pub(super) fn codegen_bool(
        &mut self,
        w: &mut KexpWriter,
        expr: &Expr,
        flags: KexpFlags,
    ) -> Result<()> {
        let exptype = self.codegen_expr(w, expr, flags)?;
        if exptype != TypeOpCode::Bool {
            Err(ErrorKind::InvalidArgument(format!(
                "{} yields {:?} where a boolean is required",
                expr.kind_name(),
                exptype
            )))?;
        }
        Ok(())
    }

    fn codegen_node(
        &mut self,
        w: &mut KexpWriter,
        expr: &Expr,
        flags: KexpFlags,
    ) -> Result<TypeOpCode> {
        match expr {
            Expr::Const { type_oid, value } => {
                let ty = self.catalog.resolve_type(*type_oid)?;
                if let Some(v) = value {
                    if v.type_code() != ty.code {
                        Err(ErrorKind::InvalidArgument(format!(
                            "Const of type {} holds a {:?} value",
                            ty.name,
                            v.type_code()
                        )))?;
                    }
                }
                let mark = w.begin(ty.code, OpCode::Const, flags);
                w.put_payload(&Payload::Const {
                    type_oid: *type_oid,
                    value: value.clone(),
                });
                w.finish(mark, 0)?;
                Ok(ty.code)
            }
            Expr::Param {
                param_id, type_oid, ..
            } => {
                let ty = self.catalog.resolve_type(*type_oid)?;
                if !self.used_params.contains(param_id) {
                    self.used_params.push(*param_id);
                }
                let mark = w.begin(ty.code, OpCode::Param, flags);
                w.put_payload(&Payload::Param {
                    param_id: *param_id,
                });
                w.finish(mark, 0)?;
                Ok(ty.code)
            }
            Expr::Var { varno, attno, .. } => Err(ErrorKind::InvalidArgument(format!(
                "Var(varno={}, attno={}) is not provided by any input relation",
                varno, attno
            )))?,
            Expr::Func {
                func_oid,
                args,
                collation,
                ..
            } => self.codegen_func(w, *func_oid, args, *collation, flags),
            Expr::Op {
                opno,
                args,
                collation,
                ..
            } => {
                let func_oid = self.catalog.host().operator_func(*opno).ok_or_else(|| {
                    ErrorKind::Unsupported(format!(
                        "operator {} has no implementing function",
                        opno
                    ))
                })?;
                self.codegen_func(w, func_oid, args, *collation, flags)
            }
            Expr::Bool { op, args } => {
                let (opcode, valid) = match op {
                    BoolOp::And => (OpCode::BoolAnd, args.len() >= 2),
                    BoolOp::Or => (OpCode::BoolOr, args.len() >= 2),
                    BoolOp::Not => (OpCode::BoolNot, args.len() == 1),
                };
                if !valid {
                    Err(ErrorKind::InvalidArgument(format!(
                        "{} with {} arguments",
                        opcode.name(),
                        args.len()
                    )))?;
                }
                let mut mark = w.begin(TypeOpCode::Bool, opcode, flags);
                w.start_args(&mut mark);
                for arg in args {
                    self.codegen_bool(w, arg, KexpFlags::empty())?;
                }
                w.finish(mark, args.len() as u32)?;
                Ok(TypeOpCode::Bool)
            }
            Expr::NullTest { arg, is_null } => {
                let opcode = if *is_null {
                    OpCode::IsNull
                } else {
                    OpCode::IsNotNull
                };
                let mut mark = w.begin(TypeOpCode::Bool, opcode, flags);
                w.start_args(&mut mark);
                self.codegen_expr(w, arg, KexpFlags::empty())?;
                w.finish(mark, 1)?;
                Ok(TypeOpCode::Bool)
            }
            Expr::BoolTest { arg, test } => {
                let opcode = match test {
                    BoolTestKind::IsTrue => OpCode::IsTrue,
                    BoolTestKind::IsNotTrue => OpCode::IsNotTrue,
                    BoolTestKind::IsFalse => OpCode::IsFalse,
                    BoolTestKind::IsNotFalse => OpCode::IsNotFalse,
                    BoolTestKind::IsUnknown => OpCode::IsUnknown,
                    BoolTestKind::IsNotUnknown => OpCode::IsNotUnknown,
                };
                let mut mark = w.begin(TypeOpCode::Bool, opcode, flags);
                w.start_args(&mut mark);
                self.codegen_bool(w, arg, KexpFlags::empty())?;
                w.finish(mark, 1)?;
                Ok(TypeOpCode::Bool)
            }
            other => Err(ErrorKind::Unsupported(format!(
                "{} is not supported on the device",
                other.kind_name()
            )))?,
        }
    }

    fn codegen_func(
        &mut self,
        w: &mut KexpWriter,
        func_oid: u32,
        args: &[Expr],
        collation: u32,
        flags: KexpFlags,
    ) -> Result<TypeOpCode> {
        let arg_types: Vec<u32> = args.iter().map(Expr::type_oid).collect();
        let func = self
            .catalog
            .resolve_function(func_oid, &arg_types, collation, self.devkind)?;
        self.device_cost = self.device_cost.saturating_add(func.cost);

        let exptype = func.ret_code();
        let mut mark = w.begin(exptype, func.opcode(), flags);
        w.start_args(&mut mark);
        for arg in args {
            self.codegen_expr(w, arg, KexpFlags::empty())?;
        }
        w.finish(mark, args.len() as u32)?;
        Ok(exptype)
    }
}
