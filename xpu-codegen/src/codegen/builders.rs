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

//! Builders of the bytecode blobs that make up a device task.
//!
//! Blobs of one plan node share the slot table of their `CodegenContext`.
//! A SaveExpr fills its slot when its blob is evaluated, so a saved slot is
//! only reused by blobs that the executor evaluates afterwards: join quals
//! before the projection, group-by keys before the aggregate functions.
//!
//! A failing builder leaves the context as it was before the call.

use super::slots::{SlotSpace, SlotTable, GROUPBY_FINAL_DEPTH};
use super::{CodegenContext, VARLENA_WIDTH_ESTIMATE};
use crate::catalog::oid;
use crate::error::{ErrorKind, Result};
use crate::expr::{Expr, PartialAgg, TargetEntry};
use crate::kexp::{AggDesc, Bytecode, KexpWriter, LoadEntry, Payload, KEXP_HEADER_SZ};
use crate::opcodes::{AggAction, KexpFlags, OpCode, TypeOpCode};
use tracing::debug;

/// Qualifiers of one join depth
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JoinQualsDesc {
    /// Decide whether the outer and inner rows match
    pub join_quals: Vec<Expr>,
    /// Filter the joined row, including null-extended rows of outer joins
    pub other_quals: Vec<Expr>,
}

/// Blobs of a group-by stage
#[derive(Debug)]
pub struct GroupByCode {
    /// HashValue over the grouping keys of an input row
    pub keyhash: Bytecode,
    /// LoadVars of the grouping keys from an aggregation row
    pub keyload: Bytecode,
    /// Equality of the input keys and the loaded keys
    pub keycomp: Bytecode,
    /// Slots holding the keys of the input row
    pub key_slots: Vec<u32>,
    /// Slots holding the keys of the aggregation row
    pub final_slots: Vec<u32>,
}

struct Snapshot {
    slots: SlotTable,
    used_params: Vec<u32>,
    device_cost: u32,
    extra_bufsz: u32,
}

fn emit_loadvars(w: &mut KexpWriter, depth: i32, entries: Vec<LoadEntry>) -> Result<()> {
    let mark = w.begin(TypeOpCode::Invalid, OpCode::LoadVars, KexpFlags::empty());
    w.put_payload(&Payload::LoadVars { depth, entries });
    w.finish(mark, 0)?;
    Ok(())
}

impl<'a> CodegenContext<'a> {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            slots: self.slots.clone(),
            used_params: self.used_params.clone(),
            device_cost: self.device_cost,
            extra_bufsz: self.extra_bufsz,
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.slots = snapshot.slots;
        self.used_params = snapshot.used_params;
        self.device_cost = snapshot.device_cost;
        self.extra_bufsz = snapshot.extra_bufsz;
    }

    fn atomically<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let snapshot = self.snapshot();
        let result = f(self);
        if let Err(ref e) = result {
            debug!(error = %e, "device code generation failed");
            self.restore(snapshot);
        }
        result
    }

    /// Emits a Packed node with `nitems` items. `item` writes item `i` and
    /// returns `true`, or writes nothing and returns `false` if the item is
    /// absent. Returns `None` if all items are absent.
    fn emit_packed<F>(&mut self, nitems: usize, mut item: F) -> Result<Option<Bytecode>>
    where
        F: FnMut(&mut Self, &mut KexpWriter, usize) -> Result<bool>,
    {
        self.atomically(move |ctx| {
            let mut w = KexpWriter::new();
            let mut mark = w.begin(TypeOpCode::Invalid, OpCode::Packed, KexpFlags::empty());
            w.put_payload(&Payload::Packed {
                offsets: vec![0; nitems],
            });
            w.start_args(&mut mark);

            let mut nr_args = 0;
            for i in 0..nitems {
                let pos = w.position();
                if item(ctx, &mut w, i)? {
                    let slot_pos = mark.start() + KEXP_HEADER_SZ + 4 + 4 * i;
                    w.patch_u32(slot_pos, (pos - mark.start()) as u32);
                    nr_args += 1;
                }
            }
            if nr_args == 0 {
                return Ok(None);
            }
            w.finish(mark, nr_args)?;
            Ok(Some(w.into_bytecode()?))
        })
    }

    /// Compiles a single expression.
    pub fn codegen_expression(&mut self, expr: &Expr) -> Result<Bytecode> {
        self.atomically(|ctx| {
            let mut w = KexpWriter::new();
            ctx.codegen_expr(&mut w, expr, KexpFlags::empty())?;
            w.into_bytecode()
        })
    }

    /// Checks whether `expr` is device executable and returns its cost,
    /// without changing the context.
    pub fn xpu_expression(&mut self, expr: &Expr) -> Result<u32> {
        let snapshot = self.snapshot();
        let mut w = KexpWriter::new();
        let result = self.codegen_expr(&mut w, expr, KexpFlags::empty());
        let cost = self.device_cost - snapshot.device_cost;
        self.restore(snapshot);
        result.map(|_| cost)
    }

    /// Compiles the qualifiers of a scan as an implicit AND.
    pub fn codegen_scan_quals(&mut self, quals: &[Expr]) -> Result<Option<Bytecode>> {
        if quals.is_empty() {
            return Ok(None);
        }
        self.atomically(|ctx| {
            let mut w = KexpWriter::new();
            if let [qual] = quals {
                ctx.codegen_bool(&mut w, qual, KexpFlags::empty())?;
            } else {
                let mut mark = w.begin(TypeOpCode::Bool, OpCode::BoolAnd, KexpFlags::empty());
                w.start_args(&mut mark);
                for qual in quals {
                    ctx.codegen_bool(&mut w, qual, KexpFlags::empty())?;
                }
                w.finish(mark, quals.len() as u32)?;
            }
            Ok(Some(w.into_bytecode()?))
        })
    }

    /// LoadVars of all slots read from the scanned row.
    ///
    /// Call after compiling all other blobs of the scan.
    pub fn codegen_scan_loadvars(&mut self) -> Result<Option<Bytecode>> {
        let entries = self.slots.loads_at(0);
        if entries.is_empty() {
            return Ok(None);
        }
        let mut w = KexpWriter::new();
        emit_loadvars(&mut w, 0, entries)?;
        Ok(Some(w.into_bytecode()?))
    }

    /// Packed LoadVars, one item per input depth.
    ///
    /// Call after compiling all other blobs of the join.
    pub fn codegen_join_loadvars(&mut self) -> Result<Option<Bytecode>> {
        let nitems = self.input_rels.len();
        self.emit_packed(nitems, |ctx, w, depth| {
            let entries = ctx.slots.loads_at(depth as i32);
            if entries.is_empty() {
                return Ok(false);
            }
            emit_loadvars(w, depth as i32, entries)?;
            Ok(true)
        })
    }

    /// Packed JoinQuals; item `d` holds the qualifiers of inner depth `d`,
    /// `depths[d - 1]`. Other quals are flagged as pushed down.
    pub fn codegen_join_quals(&mut self, depths: &[JoinQualsDesc]) -> Result<Option<Bytecode>> {
        self.check_join_depths(depths.len())?;
        self.emit_packed(depths.len() + 1, |ctx, w, depth| {
            let desc = match depth.checked_sub(1).and_then(|d| depths.get(d)) {
                Some(d) if !d.join_quals.is_empty() || !d.other_quals.is_empty() => d,
                _ => return Ok(false),
            };
            let mut mark = w.begin(TypeOpCode::Bool, OpCode::JoinQuals, KexpFlags::empty());
            w.start_args(&mut mark);
            for qual in &desc.join_quals {
                ctx.codegen_bool(w, qual, KexpFlags::empty())?;
            }
            for qual in &desc.other_quals {
                ctx.codegen_bool(w, qual, KexpFlags::IS_PUSHED_DOWN)?;
            }
            let nr_args = desc.join_quals.len() + desc.other_quals.len();
            w.finish(mark, nr_args as u32)?;
            Ok(true)
        })
    }

    /// Packed HashValue; item `d` hashes the outer-side keys of inner depth
    /// `d`, `depths[d - 1]`. Depths without keys are nested-loop joins.
    pub fn codegen_hash_keys(&mut self, depths: &[Vec<Expr>]) -> Result<Option<Bytecode>> {
        self.check_join_depths(depths.len())?;
        self.emit_packed(depths.len() + 1, |ctx, w, depth| {
            let keys = match depth.checked_sub(1).and_then(|d| depths.get(d)) {
                Some(k) if !k.is_empty() => k,
                _ => return Ok(false),
            };
            let mut mark = w.begin(TypeOpCode::Int4, OpCode::HashValue, KexpFlags::empty());
            w.start_args(&mut mark);
            for key in keys {
                ctx.codegen_expr(w, key, KexpFlags::empty())?;
            }
            w.finish(mark, keys.len() as u32)?;
            Ok(true)
        })
    }

    fn check_join_depths(&self, ndepths: usize) -> Result<()> {
        if ndepths + 1 != self.input_rels.len() {
            Err(ErrorKind::InvalidArgument(format!(
                "{} join depths given for {} input relations",
                ndepths,
                self.input_rels.len()
            )))?;
        }
        Ok(())
    }

    /// Compiles a target list. Computed entries are saved into slots; the
    /// Projection lists the slots of the regular entries in order.
    ///
    /// Junk entries must follow all regular entries and are not emitted.
    pub fn codegen_projection(&mut self, tlist: &[TargetEntry]) -> Result<Bytecode> {
        if let Some(first_junk) = tlist.iter().position(|t| t.resjunk) {
            if tlist[first_junk..].iter().any(|t| !t.resjunk) {
                Err(ErrorKind::InvalidArgument(
                    "junk target entries must follow all regular entries".to_string(),
                ))?;
            }
        }
        self.atomically(|ctx| {
            let mut args = KexpWriter::new();
            let mut nr_args = 0;
            let mut slots = Vec::with_capacity(tlist.len());
            for entry in tlist.iter().filter(|t| !t.resjunk) {
                let (slot, needs_save) = ctx.plan_slot(&entry.expr)?;
                if needs_save {
                    ctx.emit_save_expr(&mut args, slot, &entry.expr)?;
                    nr_args += 1;
                    if ctx.slots.get(slot).map_or(false, |s| s.typlen < 0) {
                        ctx.extra_bufsz += VARLENA_WIDTH_ESTIMATE;
                    }
                }
                slots.push(slot);
            }

            let mut w = KexpWriter::new();
            let mut mark = w.begin(TypeOpCode::Invalid, OpCode::Projection, KexpFlags::empty());
            w.put_payload(&Payload::Projection { slots });
            w.start_args(&mut mark);
            w.put_bytes(&args.into_bytes());
            w.finish(mark, nr_args)?;
            w.into_bytecode()
        })
    }

    /// Compiles the grouping keys of a group-by stage.
    pub fn codegen_groupby(&mut self, keys: &[Expr]) -> Result<GroupByCode> {
        if keys.is_empty() {
            Err(ErrorKind::InvalidArgument(
                "group-by requires at least one key".to_string(),
            ))?;
        }
        self.atomically(|ctx| {
            let mut w = KexpWriter::new();
            let mut mark = w.begin(TypeOpCode::Int4, OpCode::HashValue, KexpFlags::empty());
            w.start_args(&mut mark);
            let mut key_slots = Vec::with_capacity(keys.len());
            for key in keys {
                let (slot, needs_save) = ctx.plan_slot(key)?;
                if needs_save {
                    ctx.emit_save_expr(&mut w, slot, key)?;
                } else {
                    ctx.emit_var(&mut w, slot, KexpFlags::empty())?;
                }
                key_slots.push(slot);
            }
            w.finish(mark, keys.len() as u32)?;
            let keyhash = w.into_bytecode()?;

            let mut final_slots = Vec::with_capacity(keys.len());
            for (i, key) in keys.iter().enumerate() {
                let ty = ctx.catalog.resolve_type(key.type_oid())?;
                final_slots.push(ctx.slots.assign(
                    SlotSpace::GroupByFinal,
                    GROUPBY_FINAL_DEPTH,
                    i as i32 + 1,
                    key,
                    &ty,
                ));
            }
            let mut w = KexpWriter::new();
            emit_loadvars(
                &mut w,
                GROUPBY_FINAL_DEPTH,
                ctx.slots.loads_at(GROUPBY_FINAL_DEPTH),
            )?;
            let keyload = w.into_bytecode()?;

            let mut w = KexpWriter::new();
            let and_mark = if keys.len() > 1 {
                let mut m = w.begin(TypeOpCode::Bool, OpCode::BoolAnd, KexpFlags::empty());
                w.start_args(&mut m);
                Some(m)
            } else {
                None
            };
            for (i, key) in keys.iter().enumerate() {
                ctx.emit_key_equality(&mut w, key, key_slots[i], final_slots[i])?;
            }
            if let Some(m) = and_mark {
                w.finish(m, keys.len() as u32)?;
            }
            let keycomp = w.into_bytecode()?;

            Ok(GroupByCode {
                keyhash,
                keyload,
                keycomp,
                key_slots,
                final_slots,
            })
        })
    }

    fn emit_key_equality(
        &mut self,
        w: &mut KexpWriter,
        key: &Expr,
        input_slot: u32,
        final_slot: u32,
    ) -> Result<()> {
        let ty = self.catalog.resolve_type(key.type_oid())?;
        let eq_func = ty.eq_func.ok_or_else(|| {
            ErrorKind::Unsupported(format!("type {} has no equality function", ty.name))
        })?;
        let func = self.catalog.resolve_function(
            eq_func,
            &[ty.type_oid, ty.type_oid],
            oid::C_COLLATION,
            self.devkind,
        )?;
        self.device_cost = self.device_cost.saturating_add(func.cost);

        let mut mark = w.begin(func.ret_code(), func.opcode(), KexpFlags::empty());
        w.start_args(&mut mark);
        self.emit_var(w, input_slot, KexpFlags::empty())?;
        self.emit_var(w, final_slot, KexpFlags::empty())?;
        w.finish(mark, 2)?;
        Ok(())
    }

    /// Compiles the partial aggregates of a group-by stage.
    ///
    /// `keys` are the grouping keys compiled by `codegen_groupby` before.
    pub fn codegen_aggfuncs(&mut self, targets: &[PartialAgg], keys: &[Expr]) -> Result<Bytecode> {
        self.atomically(|ctx| {
            let mut args = KexpWriter::new();
            let mut nr_args = 0;
            let mut descs = Vec::with_capacity(targets.len());
            for target in targets {
                let desc = match target {
                    PartialAgg::Key(i) => {
                        let key = keys.get(*i).ok_or_else(|| {
                            ErrorKind::InvalidArgument(format!("grouping key {} does not exist", i))
                        })?;
                        let slot = ctx.reusable_slot(key)?.ok_or_else(|| {
                            ErrorKind::InvalidArgument(format!(
                                "grouping key {} has no slot; compile the keys first",
                                i
                            ))
                        })?;
                        AggDesc {
                            action: AggAction::Vref,
                            arg0: slot as i32,
                            arg1: -1,
                        }
                    }
                    PartialAgg::CountStar => AggDesc {
                        action: AggAction::NRowsAny,
                        arg0: -1,
                        arg1: -1,
                    },
                    PartialAgg::Count(e) => AggDesc {
                        action: AggAction::NRowsCond,
                        arg0: ctx.agg_arg(&mut args, &mut nr_args, e)?,
                        arg1: -1,
                    },
                    PartialAgg::Min(e) => ctx.typed_agg(
                        &mut args,
                        &mut nr_args,
                        e,
                        AggAction::PMinInt,
                        AggAction::PMinFp,
                    )?,
                    PartialAgg::Max(e) => ctx.typed_agg(
                        &mut args,
                        &mut nr_args,
                        e,
                        AggAction::PMaxInt,
                        AggAction::PMaxFp,
                    )?,
                    PartialAgg::Sum(e) => ctx.typed_agg(
                        &mut args,
                        &mut nr_args,
                        e,
                        AggAction::PSumInt,
                        AggAction::PSumFp,
                    )?,
                    PartialAgg::Avg(e) => ctx.typed_agg(
                        &mut args,
                        &mut nr_args,
                        e,
                        AggAction::PAvgInt,
                        AggAction::PAvgFp,
                    )?,
                    PartialAgg::Stddev(e) => ctx.typed_agg(
                        &mut args,
                        &mut nr_args,
                        e,
                        AggAction::Stddev,
                        AggAction::Stddev,
                    )?,
                    PartialAgg::Covar(x, y) => {
                        ctx.agg_is_float(x)?;
                        ctx.agg_is_float(y)?;
                        AggDesc {
                            action: AggAction::Covar,
                            arg0: ctx.agg_arg(&mut args, &mut nr_args, x)?,
                            arg1: ctx.agg_arg(&mut args, &mut nr_args, y)?,
                        }
                    }
                };
                descs.push(desc);
            }

            let mut w = KexpWriter::new();
            let mut mark = w.begin(TypeOpCode::Invalid, OpCode::AggFuncs, KexpFlags::empty());
            w.put_payload(&Payload::AggFuncs { descs });
            w.start_args(&mut mark);
            w.put_bytes(&args.into_bytes());
            w.finish(mark, nr_args)?;
            w.into_bytecode()
        })
    }

    fn agg_arg(&mut self, args: &mut KexpWriter, nr_args: &mut u32, expr: &Expr) -> Result<i32> {
        let (slot, needs_save) = self.plan_slot(expr)?;
        if needs_save {
            self.emit_save_expr(args, slot, expr)?;
            *nr_args += 1;
        }
        Ok(slot as i32)
    }

    /// Returns `true` for floating-point arguments, `false` for integers.
    fn agg_is_float(&self, expr: &Expr) -> Result<bool> {
        let ty = self.catalog.resolve_type(expr.type_oid())?;
        if ty.code.is_integer() {
            Ok(false)
        } else if ty.code.is_float() {
            Ok(true)
        } else {
            Err(ErrorKind::Unsupported(format!(
                "partial aggregate over {} is not supported on the device",
                ty.name
            )))?
        }
    }

    fn typed_agg(
        &mut self,
        args: &mut KexpWriter,
        nr_args: &mut u32,
        expr: &Expr,
        int_action: AggAction,
        fp_action: AggAction,
    ) -> Result<AggDesc> {
        let action = if self.agg_is_float(expr)? {
            fp_action
        } else {
            int_action
        };
        Ok(AggDesc {
            action,
            arg0: self.agg_arg(args, nr_args, expr)?,
            arg1: -1,
        })
    }
}
