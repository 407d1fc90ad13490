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

//! Variable slot allocator.
//!
//! Every distinct value that bytecode reads is addressed by a slot id. A
//! slot is filled either by loading an attribute of an input row, by a
//! SaveExpr node that materializes a computed expression, or by loading a
//! group-by key from an aggregation row. The three numbering spaces share one
//! id sequence but never share entries: the same column read from an input
//! row and from the aggregation row gets two distinct slots.

use crate::catalog::DevType;
use crate::expr::Expr;
use crate::kexp::LoadEntry;
use crate::opcodes::TypeOpCode;

/// Depth of slots that SaveExpr nodes fill
pub const SAVED_DEPTH: i32 = -1;
/// Depth of slots loaded from the aggregation row
pub const GROUPBY_FINAL_DEPTH: i32 = -2;

/// Storage reserved in the scratch buffer for a variable-length value
const VARLENA_SLOT_SZ: u32 = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotSpace {
    /// Loaded from an input row
    Load,
    /// Materialized by a SaveExpr node
    Saved,
    /// Loaded from the aggregation row
    GroupByFinal,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SlotEntry {
    pub slot_id: u32,
    pub space: SlotSpace,
    /// Input depth for loaded slots; `SAVED_DEPTH` or
    /// `GROUPBY_FINAL_DEPTH` otherwise
    pub depth: i32,
    /// Attribute number within the source row; 0 for saved slots
    pub resno: i32,
    pub expr: Expr,
    pub type_code: TypeOpCode,
    pub typlen: i16,
    pub typbyval: bool,
    pub typalign: u8,
    /// Offset of the scratch storage for values that cannot be held in a
    /// register-sized datum
    pub slot_off: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SlotTable {
    entries: Vec<SlotEntry>,
    bufsz: u32,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SlotEntry] {
        &self.entries
    }

    pub fn get(&self, slot_id: u32) -> Option<&SlotEntry> {
        self.entries.get(slot_id as usize)
    }

    /// Size of the scratch buffer of all slots.
    pub fn kvars_bufsz(&self) -> u32 {
        self.bufsz
    }

    /// Finds the slot of a structurally equal expression in `space`.
    pub fn lookup(&self, space: SlotSpace, expr: &Expr) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.space == space && e.expr == *expr)
            .map(|e| e.slot_id)
    }

    /// Returns the slot of `expr` in `space`, assigning a new one if no
    /// structurally equal expression has a slot yet.
    pub fn assign(
        &mut self,
        space: SlotSpace,
        depth: i32,
        resno: i32,
        expr: &Expr,
        ty: &DevType,
    ) -> u32 {
        if let Some(slot_id) = self.lookup(space, expr) {
            return slot_id;
        }
        let slot_off = if ty.uses_slotbuf() {
            let size = ty.code.fixed_len().map_or(VARLENA_SLOT_SZ, |l| l as u32);
            let align = u32::from(ty.typalign.max(1));
            let off = (self.bufsz + align - 1) / align * align;
            self.bufsz = off + size;
            Some(off)
        } else {
            None
        };
        let slot_id = self.entries.len() as u32;
        self.entries.push(SlotEntry {
            slot_id,
            space,
            depth,
            resno,
            expr: expr.clone(),
            type_code: ty.code,
            typlen: ty.typlen,
            typbyval: ty.typbyval,
            typalign: ty.typalign,
            slot_off,
        });
        slot_id
    }

    /// Load list of a depth, sorted by attribute number so that a row is
    /// read front to back.
    pub fn loads_at(&self, depth: i32) -> Vec<LoadEntry> {
        let mut loads: Vec<LoadEntry> = self
            .entries
            .iter()
            .filter(|e| e.space != SlotSpace::Saved && e.depth == depth)
            .map(|e| LoadEntry {
                resno: e.resno,
                slot_id: e.slot_id,
                slot_off: e.slot_off.unwrap_or(0),
            })
            .collect();
        loads.sort_by_key(|l| (l.resno, l.slot_id));
        loads
    }
}
