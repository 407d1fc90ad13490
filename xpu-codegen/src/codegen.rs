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

//! Expression compiler.
//!
//! Translates planner expressions into validated bytecode blobs. A
//! `CodegenContext` lives for the planning of one plan node: it tracks the
//! input relations whose attributes can be loaded, the variable slots
//! assigned so far, the referenced parameters, and the estimated device
//! cost. Every blob of the node is compiled through the same context, thus
//! all blobs agree on the slot numbering.
//!
//! An expression kind, type, or function that has no device counterpart
//! aborts compilation of the whole blob with an `Unsupported` error naming
//! the offending node. The planner then keeps the node on the host.

mod builders;
mod explain;
mod slots;
mod walker;

pub use builders::{GroupByCode, JoinQualsDesc};
pub use explain::explain;
pub use slots::{SlotEntry, SlotSpace, SlotTable, GROUPBY_FINAL_DEPTH, SAVED_DEPTH};

use crate::catalog::DevCatalog;
use crate::expr::InputRel;
use crate::opcodes::DevKind;

/// Width assumed for a variable-length value computed on the device
pub const VARLENA_WIDTH_ESTIMATE: u32 = 64;

/// Compilation state of one plan node
pub struct CodegenContext<'a> {
    catalog: &'a DevCatalog,
    devkind: DevKind,
    input_rels: Vec<InputRel>,
    slots: SlotTable,
    used_params: Vec<u32>,
    device_cost: u32,
    extra_bufsz: u32,
}

/// Everything the executor needs besides the blobs
#[derive(Clone, Debug, PartialEq)]
pub struct CodegenSummary {
    pub slots: SlotTable,
    pub used_params: Vec<u32>,
    pub device_cost: u32,
    /// Worst-case bytes per output row for computed variable-length values
    pub extra_bufsz: u32,
    pub kvars_nslots: usize,
    pub kvars_bufsz: u32,
}

impl<'a> CodegenContext<'a> {
    /// Creates a context that loads input depth `i` from `input_rels[i]`.
    /// Functions must be executable on a GPU unless changed with
    /// `with_devkind`.
    pub fn new(catalog: &'a DevCatalog, input_rels: Vec<InputRel>) -> Self {
        Self {
            catalog,
            devkind: DevKind::GPU,
            input_rels,
            slots: SlotTable::new(),
            used_params: Vec::new(),
            device_cost: 0,
            extra_bufsz: 0,
        }
    }

    pub fn with_devkind(mut self, devkind: DevKind) -> Self {
        self.devkind = devkind;
        self
    }

    pub fn catalog(&self) -> &DevCatalog {
        self.catalog
    }

    pub fn devkind(&self) -> DevKind {
        self.devkind
    }

    pub fn input_rels(&self) -> &[InputRel] {
        &self.input_rels
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    /// Parameter ids referenced so far, in order of first use.
    pub fn used_params(&self) -> &[u32] {
        &self.used_params
    }

    pub fn device_cost(&self) -> u32 {
        self.device_cost
    }

    pub fn extra_bufsz(&self) -> u32 {
        self.extra_bufsz
    }

    pub fn kvars_nslots(&self) -> usize {
        self.slots.len()
    }

    /// Ends compilation.
    pub fn finish(self) -> CodegenSummary {
        CodegenSummary {
            kvars_nslots: self.slots.len(),
            kvars_bufsz: self.slots.kvars_bufsz(),
            slots: self.slots,
            used_params: self.used_params,
            device_cost: self.device_cost,
            extra_bufsz: self.extra_bufsz,
        }
    }
}
