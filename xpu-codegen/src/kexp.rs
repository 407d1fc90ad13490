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

//! Kernel expression bytecode.
//!
//! Layout of a node (little-endian):
//!
//! ```text
//! offset       size  field
//! 0            4     len          node length incl. children and trailer
//! 4            2     exptype      result type opcode
//! 6            2     opcode       operation opcode
//! 8            4     expflags     flag bits
//! 12           4     nr_args      number of child nodes
//! 16           4     args_offset  offset of the first child
//! 20           4     reserved     zero
//! 24           ...   payload      operation specific, padded to 8 bytes
//! args_offset  ...   children     nr_args nodes
//! ...          ...   padding      zeros, so that the trailer ends aligned
//! len - 4      4     trailer      see `trailer_magic`
//! ```

mod reader;
mod writer;

pub use reader::{Bytecode, Children, KexpNode};
pub use writer::{KexpWriter, NodeMark};

use crate::datum::Value;
use crate::opcodes::{AggAction, KexpFlags, OpCode, TypeOpCode};

pub const KEXP_HEADER_SZ: usize = 24;
pub const KEXP_TRAILER_SZ: usize = 4;
pub const MAXALIGN: usize = 8;
/// Smallest possible node: a header and an aligned trailer
pub const KEXP_MIN_LEN: usize = 32;
pub const KEXP_MAGIC: u32 = 0x4b45_5850;

/// Computes the trailer of a node.
///
/// `crc` is the CRC-32 of the node header and payload, i.e., the bytes
/// before `args_offset`.
pub fn trailer_magic(exptype: u16, opcode: u16, crc: u32) -> u32 {
    KEXP_MAGIC ^ (u32::from(exptype) << 6) ^ (u32::from(opcode) << 14) ^ crc
}

pub(crate) fn maxalign(len: usize) -> usize {
    (len + MAXALIGN - 1) & !(MAXALIGN - 1)
}

/// Var payload: a slot reference with the physical type of the value
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VarDesc {
    pub slot_id: u32,
    pub typlen: i16,
    pub typbyval: bool,
    pub typalign: u8,
}

/// LoadVars entry: copy attribute `resno` of the row into slot `slot_id`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LoadEntry {
    pub resno: i32,
    pub slot_id: u32,
    /// Offset of the scratch storage in the kvars buffer
    pub slot_off: u32,
}

/// AggFuncs entry: a partial aggregate over argument slots
///
/// Unused argument slots are -1.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AggDesc {
    pub action: AggAction,
    pub arg0: i32,
    pub arg1: i32,
}

/// Operation-specific payload of a node
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    None,
    Const {
        type_oid: u32,
        value: Option<Value>,
    },
    Param {
        param_id: u32,
    },
    Var(VarDesc),
    LoadVars {
        depth: i32,
        entries: Vec<LoadEntry>,
    },
    SaveExpr {
        slot_id: u32,
    },
    Projection {
        slots: Vec<u32>,
    },
    /// Offsets of the items relative to the node start; 0 marks an absent
    /// item
    Packed {
        offsets: Vec<u32>,
    },
    AggFuncs {
        descs: Vec<AggDesc>,
    },
}

/// A decoded node with its subtree
#[derive(Clone, Debug, PartialEq)]
pub struct KexpTree {
    pub exptype: TypeOpCode,
    pub opcode: OpCode,
    pub flags: KexpFlags,
    pub payload: Payload,
    pub children: Vec<KexpTree>,
}

impl KexpTree {
    /// Pre-order sequence of (opcode, exptype, number of children).
    pub fn shape(&self) -> Vec<(OpCode, TypeOpCode, usize)> {
        let mut out = Vec::new();
        self.collect_shape(&mut out);
        out
    }

    fn collect_shape(&self, out: &mut Vec<(OpCode, TypeOpCode, usize)>) {
        out.push((self.opcode, self.exptype, self.children.len()));
        for child in &self.children {
            child.collect_shape(out);
        }
    }
}
