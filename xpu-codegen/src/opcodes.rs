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

//! Numeric opcodes shared by the compiler and the interpreter.
//!
//! The host identifies types and functions by object ids. The device-side
//! interpreter only knows the opcodes defined here. Type opcodes identify the
//! physical representation of a value; operation opcodes identify what a
//! bytecode node does.

use crate::catalog::funcs::func_catalog;
use bitflags::bitflags;

/// Physical type of a device value
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum TypeOpCode {
    Invalid,
    Bool,
    Int1,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Bytea,
    Text,
    Bpchar,
    Date,
    Time,
    Timestamp,
    Timestamptz,
    Interval,
    Money,
    Uuid,
    Composite,
    Array,
}

const TYPE_OPCODES: [TypeOpCode; 21] = [
    TypeOpCode::Invalid,
    TypeOpCode::Bool,
    TypeOpCode::Int1,
    TypeOpCode::Int2,
    TypeOpCode::Int4,
    TypeOpCode::Int8,
    TypeOpCode::Float4,
    TypeOpCode::Float8,
    TypeOpCode::Numeric,
    TypeOpCode::Bytea,
    TypeOpCode::Text,
    TypeOpCode::Bpchar,
    TypeOpCode::Date,
    TypeOpCode::Time,
    TypeOpCode::Timestamp,
    TypeOpCode::Timestamptz,
    TypeOpCode::Interval,
    TypeOpCode::Money,
    TypeOpCode::Uuid,
    TypeOpCode::Composite,
    TypeOpCode::Array,
];

impl TypeOpCode {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        TYPE_OPCODES.get(code as usize).copied()
    }

    /// Length of the fixed-size binary image, or `None` for variable length.
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            TypeOpCode::Bool | TypeOpCode::Int1 => Some(1),
            TypeOpCode::Int2 => Some(2),
            TypeOpCode::Int4 | TypeOpCode::Float4 | TypeOpCode::Date => Some(4),
            TypeOpCode::Int8
            | TypeOpCode::Float8
            | TypeOpCode::Time
            | TypeOpCode::Timestamp
            | TypeOpCode::Timestamptz
            | TypeOpCode::Money => Some(8),
            TypeOpCode::Interval | TypeOpCode::Uuid => Some(16),
            TypeOpCode::Numeric => Some(18),
            TypeOpCode::Invalid
            | TypeOpCode::Bytea
            | TypeOpCode::Text
            | TypeOpCode::Bpchar
            | TypeOpCode::Composite
            | TypeOpCode::Array => None,
        }
    }

    /// Alignment of the binary image within a stored row.
    pub fn align(self) -> usize {
        match self {
            TypeOpCode::Bool | TypeOpCode::Int1 | TypeOpCode::Uuid => 1,
            TypeOpCode::Int2 => 2,
            TypeOpCode::Int4
            | TypeOpCode::Float4
            | TypeOpCode::Date
            | TypeOpCode::Bytea
            | TypeOpCode::Text
            | TypeOpCode::Bpchar
            | TypeOpCode::Composite
            | TypeOpCode::Array
            | TypeOpCode::Invalid => 4,
            TypeOpCode::Int8
            | TypeOpCode::Float8
            | TypeOpCode::Time
            | TypeOpCode::Timestamp
            | TypeOpCode::Timestamptz
            | TypeOpCode::Money
            | TypeOpCode::Interval
            | TypeOpCode::Numeric => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        match self {
            TypeOpCode::Int1 | TypeOpCode::Int2 | TypeOpCode::Int4 | TypeOpCode::Int8 => true,
            _ => false,
        }
    }

    pub fn is_float(self) -> bool {
        match self {
            TypeOpCode::Float4 | TypeOpCode::Float8 => true,
            _ => false,
        }
    }
}

bitflags! {
    /// Flags of a kernel expression node
    pub struct KexpFlags: u32 {
        /// The qualifier was pushed down from an upper level. It filters the
        /// result rows of an outer join, but does not decide whether a row
        /// matched.
        const IS_PUSHED_DOWN = 0x0001;
    }
}

bitflags! {
    /// Device kinds that can execute a function
    pub struct DevKind: u32 {
        const GPU = 0x0001;
        const DPU = 0x0002;
        const ANY = Self::GPU.bits | Self::DPU.bits;
    }
}

bitflags! {
    /// Properties of a device function
    pub struct FuncFlags: u32 {
        const DEVKIND_GPU = 0x0001;
        const DEVKIND_DPU = 0x0002;
        const DEVKIND_ANY = Self::DEVKIND_GPU.bits | Self::DEVKIND_DPU.bits;
        /// The result depends on the collation; usable only with C collation.
        const LOCALE_AWARE = 0x0100;
        /// The result depends on the session time zone.
        const SESSION_TIMEZONE = 0x0200;
    }
}

bitflags! {
    /// Properties of a device type
    pub struct TypeFlags: u32 {
        /// Values need per-slot scratch storage, because they cannot be
        /// represented as a register-sized datum.
        const USE_KVARS_SLOTBUF = 0x0001;
        /// The type has a device hash function.
        const HAS_HASH = 0x0002;
    }
}

impl FuncFlags {
    /// Returns `true` if the function can execute on all `required` kinds.
    pub fn supports(self, required: DevKind) -> bool {
        FuncFlags::from_bits_truncate(required.bits()).difference(self & FuncFlags::DEVKIND_ANY)
            == FuncFlags::empty()
    }
}

/// First operation opcode assigned to catalog functions.
pub const FUNC_OPCODE_BASE: u16 = 100;

/// Operation of a kernel expression node
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OpCode {
    Const,
    Param,
    Var,
    BoolAnd,
    BoolOr,
    BoolNot,
    IsNull,
    IsNotNull,
    IsTrue,
    IsNotTrue,
    IsFalse,
    IsNotFalse,
    IsUnknown,
    IsNotUnknown,
    LoadVars,
    SaveExpr,
    Projection,
    HashValue,
    JoinQuals,
    Packed,
    AggFuncs,
    /// A function of the device function catalog, by catalog index
    Func(u16),
}

const SPECIAL_OPCODES: [OpCode; 21] = [
    OpCode::Const,
    OpCode::Param,
    OpCode::Var,
    OpCode::BoolAnd,
    OpCode::BoolOr,
    OpCode::BoolNot,
    OpCode::IsNull,
    OpCode::IsNotNull,
    OpCode::IsTrue,
    OpCode::IsNotTrue,
    OpCode::IsFalse,
    OpCode::IsNotFalse,
    OpCode::IsUnknown,
    OpCode::IsNotUnknown,
    OpCode::LoadVars,
    OpCode::SaveExpr,
    OpCode::Projection,
    OpCode::HashValue,
    OpCode::JoinQuals,
    OpCode::Packed,
    OpCode::AggFuncs,
];

impl OpCode {
    pub fn to_u16(self) -> u16 {
        match self {
            OpCode::Func(index) => FUNC_OPCODE_BASE + index,
            special => {
                SPECIAL_OPCODES
                    .iter()
                    .position(|&op| op == special)
                    .unwrap_or(0) as u16
                    + 1
            }
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        if code >= FUNC_OPCODE_BASE {
            let index = code - FUNC_OPCODE_BASE;
            if (index as usize) < func_catalog().len() {
                Some(OpCode::Func(index))
            } else {
                None
            }
        } else if code == 0 {
            None
        } else {
            SPECIAL_OPCODES.get(code as usize - 1).copied()
        }
    }

    /// Name used by the explain renderer.
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Const => "Const",
            OpCode::Param => "Param",
            OpCode::Var => "Var",
            OpCode::BoolAnd => "Bool::AND",
            OpCode::BoolOr => "Bool::OR",
            OpCode::BoolNot => "Bool::NOT",
            OpCode::IsNull => "IsNull",
            OpCode::IsNotNull => "IsNotNull",
            OpCode::IsTrue => "BoolTest::IsTrue",
            OpCode::IsNotTrue => "BoolTest::IsNotTrue",
            OpCode::IsFalse => "BoolTest::IsFalse",
            OpCode::IsNotFalse => "BoolTest::IsNotFalse",
            OpCode::IsUnknown => "BoolTest::IsUnknown",
            OpCode::IsNotUnknown => "BoolTest::IsNotUnknown",
            OpCode::LoadVars => "LoadVars",
            OpCode::SaveExpr => "SaveExpr",
            OpCode::Projection => "Projection",
            OpCode::HashValue => "HashValue",
            OpCode::JoinQuals => "JoinQuals",
            OpCode::Packed => "Packed",
            OpCode::AggFuncs => "AggFuncs",
            OpCode::Func(_) => "Func",
        }
    }
}

/// Partial aggregation action of an AggFuncs descriptor
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AggAction {
    /// Reference to a grouping key
    Vref,
    /// count(*)
    NRowsAny,
    /// count(X), counts non-NULL values
    NRowsCond,
    PMinInt,
    PMinFp,
    PMaxInt,
    PMaxFp,
    PSumInt,
    PSumFp,
    PAvgInt,
    PAvgFp,
    /// Sample standard deviation
    Stddev,
    /// Sample covariance of two arguments
    Covar,
}

const AGG_ACTIONS: [AggAction; 13] = [
    AggAction::Vref,
    AggAction::NRowsAny,
    AggAction::NRowsCond,
    AggAction::PMinInt,
    AggAction::PMinFp,
    AggAction::PMaxInt,
    AggAction::PMaxFp,
    AggAction::PSumInt,
    AggAction::PSumFp,
    AggAction::PAvgInt,
    AggAction::PAvgFp,
    AggAction::Stddev,
    AggAction::Covar,
];

impl AggAction {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        AGG_ACTIONS.get(code as usize).copied()
    }

    /// Number of argument slots the action consumes.
    pub fn nargs(self) -> usize {
        match self {
            AggAction::NRowsAny => 0,
            AggAction::Covar => 2,
            _ => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AggAction::Vref => "vref",
            AggAction::NRowsAny => "nrows[*]",
            AggAction::NRowsCond => "nrows[cond]",
            AggAction::PMinInt => "pmin::int",
            AggAction::PMinFp => "pmin::fp",
            AggAction::PMaxInt => "pmax::int",
            AggAction::PMaxFp => "pmax::fp",
            AggAction::PSumInt => "psum::int",
            AggAction::PSumFp => "psum::fp",
            AggAction::PAvgInt => "pavg::int",
            AggAction::PAvgFp => "pavg::fp",
            AggAction::Stddev => "stddev",
            AggAction::Covar => "covar",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_round_trip() {
        for code in 1..=21 {
            let op = OpCode::from_u16(code).unwrap();
            assert_eq!(op.to_u16(), code);
        }
        assert_eq!(OpCode::from_u16(0), None);
        assert_eq!(OpCode::Func(3).to_u16(), FUNC_OPCODE_BASE + 3);
        assert_eq!(OpCode::from_u16(FUNC_OPCODE_BASE + 3), Some(OpCode::Func(3)));
        assert_eq!(OpCode::from_u16(u16::max_value()), None);
    }

    #[test]
    fn devkind_support() {
        assert!(FuncFlags::DEVKIND_ANY.supports(DevKind::GPU));
        assert!(FuncFlags::DEVKIND_ANY.supports(DevKind::ANY));
        assert!(FuncFlags::DEVKIND_GPU.supports(DevKind::GPU));
        assert!(!FuncFlags::DEVKIND_GPU.supports(DevKind::DPU));
        assert!(!FuncFlags::DEVKIND_GPU.supports(DevKind::ANY));
    }
}
