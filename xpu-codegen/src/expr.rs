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

//! Relational expression trees handed to the compiler by the planner.

use crate::catalog::oid;
use crate::datum::Value;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ParamKind {
    /// Supplied with the query
    Extern,
    /// Computed by another plan node during execution
    Exec,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BoolOp {
    And,
    Or,
    Not,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BoolTestKind {
    IsTrue,
    IsNotTrue,
    IsFalse,
    IsNotFalse,
    IsUnknown,
    IsNotUnknown,
}

/// An expression
///
/// Equality is structural. Two expressions built along different paths
/// compare equal if they have the same shape and the same leaves.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Const {
        type_oid: u32,
        value: Option<Value>,
    },
    Param {
        kind: ParamKind,
        param_id: u32,
        type_oid: u32,
    },
    /// Column `attno` of range table entry `varno`
    Var {
        varno: u32,
        attno: i32,
        type_oid: u32,
    },
    Func {
        func_oid: u32,
        args: Vec<Expr>,
        collation: u32,
        result_type: u32,
    },
    Op {
        opno: u32,
        args: Vec<Expr>,
        collation: u32,
        result_type: u32,
    },
    Bool {
        op: BoolOp,
        args: Vec<Expr>,
    },
    NullTest {
        arg: Box<Expr>,
        is_null: bool,
    },
    BoolTest {
        arg: Box<Expr>,
        test: BoolTestKind,
    },
    Coalesce {
        args: Vec<Expr>,
        type_oid: u32,
    },
    Case {
        whens: Vec<(Expr, Expr)>,
        default: Option<Box<Expr>>,
        type_oid: u32,
    },
    MinMax {
        greatest: bool,
        args: Vec<Expr>,
        type_oid: u32,
        collation: u32,
    },
    RelabelType {
        arg: Box<Expr>,
        result_type: u32,
    },
    CoerceViaIo {
        arg: Box<Expr>,
        result_type: u32,
    },
    ScalarArrayOp {
        opno: u32,
        use_or: bool,
        args: Vec<Expr>,
    },
    ScalarSubquery {
        plan_id: u32,
        type_oid: u32,
    },
}

impl Expr {
    pub fn var(varno: u32, attno: i32, type_oid: u32) -> Expr {
        Expr::Var {
            varno,
            attno,
            type_oid,
        }
    }

    pub fn constant(type_oid: u32, value: Option<Value>) -> Expr {
        Expr::Const { type_oid, value }
    }

    pub fn int4(value: i32) -> Expr {
        Expr::constant(oid::INT4, Some(Value::Int4(value)))
    }

    pub fn param(param_id: u32, type_oid: u32) -> Expr {
        Expr::Param {
            kind: ParamKind::Extern,
            param_id,
            type_oid,
        }
    }

    /// A binary operator call with the default collation.
    pub fn op(opno: u32, result_type: u32, left: Expr, right: Expr) -> Expr {
        Expr::Op {
            opno,
            args: vec![left, right],
            collation: oid::DEFAULT_COLLATION,
            result_type,
        }
    }

    pub fn func(func_oid: u32, result_type: u32, args: Vec<Expr>) -> Expr {
        Expr::Func {
            func_oid,
            args,
            collation: oid::DEFAULT_COLLATION,
            result_type,
        }
    }

    pub fn and(args: Vec<Expr>) -> Expr {
        Expr::Bool {
            op: BoolOp::And,
            args,
        }
    }

    pub fn or(args: Vec<Expr>) -> Expr {
        Expr::Bool {
            op: BoolOp::Or,
            args,
        }
    }

    pub fn not(arg: Expr) -> Expr {
        Expr::Bool {
            op: BoolOp::Not,
            args: vec![arg],
        }
    }

    pub fn is_null(arg: Expr) -> Expr {
        Expr::NullTest {
            arg: Box::new(arg),
            is_null: true,
        }
    }

    pub fn is_not_null(arg: Expr) -> Expr {
        Expr::NullTest {
            arg: Box::new(arg),
            is_null: false,
        }
    }

    /// Result type of the expression.
    pub fn type_oid(&self) -> u32 {
        match self {
            Expr::Const { type_oid, .. }
            | Expr::Param { type_oid, .. }
            | Expr::Var { type_oid, .. }
            | Expr::Coalesce { type_oid, .. }
            | Expr::Case { type_oid, .. }
            | Expr::MinMax { type_oid, .. }
            | Expr::ScalarSubquery { type_oid, .. } => *type_oid,
            Expr::Func { result_type, .. }
            | Expr::Op { result_type, .. }
            | Expr::RelabelType { result_type, .. }
            | Expr::CoerceViaIo { result_type, .. } => *result_type,
            Expr::Bool { .. }
            | Expr::NullTest { .. }
            | Expr::BoolTest { .. }
            | Expr::ScalarArrayOp { .. } => oid::BOOL,
        }
    }

    /// Name of the expression kind, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Const { .. } => "Const",
            Expr::Param { .. } => "Param",
            Expr::Var { .. } => "Var",
            Expr::Func { .. } => "FuncExpr",
            Expr::Op { .. } => "OpExpr",
            Expr::Bool { .. } => "BoolExpr",
            Expr::NullTest { .. } => "NullTest",
            Expr::BoolTest { .. } => "BooleanTest",
            Expr::Coalesce { .. } => "CoalesceExpr",
            Expr::Case { .. } => "CaseExpr",
            Expr::MinMax { .. } => "MinMaxExpr",
            Expr::RelabelType { .. } => "RelabelType",
            Expr::CoerceViaIo { .. } => "CoerceViaIO",
            Expr::ScalarArrayOp { .. } => "ScalarArrayOpExpr",
            Expr::ScalarSubquery { .. } => "SubPlan",
        }
    }

    /// Returns `true` for expressions that are read rather than computed.
    pub fn is_trivial(&self) -> bool {
        match self {
            Expr::Const { .. } | Expr::Param { .. } | Expr::Var { .. } => true,
            _ => false,
        }
    }
}

/// An upstream tuple-producing stage, indexed by depth
#[derive(Clone, Debug, PartialEq)]
pub enum InputRel {
    /// A base relation scan. `Var`s of range table entry `varno` are read
    /// from its rows by attribute number.
    Scan { varno: u32 },
    /// A stage producing the listed expressions as attributes 1..=n.
    Target(Vec<Expr>),
}

impl InputRel {
    /// Attribute number under which the stage provides `expr`, if any.
    pub fn resno_of(&self, expr: &Expr) -> Option<i32> {
        match self {
            InputRel::Scan { varno } => match expr {
                Expr::Var {
                    varno: v, attno, ..
                } if v == varno && *attno > 0 => Some(*attno),
                _ => None,
            },
            InputRel::Target(exprs) => exprs
                .iter()
                .position(|e| e == expr)
                .map(|pos| pos as i32 + 1),
        }
    }
}

/// An entry of a projection target list
#[derive(Clone, Debug, PartialEq)]
pub struct TargetEntry {
    pub expr: Expr,
    pub resno: i32,
    /// Junk entries are computed for upper nodes but not emitted
    pub resjunk: bool,
}

impl TargetEntry {
    pub fn new(expr: Expr, resno: i32) -> Self {
        Self {
            expr,
            resno,
            resjunk: false,
        }
    }

    pub fn junk(expr: Expr, resno: i32) -> Self {
        Self {
            expr,
            resno,
            resjunk: true,
        }
    }
}

/// A partial aggregate of a group-by target list
#[derive(Clone, Debug, PartialEq)]
pub enum PartialAgg {
    /// The value of grouping key `n`
    Key(usize),
    CountStar,
    Count(Expr),
    Min(Expr),
    Max(Expr),
    Sum(Expr),
    Avg(Expr),
    Stddev(Expr),
    Covar(Expr, Expr),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality() {
        let a = Expr::op(1, oid::INT4, Expr::var(1, 1, oid::INT4), Expr::int4(3));
        let b = Expr::Op {
            opno: 1,
            args: vec![
                Expr::Var {
                    varno: 1,
                    attno: 1,
                    type_oid: oid::INT4,
                },
                Expr::Const {
                    type_oid: oid::INT4,
                    value: Some(Value::Int4(3)),
                },
            ],
            collation: oid::DEFAULT_COLLATION,
            result_type: oid::INT4,
        };
        assert_eq!(a, b);
    }

    #[test]
    fn input_rel_resno() {
        let scan = InputRel::Scan { varno: 2 };
        assert_eq!(scan.resno_of(&Expr::var(2, 3, oid::INT4)), Some(3));
        assert_eq!(scan.resno_of(&Expr::var(1, 3, oid::INT4)), None);

        let sum = Expr::op(1, oid::INT4, Expr::var(1, 1, oid::INT4), Expr::int4(3));
        let target = InputRel::Target(vec![Expr::var(1, 2, oid::INT4), sum.clone()]);
        assert_eq!(target.resno_of(&sum), Some(2));
    }
}
