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

//! Static table of device functions.
//!
//! A row matches a host function if the names are equal, the owning
//! extension matches, and the argument pattern matches the argument type
//! names of the call textually. Patterns separate argument types by `/`. A
//! trailing `__type__` element matches any number of trailing arguments of
//! that type (variadic functions).

use super::types::{DevType, PG_STROM_EXTENSION};
use crate::opcodes::{FuncFlags, OpCode, TypeOpCode};
use once_cell::sync::Lazy;
use std::sync::Arc;

/// Semantics of a device function
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FuncOp {
    Cast,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Abs,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Length,
    TextCat,
    Concat,
    Upper,
}

impl FuncOp {
    /// Host operator name implemented by the function, if any.
    pub fn symbol(self) -> Option<&'static str> {
        match self {
            FuncOp::Add => Some("+"),
            FuncOp::Sub | FuncOp::Neg => Some("-"),
            FuncOp::Mul => Some("*"),
            FuncOp::Div => Some("/"),
            FuncOp::Mod => Some("%"),
            FuncOp::Abs => Some("@"),
            FuncOp::Eq => Some("="),
            FuncOp::Ne => Some("<>"),
            FuncOp::Lt => Some("<"),
            FuncOp::Le => Some("<="),
            FuncOp::Gt => Some(">"),
            FuncOp::Ge => Some(">="),
            FuncOp::TextCat => Some("||"),
            FuncOp::Cast | FuncOp::Length | FuncOp::Concat | FuncOp::Upper => None,
        }
    }

    /// Returns `true` if a NULL argument yields NULL without evaluation.
    pub fn is_strict(self) -> bool {
        self != FuncOp::Concat
    }
}

/// A row of the static device function table
#[derive(Clone, Debug)]
pub struct DevFuncEntry {
    pub name: String,
    pub extension: Option<&'static str>,
    /// Argument type names, separated by `/`
    pub args: String,
    pub ret: &'static str,
    pub op: FuncOp,
    pub cost: u32,
    pub flags: FuncFlags,
}

impl DevFuncEntry {
    /// Matches the argument pattern against the argument type names of a call.
    pub fn args_match(&self, arg_names: &[&str]) -> bool {
        let pattern: Vec<&str> = if self.args.is_empty() {
            Vec::new()
        } else {
            self.args.split('/').collect()
        };
        match pattern.split_last() {
            Some((last, fixed)) if last.starts_with("__") && last.ends_with("__") => {
                let variadic = &last[2..last.len() - 2];
                arg_names.len() >= fixed.len()
                    && fixed.iter().zip(arg_names).all(|(p, a)| p == a)
                    && arg_names[fixed.len()..].iter().all(|a| *a == variadic)
            }
            _ => pattern.as_slice() == arg_names,
        }
    }
}

const INTEGER_TYPES: [&str; 3] = ["int2", "int4", "int8"];
const FLOAT_TYPES: [&str; 2] = ["float4", "float8"];
const CMP_OPS: [FuncOp; 6] = [
    FuncOp::Eq,
    FuncOp::Ne,
    FuncOp::Lt,
    FuncOp::Le,
    FuncOp::Gt,
    FuncOp::Ge,
];

struct CatalogBuilder {
    entries: Vec<DevFuncEntry>,
}

impl CatalogBuilder {
    fn add(
        &mut self,
        name: &str,
        args: &str,
        ret: &'static str,
        op: FuncOp,
        cost: u32,
        flags: FuncFlags,
    ) -> &mut Self {
        self.entries.push(DevFuncEntry {
            name: name.to_string(),
            extension: None,
            args: args.to_string(),
            ret,
            op,
            cost,
            flags: flags | Self::default_devkind(flags),
        });
        self
    }

    /// Marks the most recent row as owned by the extension.
    fn in_extension(&mut self) -> &mut Self {
        if let Some(last) = self.entries.last_mut() {
            last.extension = Some(PG_STROM_EXTENSION);
        }
        self
    }

    fn default_devkind(flags: FuncFlags) -> FuncFlags {
        if flags.intersects(FuncFlags::DEVKIND_ANY) {
            FuncFlags::empty()
        } else {
            FuncFlags::DEVKIND_ANY
        }
    }

    /// Comparison functions named `{prefix}{eq,ne,lt,le,gt,ge}`.
    fn comparisons(
        &mut self,
        ty: &'static str,
        names: [&str; 6],
        cost: u32,
        ordering_flags: FuncFlags,
        extension: bool,
    ) {
        for (name, op) in names.iter().zip(CMP_OPS.iter()) {
            let flags = match op {
                FuncOp::Eq | FuncOp::Ne => FuncFlags::empty(),
                _ => ordering_flags,
            };
            self.add(name, &format!("{}/{}", ty, ty), "bool", *op, cost, flags);
            if extension {
                self.in_extension();
            }
        }
    }
}

fn cmp_names(prefix: &str, sep: &str) -> [String; 6] {
    [
        format!("{}{}eq", prefix, sep),
        format!("{}{}ne", prefix, sep),
        format!("{}{}lt", prefix, sep),
        format!("{}{}le", prefix, sep),
        format!("{}{}gt", prefix, sep),
        format!("{}{}ge", prefix, sep),
    ]
}

fn as_strs(names: &[String; 6]) -> [&str; 6] {
    [
        names[0].as_str(),
        names[1].as_str(),
        names[2].as_str(),
        names[3].as_str(),
        names[4].as_str(),
        names[5].as_str(),
    ]
}

fn build_func_catalog() -> Vec<DevFuncEntry> {
    let mut b = CatalogBuilder {
        entries: Vec::new(),
    };
    let none = FuncFlags::empty();
    let numbers: Vec<&'static str> = INTEGER_TYPES
        .iter()
        .chain(FLOAT_TYPES.iter())
        .copied()
        .collect();

    // Casts between fixed-width numbers
    for &from in &numbers {
        for &to in &numbers {
            if from != to {
                b.add(to, from, to, FuncOp::Cast, 1, none);
            }
        }
        b.add("int1", from, "int1", FuncOp::Cast, 1, none)
            .in_extension();
        b.add(from, "int1", from, FuncOp::Cast, 1, none)
            .in_extension();
        b.add("numeric", from, "numeric", FuncOp::Cast, 50, none);
        b.add(from, "numeric", from, FuncOp::Cast, 50, none);
    }

    // Casts between date and time types
    let tz = FuncFlags::SESSION_TIMEZONE;
    b.add("timestamp", "date", "timestamp", FuncOp::Cast, 5, none);
    b.add("date", "timestamp", "date", FuncOp::Cast, 5, none);
    b.add("timestamptz", "date", "timestamptz", FuncOp::Cast, 5, tz);
    b.add("timestamptz", "timestamp", "timestamptz", FuncOp::Cast, 5, tz);
    b.add("timestamp", "timestamptz", "timestamp", FuncOp::Cast, 5, tz);
    b.add("date", "timestamptz", "date", FuncOp::Cast, 5, tz);

    // Arithmetic
    let arith_types: Vec<(&'static str, bool)> = std::iter::once(("int1", true))
        .chain(numbers.iter().map(|t| (*t, false)))
        .collect();
    for (ty, ext) in arith_types {
        let binary = format!("{}/{}", ty, ty);
        let mut ops = vec![
            ("pl", binary.as_str(), FuncOp::Add, 1),
            ("mi", binary.as_str(), FuncOp::Sub, 1),
            ("mul", binary.as_str(), FuncOp::Mul, 2),
            ("div", binary.as_str(), FuncOp::Div, 4),
            ("um", ty, FuncOp::Neg, 1),
            ("abs", ty, FuncOp::Abs, 1),
        ];
        if !ty.starts_with("float") {
            ops.push(("mod", binary.as_str(), FuncOp::Mod, 4));
        }
        for (suffix, args, op, cost) in ops {
            b.add(&format!("{}{}", ty, suffix), args, ty, op, cost, none);
            if ext {
                b.in_extension();
            }
        }
    }
    b.add("numeric_add", "numeric/numeric", "numeric", FuncOp::Add, 10, none);
    b.add("numeric_sub", "numeric/numeric", "numeric", FuncOp::Sub, 10, none);
    b.add("numeric_mul", "numeric/numeric", "numeric", FuncOp::Mul, 10, none);
    b.add("numeric_uminus", "numeric", "numeric", FuncOp::Neg, 10, none);
    b.add("numeric_abs", "numeric", "numeric", FuncOp::Abs, 10, none);
    b.add("cash_pl", "money/money", "money", FuncOp::Add, 1, none);
    b.add("cash_mi", "money/money", "money", FuncOp::Sub, 1, none);

    // Comparisons
    let locale = FuncFlags::LOCALE_AWARE;
    b.comparisons("int1", as_strs(&cmp_names("int1", "")), 1, none, true);
    for &ty in &numbers {
        b.comparisons(ty, as_strs(&cmp_names(ty, "")), 1, none, false);
    }
    b.comparisons("numeric", as_strs(&cmp_names("numeric", "_")), 5, none, false);
    b.comparisons("date", as_strs(&cmp_names("date", "_")), 1, none, false);
    b.comparisons("time", as_strs(&cmp_names("time", "_")), 1, none, false);
    b.comparisons("timestamp", as_strs(&cmp_names("timestamp", "_")), 1, none, false);
    b.comparisons("timestamptz", as_strs(&cmp_names("timestamptz", "_")), 1, none, false);
    b.comparisons("interval", as_strs(&cmp_names("interval", "_")), 2, none, false);
    b.comparisons("money", as_strs(&cmp_names("cash", "_")), 1, none, false);
    b.comparisons("uuid", as_strs(&cmp_names("uuid", "_")), 2, none, false);
    b.comparisons("bool", as_strs(&cmp_names("bool", "")), 1, none, false);
    b.comparisons("bytea", as_strs(&cmp_names("bytea", "")), 3, none, false);
    b.comparisons(
        "text",
        ["texteq", "textne", "text_lt", "text_le", "text_gt", "text_ge"],
        3,
        locale,
        false,
    );
    b.comparisons("bpchar", as_strs(&cmp_names("bpchar", "")), 3, locale, false);

    // Text functions
    b.add("length", "text", "int4", FuncOp::Length, 2, none);
    b.add("bpcharlen", "bpchar", "int4", FuncOp::Length, 2, none);
    b.add("textcat", "text/text", "text", FuncOp::TextCat, 3, none);
    b.add(
        "concat",
        "__text__",
        "text",
        FuncOp::Concat,
        5,
        FuncFlags::DEVKIND_GPU,
    );
    b.add("upper", "text", "text", FuncOp::Upper, 5, locale);

    b.entries
}

static FUNC_CATALOG: Lazy<Vec<DevFuncEntry>> = Lazy::new(build_func_catalog);

/// The device function table. The position of a row is its catalog index.
pub fn func_catalog() -> &'static [DevFuncEntry] {
    &FUNC_CATALOG
}

/// A resolved device function
#[derive(Debug)]
pub struct DevFunc {
    pub func_oid: u32,
    /// Row of the device function table
    pub index: u16,
    pub name: String,
    pub op: FuncOp,
    pub arg_types: Vec<Arc<DevType>>,
    pub ret_type: Arc<DevType>,
    pub cost: u32,
    pub flags: FuncFlags,
}

impl DevFunc {
    pub fn opcode(&self) -> OpCode {
        OpCode::Func(self.index)
    }

    pub fn ret_code(&self) -> TypeOpCode {
        self.ret_type.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> &'static DevFuncEntry {
        func_catalog().iter().find(|e| e.name == name).unwrap()
    }

    #[test]
    fn variadic_pattern() {
        let concat = entry("concat");
        assert!(concat.args_match(&["text"]));
        assert!(concat.args_match(&["text", "text", "text"]));
        assert!(!concat.args_match(&["text", "int4"]));
    }

    #[test]
    fn fixed_pattern() {
        let int4eq = entry("int4eq");
        assert!(int4eq.args_match(&["int4", "int4"]));
        assert!(!int4eq.args_match(&["int4"]));
        assert!(!int4eq.args_match(&["int4", "int8"]));
    }

    #[test]
    fn flags_and_extensions() {
        assert!(entry("text_lt").flags.contains(FuncFlags::LOCALE_AWARE));
        assert!(!entry("texteq").flags.contains(FuncFlags::LOCALE_AWARE));
        assert_eq!(entry("int1pl").extension, Some(PG_STROM_EXTENSION));
        assert_eq!(entry("int4pl").extension, None);
        assert_eq!(
            entry("concat").flags & FuncFlags::DEVKIND_ANY,
            FuncFlags::DEVKIND_GPU
        );
        assert!(entry("int4mod").op == FuncOp::Mod);
        assert!(func_catalog().iter().all(|e| e.name != "float8mod"));
    }
}
