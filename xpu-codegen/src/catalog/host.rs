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

//! The host database catalog, as seen by the compiler.
//!
//! The compiler never reads host catalogs directly. It resolves types,
//! functions, operators, and collations through the `HostCatalog` trait.
//! `BuiltinCatalog` implements the trait with the built-in types and
//! functions of the host, plus the ones shipped by the extension.

use super::cache::CatalogEvents;
use super::funcs::func_catalog;
use super::types::PG_STROM_EXTENSION;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

/// Namespace of built-in types and functions
pub const PG_CATALOG_NAMESPACE: &str = "pg_catalog";

/// Object ids of built-in types
pub mod oid {
    pub const INVALID: u32 = 0;
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const MONEY: u32 = 790;
    pub const BPCHAR: u32 = 1042;
    pub const VARCHAR: u32 = 1043;
    pub const DATE: u32 = 1082;
    pub const TIME: u32 = 1083;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const INTERVAL: u32 = 1186;
    pub const NUMERIC: u32 = 1700;
    pub const ANYELEMENT: u32 = 2283;
    pub const UUID: u32 = 2950;
    pub const JSONB: u32 = 3802;
    /// The extension's 1-byte integer
    pub const INT1: u32 = 9001;

    pub const DEFAULT_COLLATION: u32 = 100;
    pub const C_COLLATION: u32 = 950;
    pub const POSIX_COLLATION: u32 = 951;
}

/// Object ids assigned by `BuiltinCatalog` to functions, operators, and
/// user-defined types start here.
const FIRST_GENERATED_OID: u32 = 16384;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HostTypeKind {
    Base,
    Enum,
    Range,
    /// A domain over the given base type
    Domain(u32),
    /// A composite type with the given field types
    Composite(Vec<u32>),
    /// An array of the given element type
    Array(u32),
    Pseudo,
}

#[derive(Clone, Debug)]
pub struct HostType {
    pub oid: u32,
    pub name: String,
    pub namespace: String,
    pub extension: Option<String>,
    pub kind: HostTypeKind,
    /// Function implementing `=` for the type
    pub eq_func: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct HostFunc {
    pub oid: u32,
    pub name: String,
    pub namespace: String,
    pub extension: Option<String>,
    pub arg_types: Vec<u32>,
    /// The last argument type repeats any number of times
    pub variadic: bool,
    pub ret_type: u32,
}

#[derive(Clone, Debug)]
pub struct HostOperator {
    pub oid: u32,
    pub name: String,
    /// Left operand type; `oid::INVALID` for prefix operators
    pub left: u32,
    pub right: u32,
    pub func_oid: u32,
}

/// Read access to the host catalog
pub trait HostCatalog: Send + Sync {
    fn type_by_oid(&self, oid: u32) -> Option<HostType>;

    fn func_by_oid(&self, oid: u32) -> Option<HostFunc>;

    /// Function implementing the operator.
    fn operator_func(&self, opno: u32) -> Option<u32>;

    /// Returns `true` if the collation compares bytewise.
    fn collation_is_c(&self, collation: u32) -> bool;

    /// Notifications about catalog changes, if the host publishes them.
    fn events(&self) -> Option<&CatalogEvents> {
        None
    }
}

/// Built-in host catalog
///
/// Types, functions, and operators can be added and dropped at runtime.
/// Every change is published to the subscribers of `events()`.
#[derive(Debug)]
pub struct BuiltinCatalog {
    types: RwLock<HashMap<u32, HostType>>,
    funcs: RwLock<HashMap<u32, HostFunc>>,
    opers: RwLock<HashMap<u32, HostOperator>>,
    next_oid: AtomicU32,
    events: CatalogEvents,
}

const BUILTIN_TYPES: [(u32, &str); 18] = [
    (oid::BOOL, "bool"),
    (oid::BYTEA, "bytea"),
    (oid::INT8, "int8"),
    (oid::INT2, "int2"),
    (oid::INT4, "int4"),
    (oid::TEXT, "text"),
    (oid::FLOAT4, "float4"),
    (oid::FLOAT8, "float8"),
    (oid::MONEY, "money"),
    (oid::BPCHAR, "bpchar"),
    (oid::DATE, "date"),
    (oid::TIME, "time"),
    (oid::TIMESTAMP, "timestamp"),
    (oid::TIMESTAMPTZ, "timestamptz"),
    (oid::INTERVAL, "interval"),
    (oid::NUMERIC, "numeric"),
    (oid::UUID, "uuid"),
    (oid::JSONB, "jsonb"),
];

fn pg_catalog_type(oid: u32, name: &str, kind: HostTypeKind) -> HostType {
    HostType {
        oid,
        name: name.to_string(),
        namespace: PG_CATALOG_NAMESPACE.to_string(),
        extension: None,
        kind,
        eq_func: None,
    }
}

impl BuiltinCatalog {
    pub fn new() -> Self {
        let mut types: HashMap<u32, HostType> = BUILTIN_TYPES
            .iter()
            .map(|&(oid, name)| (oid, pg_catalog_type(oid, name, HostTypeKind::Base)))
            .collect();
        types.insert(
            oid::VARCHAR,
            pg_catalog_type(oid::VARCHAR, "varchar", HostTypeKind::Domain(oid::TEXT)),
        );
        types.insert(
            oid::ANYELEMENT,
            pg_catalog_type(oid::ANYELEMENT, "anyelement", HostTypeKind::Pseudo),
        );
        types.insert(
            oid::INT1,
            HostType {
                oid: oid::INT1,
                name: "int1".to_string(),
                namespace: "public".to_string(),
                extension: Some(PG_STROM_EXTENSION.to_string()),
                kind: HostTypeKind::Base,
                eq_func: None,
            },
        );
        let oid_by_name: HashMap<String, u32> = types
            .values()
            .map(|t| (t.name.clone(), t.oid))
            .collect();

        let mut next_oid = FIRST_GENERATED_OID;
        let mut funcs = HashMap::new();
        let mut opers = HashMap::new();
        for entry in func_catalog() {
            let (arg_names, variadic) = if entry.args.starts_with("__") {
                (vec![entry.args.trim_matches('_')], true)
            } else {
                (entry.args.split('/').collect::<Vec<_>>(), false)
            };
            let arg_types: Option<Vec<u32>> = arg_names
                .iter()
                .map(|name| oid_by_name.get(*name).copied())
                .collect();
            let (arg_types, ret_type) = match (arg_types, oid_by_name.get(entry.ret)) {
                (Some(args), Some(&ret)) => (args, ret),
                _ => continue,
            };
            let func_oid = next_oid;
            next_oid += 1;

            if let Some(symbol) = entry.op.symbol() {
                let (left, right) = match arg_types.as_slice() {
                    [l, r] => (*l, *r),
                    [r] => (oid::INVALID, *r),
                    _ => (oid::INVALID, oid::INVALID),
                };
                if right != oid::INVALID && !variadic {
                    opers.insert(
                        next_oid,
                        HostOperator {
                            oid: next_oid,
                            name: symbol.to_string(),
                            left,
                            right,
                            func_oid,
                        },
                    );
                    next_oid += 1;
                }
            }
            if entry.op == super::funcs::FuncOp::Eq && arg_types.len() == 2 {
                if let Some(ty) = types.get_mut(&arg_types[0]) {
                    ty.eq_func = Some(func_oid);
                }
            }

            funcs.insert(
                func_oid,
                HostFunc {
                    oid: func_oid,
                    name: entry.name.clone(),
                    namespace: if entry.extension.is_some() {
                        "public".to_string()
                    } else {
                        PG_CATALOG_NAMESPACE.to_string()
                    },
                    extension: entry.extension.map(|e| e.to_string()),
                    arg_types,
                    variadic,
                    ret_type,
                },
            );
        }

        Self {
            types: RwLock::new(types),
            funcs: RwLock::new(funcs),
            opers: RwLock::new(opers),
            next_oid: AtomicU32::new(next_oid),
            events: CatalogEvents::new(),
        }
    }

    /// Looks up a function by name and exact argument types.
    pub fn func_oid(&self, name: &str, arg_types: &[u32]) -> Option<u32> {
        let funcs = self.funcs.read().ok()?;
        funcs
            .values()
            .filter(|f| f.name == name && f.arg_types.as_slice() == arg_types)
            .map(|f| f.oid)
            .min()
    }

    /// Looks up an operator by name and operand types. Prefix operators
    /// take `oid::INVALID` as left operand type.
    pub fn oper_oid(&self, name: &str, left: u32, right: u32) -> Option<u32> {
        let opers = self.opers.read().ok()?;
        opers
            .values()
            .filter(|o| o.name == name && o.left == left && o.right == right)
            .map(|o| o.oid)
            .min()
    }

    /// Looks up a type by name.
    pub fn type_oid(&self, name: &str) -> Option<u32> {
        let types = self.types.read().ok()?;
        types.values().find(|t| t.name == name).map(|t| t.oid)
    }

    fn allocate_oid(&self) -> u32 {
        self.next_oid.fetch_add(1, Ordering::SeqCst)
    }

    /// Creates a type and returns its object id.
    pub fn create_type(
        &self,
        name: &str,
        namespace: &str,
        extension: Option<&str>,
        kind: HostTypeKind,
    ) -> u32 {
        let oid = self.allocate_oid();
        if let Ok(mut types) = self.types.write() {
            types.insert(
                oid,
                HostType {
                    oid,
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    extension: extension.map(|e| e.to_string()),
                    kind,
                    eq_func: None,
                },
            );
        }
        self.events.notify();
        oid
    }

    /// Creates a function and returns its object id.
    pub fn create_function(
        &self,
        name: &str,
        namespace: &str,
        extension: Option<&str>,
        arg_types: Vec<u32>,
        ret_type: u32,
    ) -> u32 {
        let oid = self.allocate_oid();
        if let Ok(mut funcs) = self.funcs.write() {
            funcs.insert(
                oid,
                HostFunc {
                    oid,
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    extension: extension.map(|e| e.to_string()),
                    arg_types,
                    variadic: false,
                    ret_type,
                },
            );
        }
        self.events.notify();
        oid
    }

    /// Drops a function. Returns `false` if it did not exist.
    pub fn drop_function(&self, oid: u32) -> bool {
        let removed = self
            .funcs
            .write()
            .map(|mut funcs| funcs.remove(&oid).is_some())
            .unwrap_or(false);
        if removed {
            self.events.notify();
        }
        removed
    }
}

impl Default for BuiltinCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl HostCatalog for BuiltinCatalog {
    fn type_by_oid(&self, oid: u32) -> Option<HostType> {
        self.types.read().ok()?.get(&oid).cloned()
    }

    fn func_by_oid(&self, oid: u32) -> Option<HostFunc> {
        self.funcs.read().ok()?.get(&oid).cloned()
    }

    fn operator_func(&self, opno: u32) -> Option<u32> {
        self.opers.read().ok()?.get(&opno).map(|o| o.func_oid)
    }

    fn collation_is_c(&self, collation: u32) -> bool {
        collation == oid::C_COLLATION || collation == oid::POSIX_COLLATION || collation == oid::INVALID
    }

    fn events(&self) -> Option<&CatalogEvents> {
        Some(&self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_operators_resolve() {
        let catalog = BuiltinCatalog::new();
        let opno = catalog.oper_oid("=", oid::INT4, oid::INT4).unwrap();
        let func = catalog.operator_func(opno).unwrap();
        assert_eq!(catalog.func_by_oid(func).unwrap().name, "int4eq");

        let neg = catalog.oper_oid("-", oid::INVALID, oid::INT8).unwrap();
        let func = catalog.operator_func(neg).unwrap();
        assert_eq!(catalog.func_by_oid(func).unwrap().name, "int8um");
    }

    #[test]
    fn equality_functions_are_registered() {
        let catalog = BuiltinCatalog::new();
        let int4 = catalog.type_by_oid(oid::INT4).unwrap();
        let eq = catalog.func_by_oid(int4.eq_func.unwrap()).unwrap();
        assert_eq!(eq.name, "int4eq");
        assert!(catalog.type_by_oid(oid::JSONB).unwrap().eq_func.is_none());
    }

    #[test]
    fn collations() {
        let catalog = BuiltinCatalog::new();
        assert!(catalog.collation_is_c(oid::C_COLLATION));
        assert!(!catalog.collation_is_c(oid::DEFAULT_COLLATION));
    }
}
