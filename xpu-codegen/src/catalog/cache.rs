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

//! Memoizing device catalog.
//!
//! `DevCatalog` resolves host types and functions into device descriptors
//! and remembers both hits and misses. The lookup tables are keyed by host
//! object id and by opcode. A catalog change clears all tables at once;
//! there is no fine-grained eviction.

use super::funcs::{func_catalog, DevFunc};
use super::host::{HostCatalog, HostType, HostTypeKind, PG_CATALOG_NAMESPACE};
use super::types::{type_catalog, DevType};
use crate::error::{ErrorKind, Result};
use crate::opcodes::{DevKind, FuncFlags, TypeFlags, TypeOpCode};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::debug;

/// Receives catalog change notifications
pub trait CatalogListener: Send + Sync {
    fn on_catalog_change(&self);
}

/// Subscription list for catalog change notifications
///
/// Listeners are held weakly. A listener that has been dropped is removed
/// on the next notification.
#[derive(Default)]
pub struct CatalogEvents {
    listeners: Mutex<Vec<Weak<dyn CatalogListener>>>,
}

impl CatalogEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Weak<dyn CatalogListener>) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
    }

    pub fn notify(&self) {
        let live: Vec<Arc<dyn CatalogListener>> = match self.listeners.lock() {
            Ok(mut listeners) => {
                listeners.retain(|l| l.upgrade().is_some());
                listeners.iter().filter_map(|l| l.upgrade()).collect()
            }
            Err(_) => return,
        };
        live.iter().for_each(|l| l.on_catalog_change());
    }

    pub fn num_listeners(&self) -> usize {
        self.listeners.lock().map_or(0, |l| l.len())
    }
}

impl fmt::Debug for CatalogEvents {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CatalogEvents")
            .field("listeners", &self.num_listeners())
            .finish()
    }
}

type FuncKey = (u32, Vec<u32>);

/// Process-local cache of device type and function descriptors
pub struct DevCatalog {
    host: Arc<dyn HostCatalog>,
    types_by_oid: RwLock<HashMap<u32, Option<Arc<DevType>>>>,
    types_by_code: RwLock<HashMap<TypeOpCode, Arc<DevType>>>,
    funcs_by_key: RwLock<HashMap<FuncKey, Option<Arc<DevFunc>>>>,
    funcs_by_code: RwLock<HashMap<u16, Arc<DevFunc>>>,
}

fn poisoned<T>(_: T) -> crate::error::Error {
    ErrorKind::LogicError("Device catalog lock poisoned".to_string()).into()
}

fn unsupported<T>(msg: String) -> Result<T> {
    Err(ErrorKind::Unsupported(msg).into())
}

impl DevCatalog {
    /// Creates a cache over `host` and subscribes it to catalog changes.
    pub fn new(host: Arc<dyn HostCatalog>) -> Arc<Self> {
        let catalog = Arc::new(Self {
            host,
            types_by_oid: RwLock::new(HashMap::new()),
            types_by_code: RwLock::new(HashMap::new()),
            funcs_by_key: RwLock::new(HashMap::new()),
            funcs_by_code: RwLock::new(HashMap::new()),
        });
        if let Some(events) = catalog.host.events() {
            let listener: Arc<dyn CatalogListener> = catalog.clone();
            events.subscribe(Arc::downgrade(&listener));
        }
        catalog
    }

    pub fn host(&self) -> &dyn HostCatalog {
        self.host.as_ref()
    }

    /// Clears all lookup tables.
    pub fn invalidate_all(&self) {
        let cleared = self
            .types_by_oid
            .write()
            .map(|mut t| {
                let n = t.len();
                t.clear();
                n
            })
            .unwrap_or(0)
            + self
                .funcs_by_key
                .write()
                .map(|mut f| {
                    let n = f.len();
                    f.clear();
                    n
                })
                .unwrap_or(0);
        if let Ok(mut t) = self.types_by_code.write() {
            t.clear();
        }
        if let Ok(mut f) = self.funcs_by_code.write() {
            f.clear();
        }
        debug!(cleared, "device catalog invalidated");
    }

    /// Number of memoized type and function lookups, including misses.
    pub fn cached_entries(&self) -> (usize, usize) {
        (
            self.types_by_oid.read().map_or(0, |t| t.len()),
            self.funcs_by_key.read().map_or(0, |f| f.len()),
        )
    }

    /// Resolves a host type into a device type.
    ///
    /// Fails with `Unsupported` if the type is not in the device table,
    /// belongs to a different extension, or is a composite or array type
    /// whose field or element type is unsupported.
    pub fn resolve_type(&self, type_oid: u32) -> Result<Arc<DevType>> {
        if let Some(cached) = self
            .types_by_oid
            .read()
            .map_err(poisoned)?
            .get(&type_oid)
        {
            return cached.clone().map_or_else(
                || unsupported(format!("type {} is not device supported", type_oid)),
                Ok,
            );
        }

        let resolved = self.build_type(type_oid, 0)?;
        self.types_by_oid
            .write()
            .map_err(poisoned)?
            .insert(type_oid, resolved.clone());
        match resolved {
            Some(ty) => {
                self.types_by_code
                    .write()
                    .map_err(poisoned)?
                    .entry(ty.code)
                    .or_insert_with(|| ty.clone());
                Ok(ty)
            }
            None => unsupported(format!("type {} is not device supported", type_oid)),
        }
    }

    /// Returns a device type that has been resolved before, by opcode.
    pub fn type_by_code(&self, code: TypeOpCode) -> Option<Arc<DevType>> {
        self.types_by_code.read().ok()?.get(&code).cloned()
    }

    fn build_type(&self, type_oid: u32, level: usize) -> Result<Option<Arc<DevType>>> {
        const MAX_NESTING: usize = 32;
        if level > MAX_NESTING {
            return Ok(None);
        }
        let host_type = match self.host.type_by_oid(type_oid) {
            Some(t) => t,
            None => return Ok(None),
        };

        let ty = match &host_type.kind {
            HostTypeKind::Base => Self::base_type(&host_type),
            HostTypeKind::Domain(base) => {
                return self.build_type(*base, level + 1);
            }
            HostTypeKind::Composite(fields) => {
                let mut resolved = Vec::with_capacity(fields.len());
                for field in fields {
                    match self.build_type(*field, level + 1)? {
                        Some(f) => resolved.push(f),
                        None => return Ok(None),
                    }
                }
                let mut ty = DevType::new(
                    type_oid,
                    &host_type.name,
                    TypeOpCode::Composite,
                    TypeFlags::USE_KVARS_SLOTBUF,
                );
                ty.fields = resolved;
                Some(ty)
            }
            HostTypeKind::Array(elem) => match self.build_type(*elem, level + 1)? {
                Some(element) => {
                    let mut ty = DevType::new(
                        type_oid,
                        &host_type.name,
                        TypeOpCode::Array,
                        TypeFlags::USE_KVARS_SLOTBUF,
                    );
                    ty.element = Some(element);
                    Some(ty)
                }
                None => None,
            },
            HostTypeKind::Enum | HostTypeKind::Range | HostTypeKind::Pseudo => None,
        };
        Ok(ty.map(Arc::new))
    }

    fn base_type(host_type: &HostType) -> Option<DevType> {
        let entry = type_catalog().iter().find(|e| {
            e.name == host_type.name
                && match e.extension {
                    None => {
                        host_type.namespace == PG_CATALOG_NAMESPACE && host_type.extension.is_none()
                    }
                    Some(ext) => host_type.extension.as_ref().map(|e| e.as_str()) == Some(ext),
                }
        })?;
        let mut ty = DevType::new(host_type.oid, entry.name, entry.code, entry.flags);
        ty.eq_func = host_type.eq_func;
        Some(ty)
    }

    /// Resolves a host function called with `arg_types` into a device
    /// function.
    ///
    /// The match itself is memoized per function and argument types. The
    /// collation and the device kind are checked on every call: functions
    /// that depend on the locale require a C collation, and the function
    /// must be executable on all `devkind`s.
    pub fn resolve_function(
        &self,
        func_oid: u32,
        arg_types: &[u32],
        collation: u32,
        devkind: DevKind,
    ) -> Result<Arc<DevFunc>> {
        let key = (func_oid, arg_types.to_vec());
        let cached = self
            .funcs_by_key
            .read()
            .map_err(poisoned)?
            .get(&key)
            .cloned();
        let resolved = match cached {
            Some(entry) => entry,
            None => {
                let entry = self.build_function(func_oid, arg_types)?;
                self.funcs_by_key
                    .write()
                    .map_err(poisoned)?
                    .insert(key, entry.clone());
                if let Some(f) = &entry {
                    self.funcs_by_code
                        .write()
                        .map_err(poisoned)?
                        .entry(f.index)
                        .or_insert_with(|| f.clone());
                }
                entry
            }
        };

        let func = match resolved {
            Some(f) => f,
            None => {
                return unsupported(format!(
                    "function {} with argument types {:?} is not device supported",
                    func_oid, arg_types
                ))
            }
        };
        if func.flags.contains(FuncFlags::LOCALE_AWARE) && !self.host.collation_is_c(collation)
        {
            return unsupported(format!(
                "function {} depends on collation {}, which is not C",
                func.name, collation
            ));
        }
        if !func.flags.supports(devkind) {
            return unsupported(format!(
                "function {} cannot run on device kind {:?}",
                func.name, devkind
            ));
        }
        Ok(func)
    }

    /// Returns a device function that has been resolved before, by catalog
    /// index.
    pub fn func_by_code(&self, index: u16) -> Option<Arc<DevFunc>> {
        self.funcs_by_code.read().ok()?.get(&index).cloned()
    }

    fn build_function(&self, func_oid: u32, arg_types: &[u32]) -> Result<Option<Arc<DevFunc>>> {
        let host_func = match self.host.func_by_oid(func_oid) {
            Some(f) => f,
            None => return Ok(None),
        };
        let mut args = Vec::with_capacity(arg_types.len());
        for &arg in arg_types {
            match self.resolve_type(arg) {
                Ok(t) => args.push(t),
                Err(ref e) if e.is_unsupported() => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        let ret_type = match self.resolve_type(host_func.ret_type) {
            Ok(t) => t,
            Err(ref e) if e.is_unsupported() => return Ok(None),
            Err(e) => return Err(e),
        };
        let arg_names: Vec<&str> = args.iter().map(|t| t.name.as_str()).collect();

        let found = func_catalog().iter().enumerate().find(|(_, entry)| {
            entry.name == host_func.name
                && entry.ret == ret_type.name
                && match entry.extension {
                    None => {
                        host_func.namespace == PG_CATALOG_NAMESPACE
                            && host_func.extension.is_none()
                    }
                    Some(ext) => host_func.extension.as_ref().map(|e| e.as_str()) == Some(ext),
                }
                && entry.args_match(&arg_names)
        });

        Ok(found.map(|(index, entry)| {
            Arc::new(DevFunc {
                func_oid,
                index: index as u16,
                name: entry.name.clone(),
                op: entry.op,
                arg_types: args,
                ret_type,
                cost: entry.cost,
                flags: entry.flags,
            })
        }))
    }
}

impl CatalogListener for DevCatalog {
    fn on_catalog_change(&self) {
        self.invalidate_all();
    }
}

impl fmt::Debug for DevCatalog {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (types, funcs) = self.cached_entries();
        f.debug_struct("DevCatalog")
            .field("types", &types)
            .field("funcs", &funcs)
            .finish()
    }
}
