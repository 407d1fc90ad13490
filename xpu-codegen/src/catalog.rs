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

//! The device type/function catalog.
//!
//! Static tables map host types and functions to device opcodes. The
//! `DevCatalog` cache memoizes resolutions, including misses, and is
//! cleared when the host catalog publishes a change.

pub mod cache;
pub mod funcs;
pub mod hash;
pub mod host;
pub mod types;

pub use cache::{CatalogEvents, CatalogListener, DevCatalog};
pub use funcs::{func_catalog, DevFunc, DevFuncEntry, FuncOp};
pub use host::{
    oid, BuiltinCatalog, HostCatalog, HostFunc, HostOperator, HostType, HostTypeKind,
};
pub use types::{type_catalog, type_name, DevType, DevTypeEntry};
