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

//! Static table of device types.

use crate::opcodes::{TypeFlags, TypeOpCode};
use std::sync::Arc;

/// Extension that ships the types and functions not built into the host
pub const PG_STROM_EXTENSION: &str = "pg_strom";

/// A row of the static device type table
#[derive(Clone, Copy, Debug)]
pub struct DevTypeEntry {
    pub name: &'static str,
    pub code: TypeOpCode,
    /// Extension that must own the host type; `None` for built-in types
    pub extension: Option<&'static str>,
    pub flags: TypeFlags,
}

macro_rules! dev_type {
    ($name:expr, $code:ident) => {
        DevTypeEntry {
            name: $name,
            code: TypeOpCode::$code,
            extension: None,
            flags: TypeFlags::HAS_HASH,
        }
    };
    ($name:expr, $code:ident, slotbuf) => {
        DevTypeEntry {
            name: $name,
            code: TypeOpCode::$code,
            extension: None,
            flags: TypeFlags::from_bits_truncate(
                TypeFlags::HAS_HASH.bits() | TypeFlags::USE_KVARS_SLOTBUF.bits(),
            ),
        }
    };
    ($name:expr, $code:ident, extension = $ext:expr) => {
        DevTypeEntry {
            name: $name,
            code: TypeOpCode::$code,
            extension: Some($ext),
            flags: TypeFlags::HAS_HASH,
        }
    };
}

static TYPE_CATALOG: [DevTypeEntry; 18] = [
    dev_type!("bool", Bool),
    dev_type!("int1", Int1, extension = PG_STROM_EXTENSION),
    dev_type!("int2", Int2),
    dev_type!("int4", Int4),
    dev_type!("int8", Int8),
    dev_type!("float4", Float4),
    dev_type!("float8", Float8),
    dev_type!("numeric", Numeric, slotbuf),
    dev_type!("bytea", Bytea),
    dev_type!("text", Text),
    dev_type!("bpchar", Bpchar),
    dev_type!("date", Date),
    dev_type!("time", Time),
    dev_type!("timestamp", Timestamp),
    dev_type!("timestamptz", Timestamptz),
    dev_type!("interval", Interval, slotbuf),
    dev_type!("money", Money),
    dev_type!("uuid", Uuid),
];

pub fn type_catalog() -> &'static [DevTypeEntry] {
    &TYPE_CATALOG
}

/// Name of a type opcode, as printed by the explain renderer.
pub fn type_name(code: TypeOpCode) -> &'static str {
    match code {
        TypeOpCode::Composite => "composite",
        TypeOpCode::Array => "array",
        TypeOpCode::Invalid => "invalid",
        _ => TYPE_CATALOG
            .iter()
            .find(|entry| entry.code == code)
            .map_or("unknown", |entry| entry.name),
    }
}

/// A resolved device type
#[derive(Debug)]
pub struct DevType {
    pub type_oid: u32,
    pub name: String,
    pub code: TypeOpCode,
    pub flags: TypeFlags,
    /// Length of the binary image, -1 for variable length
    pub typlen: i16,
    pub typbyval: bool,
    pub typalign: u8,
    /// Host function implementing equality, used for group-by keys
    pub eq_func: Option<u32>,
    /// Field types of a composite type
    pub fields: Vec<Arc<DevType>>,
    /// Element type of an array type
    pub element: Option<Arc<DevType>>,
}

impl DevType {
    pub(crate) fn new(type_oid: u32, name: &str, code: TypeOpCode, flags: TypeFlags) -> Self {
        let typlen = code.fixed_len().map_or(-1, |len| len as i16);
        let typbyval = match code {
            TypeOpCode::Numeric | TypeOpCode::Interval | TypeOpCode::Uuid => false,
            _ => typlen > 0 && typlen <= 8,
        };
        Self {
            type_oid,
            name: name.to_string(),
            code,
            flags,
            typlen,
            typbyval,
            typalign: code.align() as u8,
            eq_func: None,
            fields: Vec::new(),
            element: None,
        }
    }

    /// Returns `true` if values need scratch storage in the kvars buffer.
    pub fn uses_slotbuf(&self) -> bool {
        self.flags.contains(TypeFlags::USE_KVARS_SLOTBUF)
    }

    pub fn is_varlena(&self) -> bool {
        self.typlen < 0
    }
}
