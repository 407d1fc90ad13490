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


use std::error::Error;
use std::sync::Arc;
use xpu_codegen::catalog::{oid, BuiltinCatalog, DevCatalog, HostCatalog, HostTypeKind};
use xpu_codegen::opcodes::{DevKind, TypeOpCode};

fn setup() -> (Arc<BuiltinCatalog>, Arc<DevCatalog>) {
    let host = Arc::new(BuiltinCatalog::new());
    let catalog = DevCatalog::new(host.clone());
    (host, catalog)
}

#[test]
fn misses_are_memoized() {
    let (_, catalog) = setup();
    assert!(catalog.resolve_type(oid::JSONB).unwrap_err().is_unsupported());
    assert_eq!(catalog.cached_entries(), (1, 0));
    assert!(catalog.resolve_type(oid::JSONB).unwrap_err().is_unsupported());
    assert_eq!(catalog.cached_entries(), (1, 0));
}

#[test]
fn domains_resolve_to_their_base_type() -> Result<(), Box<dyn Error>> {
    let (_, catalog) = setup();
    let varchar = catalog.resolve_type(oid::VARCHAR)?;
    assert_eq!(varchar.code, TypeOpCode::Text);
    assert!(varchar.is_varlena());
    Ok(())
}

#[test]
fn composite_and_array_types() -> Result<(), Box<dyn Error>> {
    let (host, catalog) = setup();
    let pair = host.create_type(
        "pair",
        "public",
        None,
        HostTypeKind::Composite(vec![oid::INT4, oid::TEXT]),
    );
    let bad_pair = host.create_type(
        "bad_pair",
        "public",
        None,
        HostTypeKind::Composite(vec![oid::INT4, oid::JSONB]),
    );
    let int4_array = host.create_type("_int4", "pg_catalog", None, HostTypeKind::Array(oid::INT4));
    let mood = host.create_type("mood", "public", None, HostTypeKind::Enum);

    let ty = catalog.resolve_type(pair)?;
    assert_eq!(ty.code, TypeOpCode::Composite);
    assert!(ty.uses_slotbuf());
    assert_eq!(ty.fields.len(), 2);
    assert_eq!(ty.fields[1].code, TypeOpCode::Text);

    assert!(catalog.resolve_type(bad_pair).unwrap_err().is_unsupported());

    let ty = catalog.resolve_type(int4_array)?;
    assert_eq!(ty.code, TypeOpCode::Array);
    assert_eq!(ty.element.as_ref().map(|e| e.code), Some(TypeOpCode::Int4));

    assert!(catalog.resolve_type(mood).unwrap_err().is_unsupported());
    Ok(())
}

#[test]
fn types_must_come_from_the_owning_extension() -> Result<(), Box<dyn Error>> {
    let (host, catalog) = setup();
    assert_eq!(catalog.resolve_type(oid::INT1)?.code, TypeOpCode::Int1);

    let imposter = host.create_type("int1", "public", None, HostTypeKind::Base);
    assert!(catalog.resolve_type(imposter).unwrap_err().is_unsupported());
    Ok(())
}

#[test]
fn functions_must_match_namespace() -> Result<(), Box<dyn Error>> {
    let (host, catalog) = setup();
    let user_eq = host.create_function(
        "int4eq",
        "public",
        None,
        vec![oid::INT4, oid::INT4],
        oid::BOOL,
    );
    let err = catalog
        .resolve_function(user_eq, &[oid::INT4, oid::INT4], oid::INVALID, DevKind::GPU)
        .unwrap_err();
    assert!(err.is_unsupported());

    let builtin_eq = host
        .func_oid("int4eq", &[oid::INT4, oid::INT4])
        .ok_or("no int4eq")?;
    let func =
        catalog.resolve_function(builtin_eq, &[oid::INT4, oid::INT4], oid::INVALID, DevKind::GPU)?;
    assert_eq!(func.name, "int4eq");
    assert_eq!(func.ret_code(), TypeOpCode::Bool);
    assert!(catalog.func_by_code(func.index).is_some());
    Ok(())
}

#[test]
fn catalog_changes_invalidate_the_cache() -> Result<(), Box<dyn Error>> {
    let (host, catalog) = setup();
    let int8pl = host
        .func_oid("int8pl", &[oid::INT8, oid::INT8])
        .ok_or("no int8pl")?;
    catalog.resolve_function(int8pl, &[oid::INT8, oid::INT8], oid::INVALID, DevKind::GPU)?;
    let (types, funcs) = catalog.cached_entries();
    assert!(types > 0);
    assert_eq!(funcs, 1);

    assert!(host.drop_function(int8pl));
    assert_eq!(catalog.cached_entries(), (0, 0));
    let err = catalog
        .resolve_function(int8pl, &[oid::INT8, oid::INT8], oid::INVALID, DevKind::GPU)
        .unwrap_err();
    assert!(err.is_unsupported());
    Ok(())
}

#[test]
fn dropped_caches_unsubscribe() {
    let host = Arc::new(BuiltinCatalog::new());
    let events = || host.events().map_or(0, |e| e.num_listeners());

    let catalog = DevCatalog::new(host.clone());
    assert_eq!(events(), 1);
    drop(catalog);

    host.create_type("widget", "public", None, HostTypeKind::Base);
    assert_eq!(events(), 0);
}
