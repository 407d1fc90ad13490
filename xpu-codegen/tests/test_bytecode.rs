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
use xpu_codegen::catalog::{oid, BuiltinCatalog, DevCatalog};
use xpu_codegen::codegen::{CodegenContext, JoinQualsDesc};
use xpu_codegen::datum::Value;
use xpu_codegen::expr::{Expr, InputRel, TargetEntry};
use xpu_codegen::kexp::{Bytecode, KexpWriter, Payload, KEXP_MIN_LEN};
use xpu_codegen::opcodes::{KexpFlags, OpCode, TypeOpCode};

/// Compiles the blobs of a two-way join with a projection.
fn join_blobs() -> Result<Vec<Bytecode>, Box<dyn Error>> {
    let host = Arc::new(BuiltinCatalog::new());
    let catalog = DevCatalog::new(host.clone());
    let eq = host.oper_oid("=", oid::INT4, oid::INT4).ok_or("no =")?;
    let lt = host.oper_oid("<", oid::FLOAT8, oid::FLOAT8).ok_or("no <")?;
    let cat = host.oper_oid("||", oid::TEXT, oid::TEXT).ok_or("no ||")?;

    let r_id = Expr::var(1, 1, oid::INT4);
    let r_name = Expr::var(1, 2, oid::TEXT);
    let s_id = Expr::var(2, 1, oid::INT4);
    let s_price = Expr::var(2, 2, oid::FLOAT8);
    let label = Expr::op(
        cat,
        oid::TEXT,
        r_name,
        Expr::constant(oid::TEXT, Some(Value::Text("!".to_string()))),
    );

    let mut ctx = CodegenContext::new(
        &catalog,
        vec![InputRel::Scan { varno: 1 }, InputRel::Scan { varno: 2 }],
    );
    let depths = vec![JoinQualsDesc {
        join_quals: vec![Expr::op(eq, oid::BOOL, r_id.clone(), s_id)],
        other_quals: vec![Expr::op(
            lt,
            oid::BOOL,
            s_price.clone(),
            Expr::constant(oid::FLOAT8, Some(Value::Float8(9.5))),
        )],
    }];
    let join_quals = ctx.codegen_join_quals(&depths)?.ok_or("no join quals")?;
    let hash_keys = ctx
        .codegen_hash_keys(&[vec![r_id.clone()]])?
        .ok_or("no hash keys")?;
    let projection = ctx.codegen_projection(&[
        TargetEntry::new(r_id, 1),
        TargetEntry::new(label, 2),
        TargetEntry::new(s_price, 3),
    ])?;
    let loadvars = ctx.codegen_join_loadvars()?.ok_or("no loadvars")?;
    Ok(vec![join_quals, hash_keys, projection, loadvars])
}

#[test]
fn walkers_agree() -> Result<(), Box<dyn Error>> {
    for blob in join_blobs()? {
        let by_length = blob.node_offsets_by_length();
        assert!(by_length.len() > 1);
        assert_eq!(by_length, blob.node_offsets_by_args());
    }
    Ok(())
}

#[test]
fn every_byte_is_protected() -> Result<(), Box<dyn Error>> {
    for blob in join_blobs()? {
        let bytes = blob.as_bytes().to_vec();
        for pos in 0..bytes.len() {
            let mut corrupted = bytes.clone();
            corrupted[pos] ^= 0x5a;
            match Bytecode::from_bytes(corrupted) {
                Ok(_) => return Err(format!("flip at byte {} went unnoticed", pos).into()),
                Err(e) => assert!(e.is_corrupted(), "byte {}: {}", pos, e),
            }
        }
    }
    Ok(())
}

#[test]
fn truncation_is_detected() -> Result<(), Box<dyn Error>> {
    for blob in join_blobs()? {
        let mut bytes = blob.as_bytes().to_vec();
        bytes.truncate(bytes.len() - 8);
        assert!(Bytecode::from_bytes(bytes).unwrap_err().is_corrupted());
    }
    assert!(Bytecode::from_bytes(vec![0; KEXP_MIN_LEN - 8])
        .unwrap_err()
        .is_corrupted());
    Ok(())
}

#[test]
fn decoded_shape() -> Result<(), Box<dyn Error>> {
    let blobs = join_blobs()?;
    let tree = blobs[0].decode()?;
    assert_eq!(
        tree.shape(),
        vec![
            (OpCode::Packed, TypeOpCode::Invalid, 1),
            (OpCode::JoinQuals, TypeOpCode::Bool, 2),
            (tree.children[0].children[0].opcode, TypeOpCode::Bool, 2),
            (OpCode::Var, TypeOpCode::Int4, 0),
            (OpCode::Var, TypeOpCode::Int4, 0),
            (tree.children[0].children[1].opcode, TypeOpCode::Bool, 2),
            (OpCode::Var, TypeOpCode::Float8, 0),
            (OpCode::Const, TypeOpCode::Float8, 0),
        ]
    );
    assert!(matches!(tree.children[0].children[0].opcode, OpCode::Func(_)));
    assert_eq!(
        tree.children[0].children[1].flags,
        KexpFlags::IS_PUSHED_DOWN
    );

    let projection = blobs[2].decode()?;
    match &projection.payload {
        Payload::Projection { slots } => assert_eq!(slots.len(), 3),
        other => return Err(format!("unexpected payload {:?}", other).into()),
    }
    assert_eq!(projection.children.len(), 1);
    assert_eq!(projection.children[0].opcode, OpCode::SaveExpr);
    assert_eq!(projection.children[0].exptype, TypeOpCode::Text);
    Ok(())
}

#[test]
fn nested_nodes_validate() -> Result<(), Box<dyn Error>> {
    let mut w = KexpWriter::new();
    let mut mark = w.begin(TypeOpCode::Bool, OpCode::BoolOr, KexpFlags::empty());
    w.start_args(&mut mark);
    for value in &[true, false] {
        let child = w.begin(TypeOpCode::Bool, OpCode::Const, KexpFlags::empty());
        w.put_payload(&Payload::Const {
            type_oid: oid::BOOL,
            value: Some(Value::Bool(*value)),
        });
        w.finish(child, 0)?;
    }
    w.finish(mark, 2)?;
    let blob = w.into_bytecode()?;
    assert_eq!(blob.root().nr_args(), 2);
    assert_eq!(blob.len() % 8, 0);
    Ok(())
}
