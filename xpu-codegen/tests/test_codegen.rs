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
use xpu_codegen::codegen::{explain, CodegenContext, JoinQualsDesc, SlotSpace};
use xpu_codegen::datum::Value;
use xpu_codegen::error::ErrorKind;
use xpu_codegen::expr::{Expr, InputRel, PartialAgg, TargetEntry};
use xpu_codegen::kexp::Payload;
use xpu_codegen::opcodes::{AggAction, DevKind, KexpFlags, OpCode, TypeOpCode};

fn setup() -> (Arc<BuiltinCatalog>, Arc<DevCatalog>) {
    let host = Arc::new(BuiltinCatalog::new());
    let catalog = DevCatalog::new(host.clone());
    (host, catalog)
}

fn int4_op(host: &BuiltinCatalog, name: &str, ret: u32, l: Expr, r: Expr) -> Expr {
    let opno = host
        .oper_oid(name, oid::INT4, oid::INT4)
        .expect("builtin int4 operator");
    Expr::op(opno, ret, l, r)
}

#[test]
fn scan_qual_explain() -> Result<(), Box<dyn Error>> {
    let (host, catalog) = setup();
    let a = Expr::var(1, 1, oid::INT4);
    let qual = int4_op(&host, "=", oid::BOOL, a, Expr::int4(1));

    let mut ctx = CodegenContext::new(&catalog, vec![InputRel::Scan { varno: 1 }]);
    let quals = ctx.codegen_scan_quals(&[qual])?.ok_or("no quals")?;
    assert_eq!(
        explain(&quals)?,
        "{Func::int4eq(bool) args=[{Var(int4): slot_id=0}, {Const(int4): value='1'}]}"
    );
    assert!(ctx.device_cost() > 0);
    assert!(ctx.codegen_scan_quals(&[])?.is_none());
    Ok(())
}

#[test]
fn multiple_quals_are_anded() -> Result<(), Box<dyn Error>> {
    let (host, catalog) = setup();
    let a = Expr::var(1, 1, oid::INT4);
    let b = Expr::var(1, 2, oid::INT4);
    let quals = [
        int4_op(&host, ">", oid::BOOL, a.clone(), Expr::int4(0)),
        Expr::is_not_null(b),
    ];

    let mut ctx = CodegenContext::new(&catalog, vec![InputRel::Scan { varno: 1 }]);
    let bytecode = ctx.codegen_scan_quals(&quals)?.ok_or("no quals")?;
    let shape = bytecode.decode()?.shape();
    let opcodes: Vec<OpCode> = shape.iter().map(|(op, _, _)| *op).collect();

    assert_eq!(shape[0], (OpCode::BoolAnd, TypeOpCode::Bool, 2));
    assert_eq!(opcodes[2], OpCode::Var);
    assert_eq!(opcodes[3], OpCode::Const);
    assert_eq!(opcodes[4], OpCode::IsNotNull);
    assert_eq!(opcodes[5], OpCode::Var);
    Ok(())
}

#[test]
fn repeated_vars_share_a_slot() -> Result<(), Box<dyn Error>> {
    let (host, catalog) = setup();
    let a = Expr::var(1, 1, oid::INT4);
    let b = Expr::var(1, 2, oid::INT4);
    let sum = int4_op(&host, "+", oid::INT4, a.clone(), a.clone());
    let qual = int4_op(&host, "<", oid::BOOL, b.clone(), sum);
    let qual2 = int4_op(&host, "<>", oid::BOOL, a.clone(), b);

    let mut ctx = CodegenContext::new(&catalog, vec![InputRel::Scan { varno: 1 }]);
    ctx.codegen_scan_quals(&[qual, qual2])?;
    assert_eq!(ctx.kvars_nslots(), 2);

    let loadvars = ctx.codegen_scan_loadvars()?.ok_or("no loadvars")?;
    assert_eq!(
        explain(&loadvars)?,
        "{LoadVars: depth=0 kvars=[<slot_id=1, resno=1>, <slot_id=0, resno=2>]}"
    );
    Ok(())
}

#[test]
fn same_column_in_different_spaces() -> Result<(), Box<dyn Error>> {
    let (_, catalog) = setup();
    let a = Expr::var(1, 1, oid::INT4);

    let mut ctx = CodegenContext::new(&catalog, vec![InputRel::Scan { varno: 1 }]);
    let groupby = ctx.codegen_groupby(&[a.clone()])?;
    assert_eq!(groupby.key_slots, vec![0]);
    assert_eq!(groupby.final_slots, vec![1]);

    let slots = ctx.slots();
    assert_eq!(slots.lookup(SlotSpace::Load, &a), Some(0));
    assert_eq!(slots.lookup(SlotSpace::GroupByFinal, &a), Some(1));
    assert_eq!(slots.lookup(SlotSpace::Saved, &a), None);
    Ok(())
}

#[test]
fn projection_saves_computed_entries() -> Result<(), Box<dyn Error>> {
    let (host, catalog) = setup();
    let a = Expr::var(1, 1, oid::INT4);
    let b = Expr::var(1, 2, oid::INT4);
    let c = Expr::var(1, 3, oid::INT4);
    let sum = int4_op(&host, "+", oid::INT4, a.clone(), b);
    let tlist = vec![
        TargetEntry::new(a, 1),
        TargetEntry::new(sum.clone(), 2),
        TargetEntry::new(sum, 3),
        TargetEntry::junk(c, 4),
    ];

    let mut ctx = CodegenContext::new(&catalog, vec![InputRel::Scan { varno: 1 }]);
    let projection = ctx.codegen_projection(&tlist)?;
    assert_eq!(
        explain(&projection)?,
        "{Projection: layout=<0,1,1> args=[{SaveExpr(int4): slot_id=1 args=[\
         {Func::int4pl(int4) args=[{Var(int4): slot_id=0}, {Var(int4): slot_id=2}]}]}]}"
    );
    assert_eq!(ctx.extra_bufsz(), 0);

    let loadvars = ctx.codegen_scan_loadvars()?.ok_or("no loadvars")?;
    assert_eq!(
        explain(&loadvars)?,
        "{LoadVars: depth=0 kvars=[<slot_id=0, resno=1>, <slot_id=2, resno=2>]}"
    );
    Ok(())
}

#[test]
fn projection_of_computed_text_reserves_buffer() -> Result<(), Box<dyn Error>> {
    let (host, catalog) = setup();
    let textcat = host
        .func_oid("textcat", &[oid::TEXT, oid::TEXT])
        .ok_or("no textcat")?;
    let name = Expr::var(1, 1, oid::TEXT);
    let greeting = Expr::func(
        textcat,
        oid::TEXT,
        vec![
            Expr::constant(oid::TEXT, Some(Value::Text("hello ".to_string()))),
            name,
        ],
    );

    let mut ctx = CodegenContext::new(&catalog, vec![InputRel::Scan { varno: 1 }]);
    ctx.codegen_projection(&[TargetEntry::new(greeting, 1)])?;
    assert!(ctx.extra_bufsz() > 0);
    Ok(())
}

#[test]
fn junk_entries_must_come_last() {
    let (_, catalog) = setup();
    let tlist = vec![
        TargetEntry::junk(Expr::var(1, 1, oid::INT4), 1),
        TargetEntry::new(Expr::var(1, 2, oid::INT4), 2),
    ];

    let mut ctx = CodegenContext::new(&catalog, vec![InputRel::Scan { varno: 1 }]);
    let err = ctx.codegen_projection(&tlist).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidArgument(_)));
}

#[test]
fn unsupported_kind_aborts_without_side_effects() -> Result<(), Box<dyn Error>> {
    let (host, catalog) = setup();
    let a = Expr::var(1, 1, oid::INT4);
    let case = Expr::Case {
        whens: vec![(Expr::is_null(a.clone()), Expr::int4(0))],
        default: Some(Box::new(a.clone())),
        type_oid: oid::INT4,
    };
    let qual = int4_op(&host, "=", oid::BOOL, case, Expr::int4(1));

    let mut ctx = CodegenContext::new(&catalog, vec![InputRel::Scan { varno: 1 }]);
    let err = ctx.codegen_scan_quals(&[qual]).unwrap_err();
    assert!(err.is_unsupported());
    assert!(err.to_string().contains("CaseExpr"));
    assert_eq!(ctx.kvars_nslots(), 0);
    assert_eq!(ctx.device_cost(), 0);
    Ok(())
}

#[test]
fn check_only_leaves_context_unchanged() -> Result<(), Box<dyn Error>> {
    let (host, catalog) = setup();
    let a = Expr::var(1, 1, oid::INT4);
    let qual = int4_op(&host, "*", oid::INT4, a, Expr::param(0, oid::INT4));

    let mut ctx = CodegenContext::new(&catalog, vec![InputRel::Scan { varno: 1 }]);
    let cost = ctx.xpu_expression(&qual)?;
    assert!(cost > 0);
    assert_eq!(ctx.kvars_nslots(), 0);
    assert!(ctx.used_params().is_empty());
    assert_eq!(ctx.device_cost(), 0);

    ctx.codegen_expression(&qual)?;
    assert_eq!(ctx.used_params(), &[0]);
    assert_eq!(ctx.device_cost(), cost);
    Ok(())
}

#[test]
fn locale_aware_functions_require_c_collation() -> Result<(), Box<dyn Error>> {
    let (host, catalog) = setup();
    let lt = host
        .oper_oid("<", oid::TEXT, oid::TEXT)
        .ok_or("no text <")?;
    let a = Expr::var(1, 1, oid::TEXT);
    let b = Expr::var(1, 2, oid::VARCHAR);
    let mut qual = Expr::op(lt, oid::BOOL, a, b);

    let mut ctx = CodegenContext::new(&catalog, vec![InputRel::Scan { varno: 1 }]);
    let err = ctx.codegen_scan_quals(&[qual.clone()]).unwrap_err();
    assert!(err.is_unsupported());

    if let Expr::Op { collation, .. } = &mut qual {
        *collation = oid::C_COLLATION;
    }
    assert!(ctx.codegen_scan_quals(&[qual])?.is_some());
    Ok(())
}

#[test]
fn device_kind_restricts_functions() -> Result<(), Box<dyn Error>> {
    let (host, catalog) = setup();
    let concat = host.func_oid("concat", &[oid::TEXT]).ok_or("no concat")?;
    let expr = Expr::func(
        concat,
        oid::TEXT,
        vec![Expr::var(1, 1, oid::TEXT), Expr::var(1, 2, oid::TEXT)],
    );

    let mut gpu = CodegenContext::new(&catalog, vec![InputRel::Scan { varno: 1 }]);
    assert!(gpu.xpu_expression(&expr).is_ok());

    let mut dpu =
        CodegenContext::new(&catalog, vec![InputRel::Scan { varno: 1 }]).with_devkind(DevKind::DPU);
    assert!(dpu.xpu_expression(&expr).unwrap_err().is_unsupported());
    Ok(())
}

#[test]
fn join_quals_flag_other_quals() -> Result<(), Box<dyn Error>> {
    let (host, catalog) = setup();
    let r_a = Expr::var(1, 1, oid::INT4);
    let s_a = Expr::var(2, 1, oid::INT4);
    let s_b = Expr::var(2, 2, oid::INT4);
    let depths = vec![JoinQualsDesc {
        join_quals: vec![int4_op(&host, "=", oid::BOOL, r_a.clone(), s_a)],
        other_quals: vec![int4_op(&host, ">", oid::BOOL, s_b, Expr::int4(10))],
    }];

    let mut ctx = CodegenContext::new(
        &catalog,
        vec![InputRel::Scan { varno: 1 }, InputRel::Scan { varno: 2 }],
    );
    let join_quals = ctx.codegen_join_quals(&depths)?.ok_or("no join quals")?;
    let hash_keys = ctx
        .codegen_hash_keys(&[vec![r_a]])?
        .ok_or("no hash keys")?;
    let loadvars = ctx.codegen_join_loadvars()?.ok_or("no loadvars")?;

    assert_eq!(
        explain(&join_quals)?,
        "{Packed items[1]={JoinQuals: \
         {Func::int4eq(bool) args=[{Var(int4): slot_id=0}, {Var(int4): slot_id=1}]}, \
         [pushed-down]{Func::int4gt(bool) args=[{Var(int4): slot_id=2}, {Const(int4): value='10'}]}}}"
    );
    assert!(join_quals.root().packed_item(0).is_none());
    let item = join_quals.root().packed_item(1).ok_or("no item 1")?;
    assert_eq!(item.opcode(), OpCode::JoinQuals);
    let flags: Vec<KexpFlags> = item.children().map(|c| c.flags()).collect();
    assert_eq!(flags, vec![KexpFlags::empty(), KexpFlags::IS_PUSHED_DOWN]);

    assert_eq!(
        explain(&hash_keys)?,
        "{Packed items[1]={HashValue args=[{Var(int4): slot_id=0}]}}"
    );
    assert_eq!(
        explain(&loadvars)?,
        "{Packed items[0]={LoadVars: depth=0 kvars=[<slot_id=0, resno=1>]}, \
         items[1]={LoadVars: depth=1 kvars=[<slot_id=1, resno=1>, <slot_id=2, resno=2>]}}"
    );
    Ok(())
}

#[test]
fn join_depths_must_match_inputs() {
    let (_, catalog) = setup();
    let mut ctx = CodegenContext::new(&catalog, vec![InputRel::Scan { varno: 1 }]);
    let err = ctx
        .codegen_join_quals(&[JoinQualsDesc::default()])
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidArgument(_)));
}

#[test]
fn groupby_and_aggregates() -> Result<(), Box<dyn Error>> {
    let (_, catalog) = setup();
    let key = Expr::var(1, 1, oid::INT4);
    let qty = Expr::var(1, 2, oid::INT8);
    let price = Expr::var(1, 3, oid::FLOAT8);

    let mut ctx = CodegenContext::new(&catalog, vec![InputRel::Scan { varno: 1 }]);
    let groupby = ctx.codegen_groupby(&[key.clone()])?;
    assert_eq!(
        explain(&groupby.keyhash)?,
        "{HashValue args=[{Var(int4): slot_id=0}]}"
    );
    assert_eq!(
        explain(&groupby.keyload)?,
        "{LoadVars: depth=-2 kvars=[<slot_id=1, resno=1>]}"
    );
    assert_eq!(
        explain(&groupby.keycomp)?,
        "{Func::int4eq(bool) args=[{Var(int4): slot_id=0}, {Var(int4): slot_id=1}]}"
    );

    let targets = vec![
        PartialAgg::Key(0),
        PartialAgg::CountStar,
        PartialAgg::Sum(qty),
        PartialAgg::Max(price.clone()),
        PartialAgg::Count(price),
    ];
    let aggfuncs = ctx.codegen_aggfuncs(&targets, &[key])?;
    let descs = match aggfuncs.root().payload()? {
        Payload::AggFuncs { descs } => descs,
        other => return Err(format!("unexpected payload {:?}", other).into()),
    };
    let actions: Vec<AggAction> = descs.iter().map(|d| d.action).collect();
    assert_eq!(
        actions,
        vec![
            AggAction::Vref,
            AggAction::NRowsAny,
            AggAction::PSumInt,
            AggAction::PMaxFp,
            AggAction::NRowsCond,
        ]
    );
    assert_eq!((descs[0].arg0, descs[0].arg1), (0, -1));
    assert_eq!((descs[1].arg0, descs[1].arg1), (-1, -1));
    assert_eq!(descs[3].arg0, descs[4].arg0);
    assert_eq!(aggfuncs.root().nr_args(), 0);
    Ok(())
}

#[test]
fn aggregates_over_computed_values() -> Result<(), Box<dyn Error>> {
    let (host, catalog) = setup();
    let key = Expr::var(1, 1, oid::INT4);
    let doubled = int4_op(&host, "*", oid::INT4, Expr::var(1, 2, oid::INT4), Expr::int4(2));

    let mut ctx = CodegenContext::new(&catalog, vec![InputRel::Scan { varno: 1 }]);
    ctx.codegen_groupby(&[key.clone()])?;
    let aggfuncs = ctx.codegen_aggfuncs(
        &[PartialAgg::Sum(doubled.clone()), PartialAgg::Avg(doubled)],
        &[key],
    )?;
    assert_eq!(aggfuncs.root().nr_args(), 1);
    let save = aggfuncs.root().child(0).ok_or("no SaveExpr")?;
    assert_eq!(save.opcode(), OpCode::SaveExpr);
    Ok(())
}

#[test]
fn numeric_aggregates_are_unsupported() {
    let (_, catalog) = setup();
    let key = Expr::var(1, 1, oid::INT4);
    let amount = Expr::var(1, 2, oid::NUMERIC);

    let mut ctx = CodegenContext::new(&catalog, vec![InputRel::Scan { varno: 1 }]);
    let err = ctx
        .codegen_aggfuncs(&[PartialAgg::Sum(amount)], &[key])
        .unwrap_err();
    assert!(err.is_unsupported());
}
