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


use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::error::Error;
use std::sync::Arc;
use xpu_codegen::catalog::{oid, BuiltinCatalog, DevCatalog};
use xpu_codegen::codegen::CodegenContext;
use xpu_codegen::datum::{Datum, Row, Value};
use xpu_codegen::expr::{Expr, InputRel, TargetEntry};
use xpu_codegen::host_eval::{HostEnv, HostEvaluator};
use xpu_codegen::interp::{
    exec_expression, exec_loadvars, exec_projection, exec_quals, EvalError, KernContext,
};

struct Fixture {
    host: Arc<BuiltinCatalog>,
    catalog: Arc<DevCatalog>,
}

impl Fixture {
    fn new() -> Self {
        let host = Arc::new(BuiltinCatalog::new());
        let catalog = DevCatalog::new(host.clone());
        Self { host, catalog }
    }

    fn op(&self, name: &str, ty: u32, ret: u32, l: Expr, r: Expr) -> Expr {
        let opno = self.host.oper_oid(name, ty, ty).expect("builtin operator");
        Expr::op(opno, ret, l, r)
    }

    fn upper(&self, arg: Expr) -> Expr {
        let func = self
            .host
            .func_oid("upper", &[oid::TEXT])
            .expect("builtin upper");
        Expr::Func {
            func_oid: func,
            args: vec![arg],
            collation: oid::C_COLLATION,
            result_type: oid::TEXT,
        }
    }
}

fn random_rows(n: usize) -> Vec<Row> {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let names = ["alpha", "beta", "gamma", "Delta"];
    (0..n)
        .map(|_| {
            let mut int = || -> Datum {
                if rng.gen_bool(0.1) {
                    None
                } else {
                    Some(Value::Int4(rng.gen_range(-100, 100)))
                }
            };
            let a = int();
            let b = int();
            let c = int();
            let name = Some(Value::Text(names[rng.gen_range(0, names.len())].to_string()));
            vec![a, b, c, name]
        })
        .collect()
}

#[test]
fn bytecode_and_host_evaluation_agree() -> Result<(), Box<dyn Error>> {
    let f = Fixture::new();
    let a = Expr::var(1, 1, oid::INT4);
    let b = Expr::var(1, 2, oid::INT4);
    let c = Expr::var(1, 3, oid::INT4);
    let name = Expr::var(1, 4, oid::TEXT);

    let sum = f.op("+", oid::INT4, oid::INT4, a.clone(), b.clone());
    let quals = vec![
        Expr::or(vec![
            f.op(">", oid::INT4, oid::BOOL, sum.clone(), c.clone()),
            Expr::is_null(c.clone()),
        ]),
        f.op(">", oid::INT4, oid::BOOL, a.clone(), Expr::param(0, oid::INT4)),
    ];
    let tlist = vec![
        TargetEntry::new(a.clone(), 1),
        TargetEntry::new(f.op("*", oid::INT4, oid::INT4, sum, c), 2),
        TargetEntry::new(f.upper(name), 3),
    ];

    let input_rels = vec![InputRel::Scan { varno: 1 }];
    let mut ctx = CodegenContext::new(&f.catalog, input_rels.clone());
    let qual_code = ctx.codegen_scan_quals(&quals)?.ok_or("no quals")?;
    let projection = ctx.codegen_projection(&tlist)?;
    let loadvars = ctx.codegen_scan_loadvars()?.ok_or("no loadvars")?;
    let summary = ctx.finish();
    assert_eq!(summary.used_params, vec![0]);

    let params = vec![Some(Value::Int4(-50))];
    let evaluator = HostEvaluator::new(&f.catalog);
    let mut nmatches = 0;
    for row in random_rows(500) {
        let mut kctx = KernContext::new(summary.kvars_nslots, &params);
        exec_loadvars(&mut kctx, loadvars.root(), Some(&row))?;
        let device_pass = exec_quals(&mut kctx, Some(qual_code.root()))?;

        let rows = [Some(row.as_slice())];
        let env = HostEnv {
            input_rels: &input_rels,
            rows: &rows,
            params: &params,
        };
        assert_eq!(device_pass, evaluator.eval_quals(&quals, &env)?);
        if !device_pass {
            continue;
        }
        nmatches += 1;

        let device_row = exec_projection(&mut kctx, projection.root())?;
        let host_row = tlist
            .iter()
            .map(|te| evaluator.eval(&te.expr, &env))
            .collect::<Result<Row, EvalError>>()?;
        assert_eq!(device_row, host_row);
    }
    assert!(nmatches > 0);
    Ok(())
}

#[test]
fn non_ascii_case_mapping_needs_host_recheck() -> Result<(), Box<dyn Error>> {
    let f = Fixture::new();
    let name = Expr::var(1, 1, oid::TEXT);
    let upper = f.upper(name);
    let input_rels = vec![InputRel::Scan { varno: 1 }];

    let mut ctx = CodegenContext::new(&f.catalog, input_rels.clone());
    let code = ctx.codegen_expression(&upper)?;
    let nslots = ctx.kvars_nslots();

    let row: Row = vec![Some(Value::Text("straße".to_string()))];
    let mut kctx = KernContext::new(nslots, &[]);
    kctx.kvars[0] = row[0].clone();
    match exec_expression(&mut kctx, code.root()) {
        Err(e) => assert!(e.is_recheck()),
        Ok(v) => return Err(format!("device evaluated {:?}", v).into()),
    }

    let rows = [Some(row.as_slice())];
    let env = HostEnv {
        input_rels: &input_rels,
        rows: &rows,
        params: &[],
    };
    let value = HostEvaluator::new(&f.catalog).eval(&upper, &env)?;
    assert_eq!(value, Some(Value::Text("STRAßE".to_string())));
    Ok(())
}

#[test]
fn integer_overflow_is_fatal_everywhere() -> Result<(), Box<dyn Error>> {
    let f = Fixture::new();
    let a = Expr::var(1, 1, oid::INT4);
    let product = f.op("*", oid::INT4, oid::INT4, a.clone(), a);
    let input_rels = vec![InputRel::Scan { varno: 1 }];

    let mut ctx = CodegenContext::new(&f.catalog, input_rels.clone());
    let code = ctx.codegen_expression(&product)?;

    let row: Row = vec![Some(Value::Int4(i32::MAX))];
    let mut kctx = KernContext::new(ctx.kvars_nslots(), &[]);
    kctx.kvars[0] = row[0].clone();
    let err = exec_expression(&mut kctx, code.root()).unwrap_err();
    assert!(!err.is_recheck());

    let rows = [Some(row.as_slice())];
    let env = HostEnv {
        input_rels: &input_rels,
        rows: &rows,
        params: &[],
    };
    let err = HostEvaluator::new(&f.catalog)
        .eval(&product, &env)
        .unwrap_err();
    assert!(!err.is_recheck());
    Ok(())
}
