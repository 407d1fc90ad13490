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


mod join_fixture;

use datagen::workload::JoinWorkload;
use join_fixture::{
    assert_same_rows, inner_row, outer_row, reference_join, Fixture, TestResult,
};
use xpu_codegen::catalog::oid;
use xpu_codegen::expr::{Expr, TargetEntry};
use xpu_join::driver::GpuJoinBuilder;
use xpu_join::error::ErrorKind;
use xpu_join::kernel::FaultInjection;
use xpu_join::plan::JoinType;
use xpu_join::source::SourceChunk;
use xpu_runtime::runtime::cancel::CancellationToken;

#[test]
fn injected_recheck_completes_on_the_host() -> TestResult {
    let f = Fixture::new(1);
    let rels = JoinWorkload::new(200, vec![30, 20])
        .selectivity(75)
        .null_percent(5)
        .generate(17)?;
    let join_types = [
        JoinType::Inner,
        JoinType::Left,
        JoinType::Right,
        JoinType::Full,
    ];

    for &join_type in join_types.iter() {
        for &at_launch in [0, 1, 3].iter() {
            let plan = f.plan(vec![
                f.hash_depth(1, join_type),
                f.nestloop_depth(2, join_type),
            ]);
            let expected = reference_join(&plan, &f.catalog, &rels.outer, &rels.inners)?;

            // A small destination splits the single task into several
            // launches, so the re-check hits a task that already shipped rows.
            let join = GpuJoinBuilder::new()
                .morsel_len(rels.outer.len())
                .grid(2)
                .lanes(4)
                .stack_rooms(8)
                .dst_bytes(512)
                .fault_injection(FaultInjection { at_launch })
                .build(plan, f.catalog.clone(), f.mem.clone())?;
            let output = join.run(
                &SourceChunk::from_rows(rels.outer.clone()),
                rels.inners.clone(),
                &CancellationToken::new(),
            )?;

            assert_same_rows(&output.rows, &expected);
            assert_eq!(output.stats.fallback_tasks, 1);
            assert!(output.stats.suspends >= at_launch as u64);
            assert!(output.stats.launches > at_launch as u64);
            assert_eq!(output.stats.source_rows, rels.outer.len() as u64);
        }
    }
    Ok(())
}

#[test]
fn multibyte_case_mapping_falls_back() -> TestResult {
    let f = Fixture::new(1);
    let outer = (1..=6)
        .map(|k| outer_row(&[Some(k)], i64::from(k)))
        .collect::<Vec<_>>();
    let inner = vec![
        inner_row(Some(1), 10, "alpha"),
        inner_row(Some(2), 20, "straße"),
        inner_row(Some(3), 30, "gamma"),
        inner_row(Some(4), 40, "ünter"),
    ];

    let mut plan = f.plan(vec![f.hash_depth(1, JoinType::Left)]);
    plan.tlist.push(TargetEntry::new(
        f.upper(Expr::var(2, 3, oid::TEXT)),
        3,
    ));
    let expected = reference_join(&plan, &f.catalog, &outer, &[inner.clone()])?;

    let join = GpuJoinBuilder::new().build(plan.clone(), f.catalog.clone(), f.mem.clone())?;
    assert!(join.has_device_program());
    let output = join.run(
        &SourceChunk::from_rows(outer.clone()),
        vec![inner.clone()],
        &CancellationToken::new(),
    )?;
    assert_same_rows(&output.rows, &expected);
    assert!(output.stats.fallback_tasks > 0);

    let join = GpuJoinBuilder::new()
        .cpu_fallback(false)
        .build(plan, f.catalog.clone(), f.mem.clone())?;
    let err = join
        .run(
            &SourceChunk::from_rows(outer),
            vec![inner],
            &CancellationToken::new(),
        )
        .expect_err("re-check without fallback");
    match err.kind() {
        ErrorKind::ExecutionError(_) => {}
        other => panic!("unexpected error {:?}", other),
    }
    Ok(())
}

#[test]
fn device_untranslatable_plan_runs_on_the_host() -> TestResult {
    let f = Fixture::new(1);
    let rels = JoinWorkload::new(100, vec![20])
        .selectivity(60)
        .generate(9)?;
    let mut plan = f.plan(vec![f.hash_depth(1, JoinType::Full)]);
    plan.tlist.push(TargetEntry::new(
        Expr::Coalesce {
            args: vec![Expr::var(2, 1, oid::INT4), Expr::int4(-1)],
            type_oid: oid::INT4,
        },
        3,
    ));
    let expected = reference_join(&plan, &f.catalog, &rels.outer, &rels.inners)?;

    let join = GpuJoinBuilder::new().build(plan, f.catalog.clone(), f.mem.clone())?;
    assert!(!join.has_device_program());
    let output = join.run(
        &SourceChunk::from_rows(rels.outer.clone()),
        rels.inners.clone(),
        &CancellationToken::new(),
    )?;
    assert_same_rows(&output.rows, &expected);
    assert_eq!(output.stats.launches, 0);
    Ok(())
}
