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
use xpu_codegen::datum::Value;
use xpu_join::driver::GpuJoinBuilder;
use xpu_join::plan::{DepthPlan, JoinType};
use xpu_join::source::SourceChunk;
use xpu_runtime::runtime::cancel::CancellationToken;

const JOIN_TYPES: [JoinType; 4] = [
    JoinType::Inner,
    JoinType::Left,
    JoinType::Right,
    JoinType::Full,
];

fn check_two_depths(hash: bool) -> TestResult {
    let f = Fixture::new(1);
    let rels = JoinWorkload::new(300, vec![40, 30])
        .null_percent(5)
        .selectivity(70)
        .generate(11)?;

    for &first in JOIN_TYPES.iter() {
        for &second in JOIN_TYPES.iter() {
            let depths: Vec<DepthPlan> = [first, second]
                .iter()
                .enumerate()
                .map(|(i, &jt)| {
                    if hash {
                        f.hash_depth(i + 1, jt)
                    } else {
                        f.nestloop_depth(i + 1, jt)
                    }
                })
                .collect();
            let plan = f.plan(depths);
            let expected = reference_join(&plan, &f.catalog, &rels.outer, &rels.inners)?;

            let join = GpuJoinBuilder::new()
                .morsel_len(64)
                .build(plan, f.catalog.clone(), f.mem.clone())?;
            let output = join.run(
                &SourceChunk::from_rows(rels.outer.clone()),
                rels.inners.clone(),
                &CancellationToken::new(),
            )?;

            assert_same_rows(&output.rows, &expected);
            assert_eq!(output.stats.result_rows, expected.len() as u64);
            assert_eq!(output.stats.source_rows, rels.outer.len() as u64);
        }
    }
    Ok(())
}

#[test]
fn hash_joins_match_reference() -> TestResult {
    check_two_depths(true)
}

#[test]
fn nested_loop_joins_match_reference() -> TestResult {
    check_two_depths(false)
}

#[test]
fn mixed_hash_and_nested_loop_depths() -> TestResult {
    let f = Fixture::new(1);
    let rels = JoinWorkload::new(200, vec![25, 25, 10])
        .selectivity(80)
        .generate(5)?;
    let plan = f.plan(vec![
        f.hash_depth(1, JoinType::Inner),
        f.nestloop_depth(2, JoinType::Left),
        f.hash_depth(3, JoinType::Full),
    ]);
    let expected = reference_join(&plan, &f.catalog, &rels.outer, &rels.inners)?;

    let join = GpuJoinBuilder::new().build(plan, f.catalog.clone(), f.mem.clone())?;
    let output = join.run(
        &SourceChunk::from_rows(rels.outer.clone()),
        rels.inners.clone(),
        &CancellationToken::new(),
    )?;
    assert_same_rows(&output.rows, &expected);
    Ok(())
}

#[test]
fn outer_joins_emit_unmatched_rows_exactly_once() -> TestResult {
    let f = Fixture::new(1);
    let outer = vec![outer_row(&[Some(1)], 10), outer_row(&[Some(7)], 20)];
    let inner = vec![
        inner_row(Some(1), 100, "one"),
        inner_row(Some(2), 200, "two"),
        inner_row(Some(3), 300, "three"),
    ];
    let int8 = |v: i64| Some(Value::Int8(v));

    for &join_type in JOIN_TYPES.iter() {
        let plan = f.plan(vec![f.hash_depth(1, join_type)]);
        let join = GpuJoinBuilder::new().build(plan, f.catalog.clone(), f.mem.clone())?;
        let output = join.run(
            &SourceChunk::from_rows(outer.clone()),
            vec![inner.clone()],
            &CancellationToken::new(),
        )?;

        let mut expected = vec![vec![int8(10), int8(100)]];
        if join_type.is_left_outer() {
            expected.push(vec![int8(20), None]);
        }
        if join_type.is_right_outer() {
            expected.push(vec![None, int8(200)]);
            expected.push(vec![None, int8(300)]);
        }
        assert_same_rows(&output.rows, &expected);

        let swept = if join_type.is_right_outer() { 2 } else { 0 };
        assert_eq!(output.stats.right_outer_rows, swept);
    }
    Ok(())
}

#[test]
fn null_keys_never_match() -> TestResult {
    let f = Fixture::new(1);
    let outer = vec![outer_row(&[None], 1), outer_row(&[Some(5)], 2)];
    let inner = vec![inner_row(None, 100, "null"), inner_row(Some(5), 500, "five")];
    let int8 = |v: i64| Some(Value::Int8(v));

    let plan = f.plan(vec![f.hash_depth(1, JoinType::Inner)]);
    let join = GpuJoinBuilder::new().build(plan, f.catalog.clone(), f.mem.clone())?;
    let output = join.run(
        &SourceChunk::from_rows(outer.clone()),
        vec![inner.clone()],
        &CancellationToken::new(),
    )?;
    assert_same_rows(&output.rows, &[vec![int8(2), int8(500)]]);

    // Inner rows with NULL keys are kept for a full join, since they are
    // emitted by the sweep.
    let plan = f.plan(vec![f.hash_depth(1, JoinType::Full)]);
    let join = GpuJoinBuilder::new().build(plan, f.catalog.clone(), f.mem.clone())?;
    let output = join.run(
        &SourceChunk::from_rows(outer),
        vec![inner],
        &CancellationToken::new(),
    )?;
    assert_same_rows(
        &output.rows,
        &[
            vec![int8(2), int8(500)],
            vec![int8(1), None],
            vec![None, int8(100)],
        ],
    );
    Ok(())
}

#[test]
fn other_quals_filter_joined_rows() -> TestResult {
    let f = Fixture::new(1);
    let rels = JoinWorkload::new(150, vec![30]).generate(3)?;
    let key_lt = f.int4_lt(
        Fixture::inner_key(1),
        xpu_codegen::expr::Expr::int4(15),
    );

    for &join_type in JOIN_TYPES.iter() {
        let plan = f.plan(vec![f
            .hash_depth(1, join_type)
            .with_other_quals(vec![key_lt.clone()])]);
        let expected = reference_join(&plan, &f.catalog, &rels.outer, &rels.inners)?;
        let join = GpuJoinBuilder::new().build(plan, f.catalog.clone(), f.mem.clone())?;
        let output = join.run(
            &SourceChunk::from_rows(rels.outer.clone()),
            rels.inners.clone(),
            &CancellationToken::new(),
        )?;
        assert_same_rows(&output.rows, &expected);
    }
    Ok(())
}
