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

use datagen::workload::{JoinWorkload, KeyDistribution};
use join_fixture::{assert_same_rows, reference_join, Fixture, TestResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use xpu_join::driver::GpuJoinBuilder;
use xpu_join::inner_buffer::InnerBufferBuilder;
use xpu_join::plan::JoinType;
use xpu_join::source::SourceChunk;
use xpu_runtime::runtime::cancel::CancellationToken;

#[test]
fn tiny_stacks_and_results_suspend_and_resume() -> TestResult {
    let f = Fixture::new(1);
    // Skewed keys produce many matches per outer row.
    let rels = JoinWorkload::new(120, vec![20, 15])
        .distribution(KeyDistribution::Zipf(1.2))
        .generate(21)?;
    let join_types = [
        JoinType::Inner,
        JoinType::Left,
        JoinType::Right,
        JoinType::Full,
    ];

    for &join_type in join_types.iter() {
        let plan = f.plan(vec![
            f.nestloop_depth(1, join_type),
            f.hash_depth(2, join_type),
        ]);
        let expected = reference_join(&plan, &f.catalog, &rels.outer, &rels.inners)?;

        let join = GpuJoinBuilder::new()
            .grid(3)
            .lanes(2)
            .stack_rooms(3)
            .dst_bytes(256)
            .build(plan, f.catalog.clone(), f.mem.clone())?;
        let output = join.run(
            &SourceChunk::from_rows(rels.outer.clone()),
            rels.inners.clone(),
            &CancellationToken::new(),
        )?;

        assert_same_rows(&output.rows, &expected);
        assert!(output.stats.suspends > 0, "{:?} never suspended", join_type);
        assert!(output.stats.launches > output.stats.suspends);
        assert_eq!(output.stats.fallback_rows, 0);
    }
    Ok(())
}

#[test]
fn single_room_stacks_still_progress() -> TestResult {
    let f = Fixture::new(1);
    let rels = JoinWorkload::new(50, vec![10, 10, 10]).generate(2)?;
    let plan = f.plan(vec![
        f.hash_depth(1, JoinType::Inner),
        f.hash_depth(2, JoinType::Left),
        f.nestloop_depth(3, JoinType::Inner),
    ]);
    let expected = reference_join(&plan, &f.catalog, &rels.outer, &rels.inners)?;

    let join = GpuJoinBuilder::new()
        .grid(1)
        .lanes(1)
        .stack_rooms(1)
        .build(plan, f.catalog.clone(), f.mem.clone())?;
    let output = join.run(
        &SourceChunk::from_rows(rels.outer.clone()),
        rels.inners.clone(),
        &CancellationToken::new(),
    )?;
    assert_same_rows(&output.rows, &expected);
    Ok(())
}

#[test]
fn result_row_larger_than_destination_faults() -> TestResult {
    let f = Fixture::new(1);
    let rels = JoinWorkload::new(10, vec![10]).generate(4)?;
    let plan = f.plan(vec![f.hash_depth(1, JoinType::Inner)]);

    let join = GpuJoinBuilder::new()
        .dst_bytes(4)
        .build(plan, f.catalog.clone(), f.mem.clone())?;
    let result = join.run(
        &SourceChunk::from_rows(rels.outer),
        rels.inners,
        &CancellationToken::new(),
    );
    assert!(result.is_err());
    Ok(())
}

#[test]
fn small_initial_chunks_grow() -> TestResult {
    let f = Fixture::new(1);
    let rels = JoinWorkload::new(400, vec![300, 200])
        .null_percent(3)
        .generate(8)?;
    let plan = f.plan(vec![
        f.hash_depth(1, JoinType::Left),
        f.nestloop_depth(2, JoinType::Inner),
    ]);
    let expected = reference_join(&plan, &f.catalog, &rels.outer, &rels.inners)?;

    let buffer = InnerBufferBuilder::new()
        .initial_chunk_size(256)
        .growth_factor(1.5)
        .build(&plan, &f.catalog, rels.inners.clone())?;
    assert!(buffer.depth(1).map_or(0, |d| d.expansions) > 0);
    assert!(buffer.depth(2).map_or(0, |d| d.expansions) > 0);
    assert_eq!(buffer.depth(2).map_or(0, |d| d.nitems), 200);

    let join = GpuJoinBuilder::new()
        .inner_buffer(InnerBufferBuilder::new().initial_chunk_size(256))
        .build(plan, f.catalog.clone(), f.mem.clone())?;
    let output = join.run(
        &SourceChunk::from_rows(rels.outer.clone()),
        rels.inners.clone(),
        &CancellationToken::new(),
    )?;
    assert_same_rows(&output.rows, &expected);
    Ok(())
}

#[test]
fn random_launch_geometries_match_reference() -> TestResult {
    let f = Fixture::new(2);
    let rels = JoinWorkload::new(300, vec![40, 25])
        .distribution(KeyDistribution::Zipf(0.8))
        .null_percent(5)
        .generate(33)?;
    let plan = f.plan(vec![
        f.hash_depth(1, JoinType::Full),
        f.nestloop_depth(2, JoinType::Left),
    ]);
    let expected = reference_join(&plan, &f.catalog, &rels.outer, &rels.inners)?;

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..8 {
        let join = GpuJoinBuilder::new()
            .devices(vec![0, 1])
            .grid(rng.gen_range(1, 6))
            .lanes(rng.gen_range(1, 9))
            .stack_rooms(rng.gen_range(1, 16))
            .dst_bytes(rng.gen_range(128, 2048))
            .morsel_len(rng.gen_range(16, 128))
            .build(plan.clone(), f.catalog.clone(), f.mem.clone())?;
        let output = join.run(
            &SourceChunk::from_rows(rels.outer.clone()),
            rels.inners.clone(),
            &CancellationToken::new(),
        )?;
        assert_same_rows(&output.rows, &expected);
    }
    Ok(())
}
