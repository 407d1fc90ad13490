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

use datagen::workload::{JoinRelations, JoinWorkload};
use join_fixture::{assert_same_rows, reference_join, Fixture, TestResult};
use std::sync::Arc;
use xpu_codegen::datum::{Datum, Row};
use xpu_join::device_mem::DeviceAlloc;
use xpu_join::driver::GpuJoinBuilder;
use xpu_join::error::ErrorKind;
use xpu_join::inner_buffer::{InnerBufferBuilder, InnerBufferRegistry};
use xpu_join::plan::JoinType;
use xpu_join::source::SourceChunk;
use xpu_runtime::runtime::allocator::MemType;
use xpu_runtime::runtime::cancel::CancellationToken;
use xpu_runtime::runtime::memory::MemService;

fn workload(seed: u64) -> Result<JoinRelations, Box<dyn std::error::Error>> {
    Ok(JoinWorkload::new(2000, vec![300, 200])
        .selectivity(80)
        .null_percent(3)
        .generate(seed)?)
}

#[test]
fn worker_mixes_match_reference() -> TestResult {
    let f = Fixture::new(2);
    let rels = workload(3)?;
    let plan = f.plan(vec![
        f.hash_depth(1, JoinType::Full),
        f.hash_depth(2, JoinType::Right),
    ]);
    let expected = reference_join(&plan, &f.catalog, &rels.outer, &rels.inners)?;

    let mixes: Vec<(Vec<u16>, usize)> = vec![
        (vec![0], 0),
        (vec![0, 1], 0),
        (vec![1, 0], 2),
        (vec![], 3),
    ];
    for (devices, cpu_workers) in mixes {
        let join = GpuJoinBuilder::new()
            .devices(devices.clone())
            .cpu_workers(cpu_workers)
            .morsel_len(128)
            .build(plan.clone(), f.catalog.clone(), f.mem.clone())?;
        let output = join.run(
            &SourceChunk::from_rows(rels.outer.clone()),
            rels.inners.clone(),
            &CancellationToken::new(),
        )?;

        assert_same_rows(&output.rows, &expected);
        assert_eq!(output.stats.result_rows, expected.len() as u64);
        if devices.is_empty() {
            assert_eq!(output.stats.launches, 0);
        } else {
            assert!(output.stats.launches > 0);
        }
    }
    Ok(())
}

#[test]
fn columnar_outer_chunk() -> TestResult {
    let f = Fixture::new(1);
    let rels = workload(4)?;
    let plan = f.plan(vec![
        f.hash_depth(1, JoinType::Inner),
        f.nestloop_depth(2, JoinType::Left),
    ]);
    let expected = reference_join(&plan, &f.catalog, &rels.outer, &rels.inners)?;

    let ncols = rels.outer.first().map_or(0, Vec::len);
    let columns: Vec<Vec<Datum>> = (0..ncols)
        .map(|c| rels.outer.iter().map(|row| row[c].clone()).collect())
        .collect();
    let chunk = SourceChunk::from_columns(columns)?;
    assert_eq!(chunk.nrows(), rels.outer.len());

    let join = GpuJoinBuilder::new()
        .morsel_len(300)
        .build(plan, f.catalog.clone(), f.mem.clone())?;
    let output = join.run(&chunk, rels.inners, &CancellationToken::new())?;
    assert_same_rows(&output.rows, &expected);
    Ok(())
}

#[test]
fn empty_inner_relation_skips_the_devices() -> TestResult {
    let f = Fixture::new(1);
    let rels = workload(5)?;
    let plan = f.plan(vec![
        f.hash_depth(1, JoinType::Left),
        f.hash_depth(2, JoinType::Inner),
    ]);

    let join = GpuJoinBuilder::new().build(plan, f.catalog.clone(), f.mem.clone())?;
    let inners: Vec<Vec<Row>> = vec![rels.inners[0].clone(), Vec::new()];
    let output = join.run(
        &SourceChunk::from_rows(rels.outer),
        inners,
        &CancellationToken::new(),
    )?;
    assert!(output.rows.is_empty());
    assert_eq!(output.stats.launches, 0);
    Ok(())
}

#[test]
fn cancelled_join_stops() -> TestResult {
    let f = Fixture::new(1);
    let rels = workload(6)?;
    let plan = f.plan(vec![f.hash_depth(1, JoinType::Inner)]);
    let join = GpuJoinBuilder::new()
        .cpu_workers(1)
        .build(plan, f.catalog.clone(), f.mem.clone())?;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = join
        .run(&SourceChunk::from_rows(rels.outer), vec![rels.inners[0].clone()], &cancel)
        .expect_err("cancelled join");
    assert!(err.is_cancelled());
    Ok(())
}

#[test]
fn sibling_joins_share_one_inner_buffer() -> TestResult {
    let f = Fixture::new(1);
    let rels = workload(7)?;
    let plan = f.plan(vec![
        f.hash_depth(1, JoinType::Inner),
        f.hash_depth(2, JoinType::Left),
    ]);
    let expected = reference_join(&plan, &f.catalog, &rels.outer, &rels.inners)?;

    let registry = Arc::new(InnerBufferRegistry::new());
    let key = "scan-1".to_string();
    let join = GpuJoinBuilder::new()
        .shared_inner(registry.clone(), key.clone())
        .build(plan, f.catalog.clone(), f.mem.clone())?;

    let (half_a, half_b) = rels.outer.split_at(rels.outer.len() / 2);
    let run_half = |half: &[Row]| {
        join.run(
            &SourceChunk::from_rows(half.to_vec()),
            rels.inners.clone(),
            &CancellationToken::new(),
        )
    };
    let (a, b) = rayon::join(|| run_half(half_a), || run_half(half_b));

    let mut rows = a?.rows;
    rows.extend(b?.rows);
    assert_same_rows(&rows, &expected);
    assert_eq!(registry.refs(&key)?, 0);
    Ok(())
}

#[test]
fn shared_inner_rejects_right_outer_joins() -> TestResult {
    let f = Fixture::new(1);
    let plan = f.plan(vec![f.hash_depth(1, JoinType::Right)]);
    let result = GpuJoinBuilder::new()
        .shared_inner(Arc::new(InnerBufferRegistry::new()), "scan-2".to_string())
        .build(plan, f.catalog.clone(), f.mem.clone());

    match result.map(|_| ()).map_err(|e| e.kind().to_string()) {
        Err(msg) => assert!(msg.contains("cannot share")),
        Ok(()) => panic!("right outer join shared an inner buffer"),
    }
    Ok(())
}

#[test]
fn invalid_settings_are_rejected() -> TestResult {
    let f = Fixture::new(1);
    let plan = f.plan(vec![f.hash_depth(1, JoinType::Inner)]);
    let builders = vec![
        GpuJoinBuilder::new().grid(0),
        GpuJoinBuilder::new().dst_bytes(0),
        GpuJoinBuilder::new().devices(vec![1]),
        GpuJoinBuilder::new().devices(vec![0, 0]),
        GpuJoinBuilder::new().devices(vec![]).cpu_workers(0),
    ];
    for builder in builders {
        let result = builder.build(plan.clone(), f.catalog.clone(), f.mem.clone());
        match result {
            Err(e) => match e.kind() {
                ErrorKind::InvalidArgument(_) => {}
                other => panic!("unexpected error {:?}", other),
            },
            Ok(_) => panic!("invalid settings accepted"),
        }
    }
    Ok(())
}

#[test]
fn row_larger_than_destination_faults_the_kernel() -> TestResult {
    let f = Fixture::new(1);
    let rels = workload(29)?;
    let plan = f.plan(vec![f.hash_depth(1, JoinType::Inner)]);
    let join = GpuJoinBuilder::new()
        .dst_bytes(8)
        .build(plan, f.catalog.clone(), f.mem.clone())?;
    let err = join
        .run(
            &SourceChunk::from_rows(rels.outer),
            rels.inners[..1].to_vec(),
            &CancellationToken::new(),
        )
        .expect_err("row cannot fit the destination buffer");
    match err.kind() {
        ErrorKind::KernelFault(msg) => assert!(msg.contains("exceeds the destination")),
        other => panic!("unexpected error {:?}", other),
    }
    Ok(())
}

#[test]
fn staging_falls_back_to_device_memory() -> TestResult {
    let f = Fixture::with_capacity(1, 150);
    let mem: Arc<dyn MemService> = f.mem.clone();

    let staged = DeviceAlloc::stage(&mem, 0, &[7; 100])?;
    assert_eq!(staged.mem_type(), MemType::DevMem(0));
    drop(staged);

    let staged = DeviceAlloc::stage(&mem, 0, &[7; 60])?;
    assert_eq!(staged.mem_type(), MemType::IoMapMem(0));
    drop(staged);

    let tiny = Fixture::with_capacity(1, 50);
    let mem: Arc<dyn MemService> = tiny.mem.clone();
    let err = DeviceAlloc::stage(&mem, 0, &[7; 100])
        .map(|_| ())
        .expect_err("allocation exceeds the device");
    assert!(err.is_out_of_memory());
    Ok(())
}

#[test]
fn inner_buffer_replicas_follow_the_capacity() -> TestResult {
    let f = Fixture::new(1);
    let rels = workload(8)?;
    let plan = f.plan(vec![
        f.hash_depth(1, JoinType::Inner),
        f.hash_depth(2, JoinType::Inner),
    ]);
    let mut buffer = InnerBufferBuilder::new().num_devices(1).build(
        &plan,
        &f.catalog,
        rels.inners.clone(),
    )?;
    let len = buffer.len();

    let roomy = Fixture::with_capacity(1, len * 2);
    let mem: Arc<dyn MemService> = roomy.mem.clone();
    buffer.upload(&mem, &[0])?;
    assert_eq!(buffer.replica_mem_type(0)?, MemType::IoMapMem(0));

    let mut buffer = InnerBufferBuilder::new().num_devices(1).build(
        &plan,
        &f.catalog,
        rels.inners.clone(),
    )?;
    let tight = Fixture::with_capacity(1, len + len / 2);
    let mem: Arc<dyn MemService> = tight.mem.clone();
    buffer.upload(&mem, &[0])?;
    assert_eq!(buffer.replica_mem_type(0)?, MemType::DevMem(0));
    Ok(())
}

#[test]
fn exhausted_device_fails_the_join() -> TestResult {
    let f = Fixture::with_capacity(1, 64);
    let rels = workload(9)?;
    let plan = f.plan(vec![f.hash_depth(1, JoinType::Inner)]);
    let join = GpuJoinBuilder::new().build(plan, f.catalog.clone(), f.mem.clone())?;

    let err = join
        .run(
            &SourceChunk::from_rows(rels.outer),
            vec![rels.inners[0].clone()],
            &CancellationToken::new(),
        )
        .expect_err("inner buffer exceeds the device");
    assert!(err.is_out_of_memory());
    Ok(())
}
