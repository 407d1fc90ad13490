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


use crate::error::{ErrorKind, Result};
use datagen::workload::{JoinRelations, JoinWorkload};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use xpu_codegen::catalog::{oid, BuiltinCatalog, DevCatalog};
use xpu_codegen::expr::{Expr, InputRel, TargetEntry};
use xpu_join::driver::GpuJoinBuilder;
use xpu_join::inner_buffer::InnerBufferBuilder;
use xpu_join::plan::{DepthPlan, JoinPlan, JoinType};
use xpu_join::source::SourceChunk;
use xpu_runtime::runtime::cancel::CancellationToken;
use xpu_runtime::runtime::memory::HostMemService;

/// Measurements of one join run
#[derive(Clone, Debug, Default)]
pub struct JoinPoint {
    pub inner_buffer_bytes: Option<usize>,
    pub build_ns: Option<f64>,
    pub join_ns: Option<f64>,
    pub result_rows: Option<u64>,
    pub launches: Option<u64>,
    pub suspends: Option<u64>,
    pub fallback_rows: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct JoinBenchBuilder {
    join_type: JoinType,
    hash_join: bool,
    num_devices: u16,
    device_capacity: usize,
    seed: u64,
}

pub struct JoinBench {
    pub relations: JoinRelations,
    pub plan: JoinPlan,
    pub catalog: Arc<DevCatalog>,
    pub mem: Arc<HostMemService>,
}

impl Default for JoinBenchBuilder {
    fn default() -> Self {
        Self {
            join_type: JoinType::Inner,
            hash_join: true,
            num_devices: 1,
            device_capacity: 4 * 2_usize.pow(30),
            seed: 42,
        }
    }
}

impl JoinBenchBuilder {
    pub fn join_type(&mut self, join_type: JoinType) -> &mut Self {
        self.join_type = join_type;
        self
    }

    pub fn hash_join(&mut self, hash_join: bool) -> &mut Self {
        self.hash_join = hash_join;
        self
    }

    pub fn num_devices(&mut self, num_devices: u16) -> &mut Self {
        self.num_devices = num_devices;
        self
    }

    pub fn device_capacity(&mut self, bytes: usize) -> &mut Self {
        self.device_capacity = bytes;
        self
    }

    pub fn seed(&mut self, seed: u64) -> &mut Self {
        self.seed = seed;
        self
    }

    /// Generates the relations and returns the generation time.
    pub fn build_with_workload(&self, workload: &JoinWorkload) -> Result<(JoinBench, Duration)> {
        let timer = Instant::now();
        let relations = workload.generate(self.seed)?;
        let data_gen_time = timer.elapsed();
        info!(
            outer = relations.outer.len(),
            depths = relations.inners.len(),
            ms = data_gen_time.as_millis() as u64,
            "relations generated"
        );

        let host = Arc::new(BuiltinCatalog::new());
        let plan = self.plan(&host, relations.inners.len())?;
        let catalog = DevCatalog::new(host);
        let mem = Arc::new(HostMemService::new(self.num_devices, self.device_capacity));

        Ok((
            JoinBench {
                relations,
                plan,
                catalog,
                mem,
            },
            data_gen_time,
        ))
    }

    /// Joins the outer foreign key `fk_d` with the key of inner relation
    /// `d` and emits all payloads.
    fn plan(&self, host: &BuiltinCatalog, depths: usize) -> Result<JoinPlan> {
        let eq = host.oper_oid("=", oid::INT4, oid::INT4).ok_or_else(|| {
            ErrorKind::LogicError("int4 equality operator is missing".to_string())
        })?;

        let depth_plans = (1..=depths)
            .map(|d| {
                let outer_key = Expr::var(1, d as i32, oid::INT4);
                let inner_key = Expr::var(d as u32 + 1, 1, oid::INT4);
                let quals = vec![Expr::op(eq, oid::BOOL, outer_key.clone(), inner_key.clone())];
                if self.hash_join {
                    DepthPlan::hash(self.join_type, quals, vec![outer_key], vec![inner_key])
                } else {
                    DepthPlan::nest_loop(self.join_type, quals)
                }
            })
            .collect();

        let mut tlist = vec![TargetEntry::new(
            Expr::var(1, depths as i32 + 1, oid::INT8),
            1,
        )];
        tlist.extend((1..=depths).map(|d| {
            TargetEntry::new(Expr::var(d as u32 + 1, 2, oid::INT8), d as i32 + 1)
        }));

        Ok(JoinPlan {
            input_rels: (1..=depths as u32 + 1)
                .map(|varno| InputRel::Scan { varno })
                .collect(),
            scan_quals: Vec::new(),
            depths: depth_plans,
            tlist,
            params: Vec::new(),
        })
    }
}

impl JoinBench {
    pub fn outer_tuples(&self) -> usize {
        self.relations.outer.len()
    }

    pub fn inner_tuples(&self) -> Vec<usize> {
        self.relations.inners.iter().map(Vec::len).collect()
    }

    /// Runs the join once.
    ///
    /// The inner buffer is first built in isolation to measure its build
    /// time, then the whole join runs, which builds it again.
    pub fn run(&self, join_builder: &GpuJoinBuilder, num_devices: usize) -> Result<JoinPoint> {
        let inners = self.relations.inners.clone();
        let timer = Instant::now();
        let buffer = InnerBufferBuilder::new()
            .num_devices(num_devices)
            .build(&self.plan, &self.catalog, inners)?;
        let build_time = timer.elapsed();
        let inner_buffer_bytes = buffer.len();
        drop(buffer);

        let join = join_builder.build(self.plan.clone(), self.catalog.clone(), self.mem.clone())?;
        let outer = SourceChunk::from_rows(self.relations.outer.clone());
        let inners = self.relations.inners.clone();

        let timer = Instant::now();
        let output = join.run(&outer, inners, &CancellationToken::new())?;
        let join_time = timer.elapsed();

        debug!(
            rows = output.rows.len(),
            build_ns = build_time.as_nanos() as u64,
            join_ns = join_time.as_nanos() as u64,
            "join measured"
        );

        Ok(JoinPoint {
            inner_buffer_bytes: Some(inner_buffer_bytes),
            build_ns: Some(build_time.as_nanos() as f64),
            join_ns: Some(join_time.as_nanos() as f64),
            result_rows: Some(output.stats.result_rows),
            launches: Some(output.stats.launches),
            suspends: Some(output.stats.suspends),
            fallback_rows: Some(output.stats.fallback_rows),
        })
    }
}
