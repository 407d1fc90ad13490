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


mod error;
mod measurement;
mod types;

use crate::error::{ErrorKind, Result};
use crate::measurement::data_point::DataPoint;
use crate::measurement::harness;
use crate::measurement::join_bench::{JoinBenchBuilder, JoinPoint};
use crate::types::*;

use datagen::workload::{JoinWorkload, KeyDistribution};
use std::path::PathBuf;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;
use xpu_join::driver::GpuJoinBuilder;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Parse commandline arguments
    let cmd = CmdOpt::from_args();

    let (func, dp) = args_to_bench(&cmd)?;
    harness::measure("multi_way_join", cmd.repeat, cmd.csv.clone(), dp, func)?;

    Ok(())
}

#[derive(StructOpt)]
#[structopt(
    name = "join_bench",
    about = "A benchmark for the multi-way join operator"
)]
pub struct CmdOpt {
    /// Number of times to repeat benchmark
    #[structopt(short = "r", long = "repeat", default_value = "30")]
    repeat: u32,

    /// Output filename for measurement CSV file
    #[structopt(long = "csv", parse(from_os_str))]
    csv: Option<PathBuf>,

    /// Use a pre-defined or custom data set.
    //   blanas: Blanas et al. "Main memory hash join algorithms for multi-core CPUs"
    //   kim: Kim et al. "Sort vs. hash revisited"
    //   test: A small data set for testing on the laptop
    //   custom: Sizes given by --inner-rel-tuples and --outer-rel-tuples
    #[structopt(
        short = "s",
        long = "data-set",
        default_value = "Test",
        raw(possible_values = "&ArgDataSet::variants()", case_insensitive = "true")
    )]
    data_set: ArgDataSet,

    /// Divide the sizes of a popular data set
    #[structopt(long = "scale", default_value = "1")]
    scale: usize,

    /// Number of inner relations joined to the outer relation
    #[structopt(long = "depths", default_value = "1")]
    depths: usize,

    /// Set the inner relation size (tuples); required for `--data-set Custom`
    #[structopt(
        long = "inner-rel-tuples",
        raw(required_if = r#""data_set", "Custom""#)
    )]
    inner_rel_tuples: Option<usize>,

    /// Set the outer relation size (tuples); required for `--data-set Custom`
    #[structopt(
        long = "outer-rel-tuples",
        raw(required_if = r#""data_set", "Custom""#)
    )]
    outer_rel_tuples: Option<usize>,

    /// Percentage of NULL join keys
    #[structopt(long = "null-percent", default_value = "0")]
    null_percent: u32,

    /// Percentage of outer keys that find a join partner
    #[structopt(long = "selectivity", default_value = "100")]
    selectivity: u32,

    /// Draw outer keys from a Zipf distribution with this exponent
    #[structopt(long = "zipf-exponent")]
    zipf_exponent: Option<f64>,

    #[structopt(long = "seed", default_value = "42")]
    seed: u64,

    /// Join type of every depth
    #[structopt(
        long = "join-type",
        default_value = "Inner",
        raw(possible_values = "&ArgJoinType::variants()", case_insensitive = "true")
    )]
    join_type: ArgJoinType,

    /// Probe inner relations by hash or by nested loop
    #[structopt(
        long = "join-method",
        default_value = "Hash",
        raw(possible_values = "&ArgJoinMethod::variants()", case_insensitive = "true")
    )]
    join_method: ArgJoinMethod,

    /// Execute on devices, CPU workers, or both.
    #[structopt(
        long = "execution-method",
        default_value = "Gpu",
        raw(
            possible_values = "&ArgExecutionMethod::variants()",
            case_insensitive = "true"
        )
    )]
    execution_method: ArgExecutionMethod,

    #[structopt(
        short = "i",
        long = "device-id",
        default_value = "0",
        raw(require_delimiter = "true")
    )]
    /// Execute on devices (e.g.: 0,1)
    device_id: Vec<u16>,

    /// Per-device memory capacity (bytes)
    #[structopt(long = "device-bytes", default_value = "4294967296")]
    device_bytes: usize,

    #[structopt(short = "t", long = "threads", default_value = "1")]
    threads: usize,

    /// Thread-groups per kernel launch
    #[structopt(long = "grid", default_value = "4")]
    grid: usize,

    /// Lanes per thread-group
    #[structopt(long = "lanes", default_value = "32")]
    lanes: usize,

    /// Stack rooms per thread-group and depth
    #[structopt(long = "stack-rooms", default_value = "2048")]
    stack_rooms: usize,

    /// Destination buffer size (bytes)
    #[structopt(long = "dst-bytes", default_value = "1048576")]
    dst_bytes: usize,

    /// Outer tuples per morsel
    #[structopt(long = "morsel-len", default_value = "16384")]
    morsel_len: usize,

    /// Fail instead of re-executing on the CPU
    #[structopt(long = "no-cpu-fallback")]
    no_cpu_fallback: bool,
}

impl CmdOpt {
    /// Devices and CPU workers of the execution method.
    pub fn workers(&self) -> (Vec<u16>, usize) {
        match self.execution_method {
            ArgExecutionMethod::Cpu => (Vec::new(), self.threads),
            ArgExecutionMethod::Gpu => (self.device_id.clone(), 0),
            ArgExecutionMethod::Het => (self.device_id.clone(), self.threads),
        }
    }
}

fn args_to_bench(cmd: &CmdOpt) -> Result<(Box<dyn FnMut() -> Result<JoinPoint>>, DataPoint)> {
    let workload = workload(cmd)?
        .distribution(match cmd.zipf_exponent {
            Some(exponent) => KeyDistribution::Zipf(exponent),
            None => KeyDistribution::Uniform,
        })
        .null_percent(cmd.null_percent)
        .selectivity(cmd.selectivity);

    let (devices, cpu_workers) = cmd.workers();
    let num_devices = devices.iter().max().map_or(1, |&max| max + 1);

    let (jb, data_gen_time) = JoinBenchBuilder::default()
        .join_type(cmd.join_type.into())
        .hash_join(cmd.join_method == ArgJoinMethod::Hash)
        .num_devices(num_devices)
        .device_capacity(cmd.device_bytes)
        .seed(cmd.seed)
        .build_with_workload(&workload)?;

    // Construct data point template for CSV
    let dp = DataPoint::new()?
        .fill_from_cmd_options(cmd)
        .fill_from_join_bench(&jb)
        .set_init_time(data_gen_time);

    let join_builder = GpuJoinBuilder::new()
        .devices(devices.clone())
        .cpu_workers(cpu_workers)
        .grid(cmd.grid)
        .lanes(cmd.lanes)
        .stack_rooms(cmd.stack_rooms)
        .dst_bytes(cmd.dst_bytes)
        .morsel_len(cmd.morsel_len)
        .cpu_fallback(!cmd.no_cpu_fallback);
    let replicas = devices.len();

    let func: Box<dyn FnMut() -> Result<JoinPoint>> =
        Box::new(move || jb.run(&join_builder, replicas));

    Ok((func, dp))
}

fn workload(cmd: &CmdOpt) -> Result<JoinWorkload> {
    if cmd.depths == 0 {
        Err(ErrorKind::InvalidArgument(
            "At least one inner relation is required".to_string(),
        ))?;
    }

    let workload = match cmd.data_set {
        ArgDataSet::Blanas => JoinWorkload::blanas(cmd.depths, cmd.scale),
        ArgDataSet::Kim => JoinWorkload::kim(cmd.depths, cmd.scale),
        ArgDataSet::Test => JoinWorkload::new(1000, vec![1000; cmd.depths]),
        ArgDataSet::Custom => {
            let (inner, outer) = match (cmd.inner_rel_tuples, cmd.outer_rel_tuples) {
                (Some(inner), Some(outer)) => (inner, outer),
                _ => Err(ErrorKind::InvalidArgument(
                    "Custom data sets require --inner-rel-tuples and --outer-rel-tuples"
                        .to_string(),
                ))?,
            };
            JoinWorkload::new(outer, vec![inner; cmd.depths])
        }
    };
    Ok(workload)
}
