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


use super::join_bench::JoinBench;
use crate::error::Result;
use crate::types::*;
use crate::CmdOpt;
use serde::Serializer;
use serde_derive::Serialize;
use std::string::ToString;
use std::time::Duration;

#[derive(Clone, Debug, Default, Serialize)]
pub struct DataPoint {
    pub data_set: Option<String>,
    pub hostname: String,
    pub execution_method: Option<ArgExecutionMethod>,
    #[serde(serialize_with = "serialize_vec")]
    pub devices: Option<Vec<u16>>,
    pub cpu_workers: Option<usize>,
    pub join_type: Option<ArgJoinType>,
    pub join_method: Option<ArgJoinMethod>,
    pub depths: Option<usize>,
    pub outer_tuples: Option<usize>,
    #[serde(serialize_with = "serialize_vec")]
    pub inner_tuples: Option<Vec<usize>>,
    pub null_percent: Option<u32>,
    pub selectivity: Option<u32>,
    pub zipf_exponent: Option<f64>,
    pub grid: Option<usize>,
    pub lanes: Option<usize>,
    pub stack_rooms: Option<usize>,
    pub dst_bytes: Option<usize>,
    pub morsel_len: Option<usize>,
    pub cpu_fallback: Option<bool>,
    pub warm_up: Option<bool>,
    pub inner_buffer_bytes: Option<usize>,
    pub result_rows: Option<u64>,
    pub launches: Option<u64>,
    pub suspends: Option<u64>,
    pub fallback_rows: Option<u64>,
    pub build_ns: Option<f64>,
    pub join_ns: Option<f64>,
    pub relation_gen_ns: Option<f64>,
}

impl DataPoint {
    pub fn new() -> Result<DataPoint> {
        let hostname = hostname::get_hostname().ok_or_else(|| "Couldn't get hostname")?;

        let dp = DataPoint {
            hostname,
            ..DataPoint::default()
        };

        Ok(dp)
    }

    pub fn fill_from_cmd_options(&self, cmd: &CmdOpt) -> DataPoint {
        let (devices, cpu_workers) = cmd.workers();
        let mut sorted_devices = devices;
        sorted_devices.sort();

        DataPoint {
            data_set: Some(cmd.data_set.to_string()),
            execution_method: Some(cmd.execution_method),
            devices: Some(sorted_devices),
            cpu_workers: Some(cpu_workers),
            join_type: Some(cmd.join_type),
            join_method: Some(cmd.join_method),
            null_percent: Some(cmd.null_percent),
            selectivity: Some(cmd.selectivity),
            zipf_exponent: cmd.zipf_exponent,
            grid: Some(cmd.grid),
            lanes: Some(cmd.lanes),
            stack_rooms: Some(cmd.stack_rooms),
            dst_bytes: Some(cmd.dst_bytes),
            morsel_len: Some(cmd.morsel_len),
            cpu_fallback: Some(!cmd.no_cpu_fallback),
            ..self.clone()
        }
    }

    pub fn fill_from_join_bench(&self, jb: &JoinBench) -> DataPoint {
        let inner_tuples = jb.inner_tuples();
        DataPoint {
            depths: Some(inner_tuples.len()),
            outer_tuples: Some(jb.outer_tuples()),
            inner_tuples: Some(inner_tuples),
            ..self.clone()
        }
    }

    pub fn set_init_time(&self, data_gen: Duration) -> DataPoint {
        DataPoint {
            relation_gen_ns: Some(data_gen.as_nanos() as f64),
            ..self.clone()
        }
    }
}

/// Serialize `Option<Vec<T>>` by converting it into a `String`.
///
/// This is necessary because the `csv` crate does not support nesting `Vec`
/// instead of flattening it.
fn serialize_vec<S, T>(option: &Option<Vec<T>>, ser: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
    T: ToString,
{
    if let Some(vec) = option {
        let record = vec
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        ser.serialize_str(&record)
    } else {
        ser.serialize_none()
    }
}
