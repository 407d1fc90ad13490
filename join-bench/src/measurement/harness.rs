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


use super::data_point::DataPoint;
use super::join_bench::JoinPoint;
use crate::error::Result;
use error_chain::ensure;
use std::path::PathBuf;
use tracing::info;

/// Runs `func` once to warm up and `repeat` more times, then writes one CSV
/// row per run.
pub fn measure(
    name: &str,
    repeat: u32,
    out_file_name: Option<PathBuf>,
    template: DataPoint,
    mut func: Box<dyn FnMut() -> Result<JoinPoint>>,
) -> Result<()> {
    let measurements = (0..=repeat)
        .zip(std::iter::once(true).chain(std::iter::repeat(false)))
        .map(|(run, warm_up)| {
            let p = func()?;
            info!(
                bench = name,
                run,
                warm_up,
                rows = p.result_rows.unwrap_or(0),
                join_ns = p.join_ns.unwrap_or(0.0),
                "run finished"
            );
            Ok(DataPoint {
                warm_up: Some(warm_up),
                relation_gen_ns: if warm_up {
                    template.relation_gen_ns
                } else {
                    None
                },
                inner_buffer_bytes: p.inner_buffer_bytes,
                result_rows: p.result_rows,
                launches: p.launches,
                suspends: p.suspends,
                fallback_rows: p.fallback_rows,
                build_ns: p.build_ns,
                join_ns: p.join_ns,
                ..template.clone()
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if let Some(ofn) = out_file_name {
        let csv_file = std::fs::File::create(ofn)?;
        let mut csv = csv::Writer::from_writer(csv_file);
        ensure!(
            measurements
                .iter()
                .try_for_each(|row| csv.serialize(row))
                .is_ok(),
            "Couldn't write serialized measurements"
        );
        csv.flush()?;
    }

    Ok(())
}
