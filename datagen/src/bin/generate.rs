/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

use datagen::workload::{JoinWorkload, KeyDistribution};
use serde_derive::Serialize;
use std::path::PathBuf;
use structopt::clap::arg_enum;
use structopt::StructOpt;
use xpu_codegen::datum::{Datum, Value};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn main() -> Result<()> {
    // Parse commandline arguments
    let cmd = CmdOpt::from_args();

    let workload = match cmd.data_set {
        Some(ArgDataSet::Blanas) => JoinWorkload::blanas(cmd.depths, cmd.scale),
        Some(ArgDataSet::Kim) => JoinWorkload::kim(cmd.depths, cmd.scale),
        None => JoinWorkload::new(cmd.outer_rel_tuples, vec![cmd.inner_rel_tuples; cmd.depths]),
    };
    let distribution = match cmd.zipf_exponent {
        Some(exponent) => KeyDistribution::Zipf(exponent),
        None => KeyDistribution::Uniform,
    };
    let rels = workload
        .distribution(distribution)
        .null_percent(cmd.null_percent)
        .selectivity(cmd.selectivity)
        .generate(cmd.seed)?;

    let mut spec = csv::WriterBuilder::new();
    spec.has_headers(false).delimiter(match cmd.file_type {
        ArgFileType::Csv => b',',
        ArgFileType::Tsv => b'\t',
    });
    let ext = match cmd.file_type {
        ArgFileType::Csv => "csv",
        ArgFileType::Tsv => "tsv",
    };

    for (d, inner) in rels.inners.iter().enumerate() {
        let mut writer = spec.from_path(cmd.out_dir.join(format!("inner_{}.{}", d + 1, ext)))?;
        for row in inner {
            writer.serialize(InnerRecord::from_row(row))?;
        }
        writer.flush()?;
    }

    let mut writer = spec.from_path(cmd.out_dir.join(format!("outer.{}", ext)))?;
    for row in &rels.outer {
        writer.write_record(row.iter().map(field))?;
    }
    writer.flush()?;

    Ok(())
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq)]
    pub enum ArgDataSet {
        Blanas,
        Kim,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq)]
    pub enum ArgFileType {
        Csv,
        Tsv,
    }
}

#[derive(StructOpt)]
struct CmdOpt {
    /// Generate a popular data set
    //   blanas: Blanas et al. "Main memory hash join algorithms for multi-core CPUs"
    //   kim: Kim et al. "Sort vs. hash revisited"
    #[structopt(
        long = "data-set",
        raw(possible_values = "&ArgDataSet::variants()", case_insensitive = "true")
    )]
    data_set: Option<ArgDataSet>,

    /// Divide the sizes of a popular data set
    #[structopt(long = "scale", default_value = "1")]
    scale: usize,

    /// Number of inner relations
    #[structopt(long = "depths", default_value = "1")]
    depths: usize,

    /// Inner relation size (tuples)
    #[structopt(long = "inner-tuples", default_value = "1000")]
    inner_rel_tuples: usize,

    /// Outer relation size (tuples)
    #[structopt(long = "outer-tuples", default_value = "10000")]
    outer_rel_tuples: usize,

    /// Percentage of NULL keys
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

    /// Set the output file type
    #[structopt(
        long = "file-type",
        default_value = "Tsv",
        raw(
            possible_values = "&ArgFileType::variants()",
            case_insensitive = "true"
        )
    )]
    file_type: ArgFileType,

    /// Output directory
    #[structopt(parse(from_os_str))]
    out_dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct InnerRecord {
    key: Option<i32>,
    payload: Option<i64>,
    name: Option<String>,
}

impl InnerRecord {
    fn from_row(row: &[Datum]) -> Self {
        let get = |i: usize| row.get(i).cloned().unwrap_or(None);
        Self {
            key: match get(0) {
                Some(Value::Int4(k)) => Some(k),
                _ => None,
            },
            payload: match get(1) {
                Some(Value::Int8(p)) => Some(p),
                _ => None,
            },
            name: match get(2) {
                Some(Value::Text(s)) => Some(s),
                _ => None,
            },
        }
    }
}

/// Formats a datum, with `NULL` as the empty field.
fn field(datum: &Datum) -> String {
    datum.as_ref().map(Value::to_string).unwrap_or_default()
}
