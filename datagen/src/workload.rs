/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019 German Research Center for Artificial Intelligence (DFKI)
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

//! Inputs of multi-way joins.
//!
//! A workload consists of one outer relation and one inner relation per join
//! depth. The rows are laid out as follows:
//!
//! - inner relation of depth `d`: `(key int4, payload int8, name text)`,
//!   where the keys are a shuffled primary key `1..=len`
//! - outer relation: `(fk_1 int4, ..., fk_n int4, payload int8)`, where
//!   `fk_d` references the inner relation of depth `d`
//!
//! Foreign keys that are generated as misses are negative, thus they never
//! find a join partner.

use crate::error::{ErrorKind, Result};
use crate::relation::{UniformRelation, ZipfRelation};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use xpu_codegen::datum::{Row, Value};

/// Distribution of the foreign keys
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KeyDistribution {
    Uniform,
    /// Zipf with the given exponent
    Zipf(f64),
}

/// Generated join input
#[derive(Clone, Debug)]
pub struct JoinRelations {
    pub outer: Vec<Row>,
    /// The inner relation of depth `d` is at `inners[d - 1]`
    pub inners: Vec<Vec<Row>>,
}

/// Description of a join input
#[derive(Clone, Debug)]
pub struct JoinWorkload {
    outer_len: usize,
    inner_lens: Vec<usize>,
    distribution: KeyDistribution,
    null_percent: u32,
    selectivity: u32,
}

impl JoinWorkload {
    pub fn new(outer_len: usize, inner_lens: Vec<usize>) -> Self {
        Self {
            outer_len,
            inner_lens,
            distribution: KeyDistribution::Uniform,
            null_percent: 0,
            selectivity: 100,
        }
    }

    /// The workload of Blanas et al. "Design and evaluation of main memory
    /// hash join algorithms for multi-core CPUs" in SIGMOD 2011, with every
    /// relation divided by `scale`.
    pub fn blanas(depths: usize, scale: usize) -> Self {
        let scale = scale.max(1);
        Self::new(256 * 2_usize.pow(20) / scale, vec![16 * 2_usize.pow(20) / scale; depths])
    }

    /// The workload of Kim et al. "Sort vs. hash revisited: Fast join
    /// implementation on modern multi-core CPUs" in PVLDB 2009, with every
    /// relation divided by `scale`.
    pub fn kim(depths: usize, scale: usize) -> Self {
        let scale = scale.max(1);
        Self::new(128 * 10_usize.pow(6) / scale, vec![128 * 10_usize.pow(6) / scale; depths])
    }

    pub fn distribution(mut self, distribution: KeyDistribution) -> Self {
        self.distribution = distribution;
        self
    }

    /// Percentage of `NULL` keys, in inner and outer relations alike.
    pub fn null_percent(mut self, percent: u32) -> Self {
        self.null_percent = percent;
        self
    }

    /// Percentage of outer foreign keys that reference an inner row.
    pub fn selectivity(mut self, percent: u32) -> Self {
        self.selectivity = percent;
        self
    }

    pub fn outer_len(&self) -> usize {
        self.outer_len
    }

    pub fn inner_lens(&self) -> &[usize] {
        &self.inner_lens
    }

    pub fn generate(&self, seed: u64) -> Result<JoinRelations> {
        if self.selectivity > 100 {
            Err(ErrorKind::InvalidArgument(format!(
                "Selectivity must be a percentage, got {}",
                self.selectivity
            )))?;
        }
        let mut rng = StdRng::seed_from_u64(seed);

        let inners = self
            .inner_lens
            .iter()
            .enumerate()
            .map(|(d, &len)| {
                let mut keys: Vec<Option<i32>> = vec![None; len];
                UniformRelation::gen_primary_key(&mut keys, self.null_percent, &mut rng)?;
                Ok(keys
                    .into_par_iter()
                    .enumerate()
                    .map(|(i, key)| {
                        vec![
                            key.map(Value::Int4),
                            Some(Value::Int8(i as i64 + 1)),
                            Some(Value::Text(format!("r{}-{}", d + 1, i + 1))),
                        ]
                    })
                    .collect())
            })
            .collect::<Result<Vec<Vec<Row>>>>()?;

        let columns = self
            .inner_lens
            .iter()
            .map(|&len| self.foreign_keys(len, &mut rng))
            .collect::<Result<Vec<Vec<Option<i32>>>>>()?;

        let outer = (0..self.outer_len)
            .into_par_iter()
            .map(|i| {
                let mut row: Row = columns.iter().map(|c| c[i].map(Value::Int4)).collect();
                row.push(Some(Value::Int8(i as i64 + 1)));
                row
            })
            .collect();

        Ok(JoinRelations { outer, inners })
    }

    fn foreign_keys(&self, inner_len: usize, rng: &mut StdRng) -> Result<Vec<Option<i32>>> {
        let mut raw = vec![0_i32; self.outer_len];
        if inner_len == 0 {
            raw.iter_mut().for_each(|k| *k = -1);
        } else {
            match self.distribution {
                KeyDistribution::Uniform => {
                    UniformRelation::gen_attr(&mut raw, 1..=inner_len, &mut *rng)?
                }
                KeyDistribution::Zipf(exponent) => {
                    ZipfRelation::gen_attr(&mut raw, inner_len, exponent, &mut *rng)?
                }
            }
        }

        let percent = Uniform::from(0..100);
        let mut keys: Vec<Option<i32>> = raw
            .into_iter()
            .map(|k| {
                if percent.sample(&mut *rng) < self.selectivity {
                    Some(k)
                } else {
                    Some(-k.max(1))
                }
            })
            .collect();
        UniformRelation::gen_nulls(&mut keys, self.null_percent, &mut *rng)?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_relations() -> Result<()> {
        let workload = JoinWorkload::new(500, vec![100, 50]).null_percent(10);
        let a = workload.generate(3)?;
        let b = workload.generate(3)?;
        assert_eq!(a.outer, b.outer);
        assert_eq!(a.inners, b.inners);
        assert_eq!(a.inners[1].len(), 50);
        Ok(())
    }

    #[test]
    fn misses_never_reference_inner_rows() -> Result<()> {
        let rels = JoinWorkload::new(1000, vec![10]).selectivity(0).generate(1)?;
        assert!(rels.outer.iter().all(|row| match row[0] {
            Some(Value::Int4(k)) => k < 0,
            _ => false,
        }));
        Ok(())
    }

    #[test]
    fn zipf_keys_stay_in_range() -> Result<()> {
        let rels = JoinWorkload::new(1000, vec![20])
            .distribution(KeyDistribution::Zipf(1.5))
            .generate(1)?;
        assert!(rels.outer.iter().all(|row| match row[0] {
            Some(Value::Int4(k)) => k >= 1 && k <= 20,
            _ => false,
        }));
        Ok(())
    }
}
