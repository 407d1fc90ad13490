/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019 German Research Center for Artificial Intelligence (DFKI)
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

//! Data set generators for join key attributes.
//!
//! The generators produce relation attributes following a random
//! distribution. Nullable attributes are slices of `Option`, with `None`
//! standing for the SQL `NULL`.

use num_traits::FromPrimitive;

use crate::error::{ErrorKind, Result};

use std::convert::TryFrom;
use std::ops::RangeInclusive;

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use rayon::prelude::*;

use zipf::ZipfDistribution;

/// Rows per parallel generator task.
const PAR_CHUNK_LEN: usize = 64 * 1024;

pub trait KeyAttribute: Sized + Copy + Send {
    fn try_from_usize(x: usize) -> Result<Self>;
}

impl KeyAttribute for i32 {
    fn try_from_usize(x: usize) -> Result<Self> {
        Self::try_from(x).map_err(|_| {
            ErrorKind::IntegerOverflow(format!("Key {} exceeds the int4 range", x)).into()
        })
    }
}

impl KeyAttribute for i64 {
    fn try_from_usize(x: usize) -> Result<Self> {
        Self::try_from(x).map_err(|_| {
            ErrorKind::IntegerOverflow(format!("Key {} exceeds the int8 range", x)).into()
        })
    }
}

fn check_percent(percent: u32, what: &str) -> Result<()> {
    if percent > 100 {
        Err(ErrorKind::InvalidArgument(format!(
            "{} must be a percentage, got {}",
            what, percent
        )))?;
    }
    Ok(())
}

fn from_usize<T: FromPrimitive>(x: usize) -> Result<T> {
    FromPrimitive::from_usize(x).ok_or_else(|| {
        ErrorKind::IntegerOverflow("Failed to convert from usize".to_string()).into()
    })
}

/// Generator for relations with uniform distribution.
pub struct UniformRelation;

impl UniformRelation {
    /// Generates a primary key attribute.
    ///
    /// The generated keys are unique and contiguous. The key range starts from
    /// 1 and ends at, i.e. including, attr.len(). Keys are placed at random
    /// locations within the slice.
    ///
    /// `null_percent` of the keys are set to `NULL`. A `NULL` key never
    /// joins, thus the key it replaces is missing from the relation.
    pub fn gen_primary_key<T: KeyAttribute, R: Rng>(
        attr: &mut [Option<T>],
        null_percent: u32,
        rng: &mut R,
    ) -> Result<()> {
        check_percent(null_percent, "NULL fraction")?;
        let percent = Uniform::from(0..100);

        attr.iter_mut()
            .zip(1..)
            .map(|(x, i)| {
                T::try_from_usize(i).map(|i| {
                    *x = if percent.sample(&mut *rng) < null_percent {
                        None
                    } else {
                        Some(i)
                    }
                })
            })
            .collect::<Result<()>>()?;

        attr.shuffle(&mut *rng);
        Ok(())
    }

    /// Generates a foreign key attribute based on a primary key attribute.
    ///
    /// The generated keys are sampled from the primary key attribute, that is,
    /// they follow a foreign-key relationship. If the primary keys are unique,
    /// then the generated foreign keys follow a uniform distribution.
    pub fn gen_foreign_key_from_primary_key<T: Copy, R: Rng>(
        fk_attr: &mut [Option<T>],
        pk_attr: &[Option<T>],
        rng: &mut R,
    ) {
        if pk_attr.is_empty() {
            fk_attr.iter_mut().for_each(|fk| *fk = None);
            return;
        }
        fk_attr
            .iter_mut()
            .zip(pk_attr.iter().cycle())
            .for_each(|(fk, pk)| *fk = *pk);
        fk_attr.shuffle(&mut *rng);
    }

    /// Generates a uniformly distributed attribute.
    ///
    /// The generated values are sampled from `range`.
    pub fn gen_attr<T: FromPrimitive, R: Rng>(
        attr: &mut [T],
        range: RangeInclusive<usize>,
        rng: &mut R,
    ) -> Result<()> {
        if range.is_empty() {
            Err(ErrorKind::InvalidArgument(format!(
                "Cannot sample from the empty range {:?}",
                range
            )))?;
        }
        let between = Uniform::from(range);

        attr.iter_mut()
            .map(|x| from_usize(between.sample(&mut *rng)).map(|r| *x = r))
            .collect::<Result<()>>()?;

        Ok(())
    }

    /// Generates a uniformly distributed attribute in parallel.
    ///
    /// The generated values are sampled from `range`. Every task seeds its
    /// own generator from `seed` and its position, thus the result does not
    /// depend on the number of threads.
    pub fn gen_attr_par<T: FromPrimitive + Send>(
        attr: &mut [T],
        range: RangeInclusive<usize>,
        seed: u64,
    ) -> Result<()> {
        if range.is_empty() {
            Err(ErrorKind::InvalidArgument(format!(
                "Cannot sample from the empty range {:?}",
                range
            )))?;
        }
        let between = Uniform::from(range);

        attr.par_chunks_mut(PAR_CHUNK_LEN)
            .enumerate()
            .map(|(i, chunk)| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
                chunk
                    .iter_mut()
                    .map(|x| from_usize(between.sample(&mut rng)).map(|r| *x = r))
                    .collect::<Result<()>>()
            })
            .collect::<Result<()>>()?;

        Ok(())
    }

    /// Sets `null_percent` of the values to `NULL`.
    pub fn gen_nulls<T, R: Rng>(attr: &mut [Option<T>], null_percent: u32, rng: &mut R) -> Result<()> {
        check_percent(null_percent, "NULL fraction")?;
        let percent = Uniform::from(0..100);
        attr.iter_mut()
            .filter(|_| percent.sample(&mut *rng) < null_percent)
            .for_each(|x| *x = None);
        Ok(())
    }
}

/// Generator for relations with Zipf distribution.
pub struct ZipfRelation;

impl ZipfRelation {
    /// Generates an attribute following the Zipf distribution.
    ///
    /// The generated values are sampled from 1 to num_elements (inclusive).
    /// Note that the exponent must be greather than 0.
    ///
    /// In the literature, num_elements is also called the alphabet size.
    pub fn gen_attr<T: FromPrimitive, R: Rng>(
        attr: &mut [T],
        num_elements: usize,
        exponent: f64,
        rng: &mut R,
    ) -> Result<()> {
        let between = ZipfDistribution::new(num_elements, exponent).map_err(|_| {
            ErrorKind::InvalidArgument(
                "ZipfDistribution requires num_elements and exponent greater than 0".to_string(),
            )
        })?;

        attr.iter_mut()
            .map(|x| from_usize(between.sample(&mut *rng)).map(|r| *x = r))
            .collect::<Result<()>>()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_keys_are_unique() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut keys = vec![None; 1000];
        UniformRelation::gen_primary_key::<i32, _>(&mut keys, 0, &mut rng)?;

        let mut sorted: Vec<i32> = keys.iter().map(|k| k.unwrap_or(0)).collect();
        sorted.sort();
        assert_eq!(sorted, (1..=1000).collect::<Vec<i32>>());
        Ok(())
    }

    #[test]
    fn all_null_primary_keys() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut keys = vec![Some(0_i64); 100];
        UniformRelation::gen_primary_key(&mut keys, 100, &mut rng)?;
        assert!(keys.iter().all(Option::is_none));
        Ok(())
    }

    #[test]
    fn parallel_generation_is_reproducible() -> Result<()> {
        let mut a = vec![0_u32; 200_000];
        let mut b = vec![0_u32; 200_000];
        UniformRelation::gen_attr_par(&mut a, 1..=50, 42)?;
        UniformRelation::gen_attr_par(&mut b, 1..=50, 42)?;
        assert_eq!(a, b);
        assert!(a.iter().all(|&x| x >= 1 && x <= 50));
        Ok(())
    }

    #[test]
    fn zipf_rejects_empty_alphabet() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut attr = vec![0_u32; 10];
        assert!(ZipfRelation::gen_attr(&mut attr, 0, 1.0, &mut rng).is_err());
    }
}
