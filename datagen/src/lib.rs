/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019 German Research Center for Artificial Intelligence (DFKI)
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

//! Generators for the relations of multi-way join tests and benchmarks.
//!
//! Key attributes are generated by `relation`, whole join inputs by
//! `workload`. All generators are seeded, thus a seed reproduces the same
//! relations.

pub mod error;
pub mod relation;
pub mod workload;
