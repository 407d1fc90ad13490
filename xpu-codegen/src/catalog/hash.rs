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

//! Hash functions of device types.
//!
//! A key hash is a CRC-32 over the canonical binary image of every non-NULL
//! key. The host uses the same functions to build hash tables that the
//! device uses to probe them.

use crate::datum::Value;
use crc32fast::Hasher;

/// Feeds the canonical image of `value` into `hasher`.
///
/// Floats hash -0.0 like 0.0 and all NaNs alike. Bpchar ignores trailing
/// spaces. Numerics are normalized already.
pub fn hash_datum(hasher: &mut Hasher, value: &Value) {
    match value {
        Value::Float4(v) => {
            let v = if *v == 0.0 {
                0.0
            } else if v.is_nan() {
                std::f32::NAN
            } else {
                *v
            };
            hasher.update(&v.to_bits().to_le_bytes());
        }
        Value::Float8(v) => {
            let v = if *v == 0.0 {
                0.0
            } else if v.is_nan() {
                std::f64::NAN
            } else {
                *v
            };
            hasher.update(&v.to_bits().to_le_bytes());
        }
        Value::Bpchar(s) => hasher.update(s.trim_end_matches(' ').as_bytes()),
        Value::Text(s) => hasher.update(s.as_bytes()),
        Value::Bytea(b) => hasher.update(b),
        other => {
            let mut image = Vec::with_capacity(other.encoded_len());
            other.encode(&mut image);
            hasher.update(&image);
        }
    }
}

/// Hashes a list of keys.
///
/// Returns the hash and whether every key was NULL. NULL keys contribute
/// nothing to the hash.
pub fn hash_keys<'a, I>(keys: I) -> (u32, bool)
where
    I: IntoIterator<Item = Option<&'a Value>>,
{
    let mut hasher = Hasher::new();
    let mut all_null = true;
    for value in keys.into_iter().flatten() {
        hash_datum(&mut hasher, value);
        all_null = false;
    }
    (!hasher.finalize(), all_null)
}
