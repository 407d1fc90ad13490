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


//! Sharing of inner buffers between sibling joins.
//!
//! Sibling joins that read the same inner relations with the same plan
//! acquire the buffer under a common key. The first acquirer builds it,
//! concurrent acquirers block until the build finished. The buffer and its
//! device replicas are released when the last sibling releases it.

use super::InnerBuffer;
use crate::error::{ErrorKind, Result};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tracing::debug;

struct Entry {
    refs: usize,
    buffer: Arc<OnceCell<Arc<InnerBuffer>>>,
}

/// Reference-counted inner buffers keyed by `K`
pub struct InnerBufferRegistry<K> {
    entries: Mutex<HashMap<K, Entry>>,
}

impl<K> InnerBufferRegistry<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<K, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| ErrorKind::LogicError("Inner buffer registry poisoned".to_string()).into())
    }

    /// Takes a reference to the buffer of `key`, building it with `build`
    /// if no sibling did so yet.
    pub fn acquire<F>(&self, key: &K, build: F) -> Result<Arc<InnerBuffer>>
    where
        F: FnOnce() -> Result<InnerBuffer>,
    {
        let cell = {
            let mut entries = self.lock()?;
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                refs: 0,
                buffer: Arc::new(OnceCell::new()),
            });
            entry.refs += 1;
            entry.buffer.clone()
        };

        let mut built = false;
        let result = cell
            .get_or_try_init(|| {
                built = true;
                build().map(Arc::new)
            })
            .map(Arc::clone);

        match result {
            Ok(buffer) => {
                debug!(?key, built, "inner buffer acquired");
                Ok(buffer)
            }
            Err(e) => {
                self.release(key)?;
                Err(e)
            }
        }
    }

    /// Drops a reference to the buffer of `key`.
    ///
    /// Returns `true` if this was the last reference.
    pub fn release(&self, key: &K) -> Result<bool> {
        let mut entries = self.lock()?;
        let last = match entries.get_mut(key) {
            Some(entry) => {
                entry.refs -= 1;
                entry.refs == 0
            }
            None => Err(ErrorKind::LogicError(format!(
                "release of unknown inner buffer {:?}",
                key
            )))?,
        };
        if last {
            entries.remove(key);
            debug!(?key, "inner buffer released");
        }
        Ok(last)
    }

    /// Number of siblings holding the buffer of `key`.
    pub fn refs(&self, key: &K) -> Result<usize> {
        Ok(self.lock()?.get(key).map_or(0, |e| e.refs))
    }
}

impl<K> Default for InnerBufferRegistry<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inner_buffer::InnerBufferBuilder;
    use crate::plan::{DepthPlan, JoinPlan, JoinType};
    use xpu_codegen::catalog::{oid, BuiltinCatalog, DevCatalog};
    use xpu_codegen::datum::Value;
    use xpu_codegen::expr::{Expr, InputRel, TargetEntry};

    fn build_one() -> Result<InnerBuffer> {
        let catalog = DevCatalog::new(Arc::new(BuiltinCatalog::new()));
        let plan = JoinPlan {
            input_rels: vec![InputRel::Scan { varno: 1 }, InputRel::Scan { varno: 2 }],
            scan_quals: Vec::new(),
            depths: vec![DepthPlan::nest_loop(JoinType::Inner, Vec::new())],
            tlist: vec![TargetEntry::new(Expr::var(1, 1, oid::INT4), 1)],
            params: Vec::new(),
        };
        InnerBufferBuilder::new().build(
            &plan,
            &catalog,
            vec![vec![vec![Some(Value::Int4(1))], vec![Some(Value::Int4(2))]]],
        )
    }

    #[test]
    fn siblings_share_one_buffer() -> Result<()> {
        let registry = InnerBufferRegistry::new();
        let mut builds = 0;
        let first = registry.acquire(&7, || {
            builds += 1;
            build_one()
        })?;
        let second = registry.acquire(&7, || {
            builds += 1;
            build_one()
        })?;

        assert_eq!(builds, 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.refs(&7)?, 2);
        assert!(!registry.release(&7)?);
        assert!(registry.release(&7)?);
        assert_eq!(registry.refs(&7)?, 0);
        Ok(())
    }

    #[test]
    fn failed_build_drops_the_reference() {
        let registry = InnerBufferRegistry::new();
        let result = registry.acquire(&"a", || {
            Err(ErrorKind::InvalidArgument("no inner relation".to_string()).into())
        });
        assert!(result.is_err());
        assert_eq!(registry.refs(&"a").unwrap(), 0);
    }
}
