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


//! # The XPU Join Engine
//!
//! `xpu-join` executes N-way joins of one outer relation with a chain of
//! inner relations. Each depth is either a hash join or a nested-loop join,
//! of type inner, left, right, or full outer. The crate provides:
//!
//! - The inner buffer: all inner relations packed into one contiguous image
//!   that is replicated to every device ([`inner_buffer`])
//! - A kernel that joins thread-groups of outer rows depth by depth, and
//!   that suspends when a per-depth stack or the result buffer is full
//!   ([`kernel`])
//! - A host re-executor that completes a task exactly where the device left
//!   it ([`fallback`])
//! - The driver that runs the leader and workers, handles out-of-memory
//!   retries, and sweeps unmatched inner rows of right outer joins
//!   ([`driver`])
//! - Group-by pre-aggregation over compiled key and aggregate bytecode
//!   ([`preagg`])
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use xpu_codegen::catalog::{oid, BuiltinCatalog, DevCatalog};
//! # use xpu_codegen::datum::Value;
//! # use xpu_codegen::expr::{Expr, InputRel, TargetEntry};
//! # use xpu_join::driver::GpuJoinBuilder;
//! # use xpu_join::plan::{DepthPlan, JoinPlan, JoinType};
//! # use xpu_join::source::SourceChunk;
//! # use xpu_runtime::runtime::cancel::CancellationToken;
//! # use xpu_runtime::runtime::memory::HostMemService;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let host = Arc::new(BuiltinCatalog::new());
//! let catalog = DevCatalog::new(host.clone());
//! let eq = host.oper_oid("=", oid::INT4, oid::INT4).ok_or("no =")?;
//! let (outer_key, inner_key) = (Expr::var(1, 1, oid::INT4), Expr::var(2, 1, oid::INT4));
//! let plan = JoinPlan {
//!     input_rels: vec![InputRel::Scan { varno: 1 }, InputRel::Scan { varno: 2 }],
//!     scan_quals: vec![],
//!     depths: vec![DepthPlan::hash(
//!         JoinType::Inner,
//!         vec![Expr::op(eq, oid::BOOL, outer_key.clone(), inner_key.clone())],
//!         vec![outer_key],
//!         vec![inner_key],
//!     )],
//!     tlist: vec![TargetEntry::new(Expr::var(2, 2, oid::TEXT), 1)],
//!     params: vec![],
//! };
//!
//! let mem = Arc::new(HostMemService::new(1, 1 << 30));
//! let join = GpuJoinBuilder::new().build(plan, catalog, mem)?;
//! let outer = SourceChunk::from_rows(vec![vec![Some(Value::Int4(1))]]);
//! let inner = vec![vec![Some(Value::Int4(1)), Some(Value::Text("one".into()))]];
//! let output = join.run(&outer, vec![inner], &CancellationToken::new())?;
//! assert_eq!(output.rows.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod device_mem;
pub mod driver;
pub mod error;
pub mod fallback;
pub mod inner_buffer;
pub mod kernel;
pub mod plan;
pub mod preagg;
pub mod source;
pub mod stats;
pub mod tuple;
