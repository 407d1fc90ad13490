// Copyright 2018-2022 Clemens Lutz
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

//! # The XPU Runtime
//!
//! `xpu-runtime` provides the resources that the join engine acquires and
//! releases, but does not reason about:
//!
//! - A device-memory service with `alloc`/`free`/`copy` and IPC handles
//!   ([`runtime::memory`])
//! - Placement-aware allocation with a single reduced-footprint retry
//!   ([`runtime::allocator`])
//! - A morsel dispatcher and a heterogeneous worker pool
//!   ([`runtime::dispatcher`])
//! - A preload latch and a one-shot colocation barrier
//!   ([`runtime::sync`])
//! - Query cancellation ([`runtime::cancel`])

pub mod error;
pub mod runtime;
pub mod utils;
