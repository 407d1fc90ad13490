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

//! # The XPU Expression Compiler
//!
//! `xpu-codegen` translates relational expressions into kernel expression
//! bytecode that a data-parallel executor interprets without access to the
//! host's catalog. It contains:
//!
//! - A device type/function catalog with a memoizing lookup cache
//!   ([`catalog`])
//! - The datum model shared by the host and the device ([`datum`])
//! - The bytecode format: a writer, a validating reader, and a decoder
//!   ([`kexp`])
//! - The expression compiler and the variable slot allocator ([`codegen`])
//! - Bytecode and host-side expression evaluators ([`interp`],
//!   [`host_eval`])
//!
//! # Bytecode layout
//!
//! A blob is a tree of nodes. Each node carries a 24-byte header, an
//! operation-specific payload, its children, and a 4-byte trailer. Nodes are
//! aligned to 8 bytes, thus siblings can be walked by adding the node length
//! to the current position. The trailer folds a CRC-32 of the node header and
//! payload into a magic number, so that a corrupted node is detected before
//! any of its values are used.

pub mod catalog;
pub mod codegen;
pub mod datum;
pub mod error;
pub mod expr;
pub mod func_ops;
pub mod host_eval;
pub mod interp;
pub mod kexp;
pub mod opcodes;
