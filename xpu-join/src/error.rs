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


use error_chain::error_chain;

error_chain! {
    links {
        Runtime(xpu_runtime::error::Error, xpu_runtime::error::ErrorKind);
        Codegen(xpu_codegen::error::Error, xpu_codegen::error::ErrorKind);
    }

    errors {
        InnerBufferOverflow(msg: String) {
            description("Inner buffer exceeds the offset range")
            display("Inner buffer overflow: {}", msg)
        }
        KernelFault(msg: String) {
            description("Unrecoverable kernel error")
            display("Kernel fault: {}", msg)
        }
        ExecutionError(msg: String) {
            description("Host execution error")
            display("Execution failed: {}", msg)
        }
        InvalidArgument(msg: String) {
            description("Invalid argument error")
            display("Aborted with: {}", msg)
        }
        LogicError(msg: String) {
            description("Logic error")
            display("Aborting with: {}", msg)
        }
    }
}

impl Error {
    /// Returns `true` if the query was cancelled.
    pub fn is_cancelled(&self) -> bool {
        match self.kind() {
            ErrorKind::Runtime(xpu_runtime::error::ErrorKind::Cancelled) => true,
            _ => false,
        }
    }

    /// Returns `true` if device memory was exhausted.
    pub fn is_out_of_memory(&self) -> bool {
        match self.kind() {
            ErrorKind::Runtime(xpu_runtime::error::ErrorKind::OutOfMemory(_)) => true,
            _ => false,
        }
    }

    /// Returns `true` if an expression has no device translation.
    pub fn is_unsupported(&self) -> bool {
        match self.kind() {
            ErrorKind::Codegen(xpu_codegen::error::ErrorKind::Unsupported(_)) => true,
            _ => false,
        }
    }

    /// Returns `true` if a bytecode blob or row image failed a structural
    /// check.
    pub fn is_corrupted(&self) -> bool {
        match self.kind() {
            ErrorKind::Codegen(xpu_codegen::error::ErrorKind::Corrupted(_)) => true,
            _ => false,
        }
    }
}
