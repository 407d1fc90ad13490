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

use error_chain::error_chain;

error_chain! {
    errors {
        InvalidArgument(msg: String) {
            description("Invalid argument error")
            display("Aborted with: {}", msg)
        }
        IntegerOverflow(msg: String) {
            description("Integer overflow error")
            display("Aborted with: {}", msg)
        }
        LogicError(msg: String) {
            description("Logic error")
            display("Aborting with: {}", msg)
        }
        RuntimeError(msg: String) {
            description("Runtime error")
            display("Aborting with: {}", msg)
        }
        OutOfMemory(msg: String) {
            description("Device memory exhausted")
            display("Out of device memory: {}", msg)
        }
        Cancelled {
            description("Query cancelled")
            display("Canceling statement due to user request")
        }
    }

    foreign_links {
        Io(::std::io::Error);
        RayonThreadPoolBuild(rayon::ThreadPoolBuildError);
    }
}

impl Error {
    /// Returns `true` if the error reports device memory exhaustion.
    pub fn is_out_of_memory(&self) -> bool {
        match self.kind() {
            ErrorKind::OutOfMemory(_) => true,
            _ => false,
        }
    }

    /// Returns `true` if the error reports a query cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self.kind() {
            ErrorKind::Cancelled => true,
            _ => false,
        }
    }
}
