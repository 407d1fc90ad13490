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
    errors {
        Unsupported(msg: String) {
            description("Not supported on device")
            display("Not supported on device: {}", msg)
        }
        Corrupted(msg: String) {
            description("Corrupted kernel expression")
            display("Corrupted kernel expression: {}", msg)
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

    foreign_links {
        Fmt(::std::fmt::Error);
    }
}

impl Error {
    /// Returns `true` if compilation failed because a type, function, or
    /// expression kind has no device translation.
    pub fn is_unsupported(&self) -> bool {
        match self.kind() {
            ErrorKind::Unsupported(_) => true,
            _ => false,
        }
    }

    /// Returns `true` if a bytecode blob failed a structural check.
    pub fn is_corrupted(&self) -> bool {
        match self.kind() {
            ErrorKind::Corrupted(_) => true,
            _ => false,
        }
    }
}
