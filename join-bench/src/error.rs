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


use datagen::error::Error as DatagenError;
use error_chain::error_chain;

error_chain! {
    errors {
        InvalidArgument(msg: String) {
            description("Invalid argument error")
            display("Aborted with: {}", msg)
        }
        LogicError(msg: String) {
            description("Logic error")
            display("Aborting with: {}", msg)
        }
    }

    links {
        Runtime(xpu_runtime::error::Error, xpu_runtime::error::ErrorKind);
        Codegen(xpu_codegen::error::Error, xpu_codegen::error::ErrorKind);
        Join(xpu_join::error::Error, xpu_join::error::ErrorKind);
    }

    foreign_links {
        Csv(csv::Error);
        Datagen(DatagenError);
        Io(::std::io::Error);
    }
}
