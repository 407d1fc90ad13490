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


use serde_derive::Serialize;
use structopt::clap::arg_enum;
use xpu_join::plan::JoinType;

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq)]
    pub enum ArgDataSet {
        Blanas,
        Kim,
        Test,
        Custom,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgJoinType {
        Inner,
        Left,
        Right,
        Full,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgJoinMethod {
        Hash,
        NestLoop,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgExecutionMethod {
        Cpu,
        Gpu,
        Het,
    }
}

impl From<ArgJoinType> for JoinType {
    fn from(join_type: ArgJoinType) -> Self {
        match join_type {
            ArgJoinType::Inner => JoinType::Inner,
            ArgJoinType::Left => JoinType::Left,
            ArgJoinType::Right => JoinType::Right,
            ArgJoinType::Full => JoinType::Full,
        }
    }
}
