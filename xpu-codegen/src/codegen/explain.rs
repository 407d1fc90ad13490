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

//! Human-readable rendering of bytecode for EXPLAIN output.

use crate::catalog::{func_catalog, type_name};
use crate::error::Result;
use crate::kexp::{Bytecode, KexpNode, Payload};
use crate::opcodes::{KexpFlags, OpCode};
use std::fmt::Write;

/// Renders a blob, e.g.
/// `{Func::int4eq(bool) args=[{Var(int4): slot_id=0}, {Const(int4): value='1'}]}`.
pub fn explain(bytecode: &Bytecode) -> Result<String> {
    let mut out = String::new();
    render(&mut out, bytecode.root())?;
    Ok(out)
}

fn render_args(out: &mut String, node: KexpNode<'_>) -> Result<()> {
    out.push_str("args=[");
    for (i, child) in node.children().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        render(out, child)?;
    }
    out.push(']');
    Ok(())
}

fn render(out: &mut String, node: KexpNode<'_>) -> Result<()> {
    let ty = type_name(node.exptype());
    let payload = node.payload()?;
    match (node.opcode(), payload) {
        (OpCode::Const, Payload::Const { value, .. }) => match value {
            Some(v) => write!(out, "{{Const({}): value='{}'}}", ty, v)?,
            None => write!(out, "{{Const({}): value=NULL}}", ty)?,
        },
        (OpCode::Param, Payload::Param { param_id }) => {
            write!(out, "{{Param({}): param_id={}}}", ty, param_id)?;
        }
        (OpCode::Var, Payload::Var(desc)) => {
            write!(out, "{{Var({}): slot_id={}}}", ty, desc.slot_id)?;
        }
        (OpCode::Func(index), _) => {
            let name = func_catalog()
                .get(index as usize)
                .map_or("unknown", |f| f.name.as_str());
            write!(out, "{{Func::{}({}) ", name, ty)?;
            render_args(out, node)?;
            out.push('}');
        }
        (OpCode::LoadVars, Payload::LoadVars { depth, entries }) => {
            let kvars: Vec<String> = entries
                .iter()
                .map(|e| format!("<slot_id={}, resno={}>", e.slot_id, e.resno))
                .collect();
            write!(
                out,
                "{{LoadVars: depth={} kvars=[{}]}}",
                depth,
                kvars.join(", ")
            )?;
        }
        (OpCode::SaveExpr, Payload::SaveExpr { slot_id }) => {
            write!(out, "{{SaveExpr({}): slot_id={} ", ty, slot_id)?;
            render_args(out, node)?;
            out.push('}');
        }
        (OpCode::Projection, Payload::Projection { slots }) => {
            let layout: Vec<String> = slots.iter().map(u32::to_string).collect();
            write!(out, "{{Projection: layout=<{}> ", layout.join(","))?;
            render_args(out, node)?;
            out.push('}');
        }
        (OpCode::Packed, Payload::Packed { offsets }) => {
            out.push_str("{Packed");
            let mut first = true;
            for index in 0..offsets.len() {
                if let Some(item) = node.packed_item(index) {
                    out.push_str(if first { " " } else { ", " });
                    first = false;
                    write!(out, "items[{}]=", index)?;
                    render(out, item)?;
                }
            }
            out.push('}');
        }
        (OpCode::JoinQuals, _) => {
            out.push_str("{JoinQuals: ");
            for (i, child) in node.children().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                if child.flags().contains(KexpFlags::IS_PUSHED_DOWN) {
                    out.push_str("[pushed-down]");
                }
                render(out, child)?;
            }
            out.push('}');
        }
        (OpCode::AggFuncs, Payload::AggFuncs { descs }) => {
            out.push_str("{AggFuncs");
            for desc in &descs {
                let slots: Vec<String> = [desc.arg0, desc.arg1]
                    .iter()
                    .take(desc.action.nargs())
                    .map(|s| format!("slot_id={}", s))
                    .collect();
                if slots.is_empty() {
                    write!(out, " <{}>,", desc.action.name())?;
                } else {
                    write!(out, " <{}[{}]>,", desc.action.name(), slots.join(", "))?;
                }
            }
            out.push(' ');
            render_args(out, node)?;
            out.push('}');
        }
        (opcode, _) => {
            write!(out, "{{{} ", opcode.name())?;
            render_args(out, node)?;
            out.push('}');
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kexp::KexpWriter;
    use crate::opcodes::TypeOpCode;

    #[test]
    fn render_null_const() {
        let mut w = KexpWriter::new();
        let mark = w.begin(TypeOpCode::Int8, OpCode::Const, KexpFlags::empty());
        w.put_payload(&Payload::Const {
            type_oid: crate::catalog::oid::INT8,
            value: None,
        });
        w.finish(mark, 0).unwrap();
        let bc = w.into_bytecode().unwrap();
        assert_eq!(explain(&bc).unwrap(), "{Const(int8): value=NULL}");
    }
}
