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

use super::{
    trailer_magic, AggDesc, KexpTree, LoadEntry, Payload, VarDesc, KEXP_HEADER_SZ,
    KEXP_MIN_LEN, KEXP_TRAILER_SZ, MAXALIGN,
};
use crate::datum::Value;
use crate::error::{ErrorKind, Result};
use crate::opcodes::{AggAction, KexpFlags, OpCode, TypeOpCode};
use crc32fast::Hasher;
use std::convert::TryInto;
use std::fmt;

fn corrupted<T>(pos: usize, msg: String) -> Result<T> {
    Err(ErrorKind::Corrupted(format!("node at offset {}: {}", pos, msg)).into())
}

fn get_u32(bytes: &[u8], off: usize) -> Option<u32> {
    bytes
        .get(off..off + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

fn get_u16(bytes: &[u8], off: usize) -> Option<u16> {
    bytes
        .get(off..off + 2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_le_bytes)
}

/// Bounds-checked cursor over a payload
struct PayloadReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    node: usize,
}

impl<'a> PayloadReader<'a> {
    fn u32(&mut self) -> Result<u32> {
        let v = get_u32(self.bytes, self.pos);
        self.pos += 4;
        v.map_or_else(|| corrupted(self.node, "payload underrun".to_string()), Ok)
    }

    fn i32(&mut self) -> Result<i32> {
        self.u32().map(|v| v as i32)
    }

    fn u16(&mut self) -> Result<u16> {
        let v = get_u16(self.bytes, self.pos);
        self.pos += 2;
        v.map_or_else(|| corrupted(self.node, "payload underrun".to_string()), Ok)
    }

    fn u8(&mut self) -> Result<u8> {
        let v = self.bytes.get(self.pos).copied();
        self.pos += 1;
        v.map_or_else(|| corrupted(self.node, "payload underrun".to_string()), Ok)
    }

    /// Reads a count of `elem_size`-byte elements that must fit into the
    /// remaining payload.
    fn count(&mut self, elem_size: usize) -> Result<usize> {
        let n = self.u32()? as usize;
        if n.saturating_mul(elem_size) > self.bytes.len().saturating_sub(self.pos) {
            return corrupted(self.node, format!("{} payload elements overrun payload", n));
        }
        Ok(n)
    }
}

fn parse_payload(node: usize, exptype: TypeOpCode, opcode: OpCode, bytes: &[u8]) -> Result<(Payload, usize)> {
    let mut r = PayloadReader {
        bytes,
        pos: 0,
        node,
    };
    let payload = match opcode {
        OpCode::Const => {
            let type_oid = r.u32()?;
            let isnull = r.u8()?;
            r.pos += 3;
            let value = match isnull {
                0 => {
                    let rest = bytes.get(r.pos..).unwrap_or(&[]);
                    let (value, len) = Value::decode(exptype, rest)?;
                    r.pos += len;
                    Some(value)
                }
                1 => None,
                other => return corrupted(node, format!("invalid isnull flag {}", other)),
            };
            Payload::Const { type_oid, value }
        }
        OpCode::Param => Payload::Param { param_id: r.u32()? },
        OpCode::Var => {
            let slot_id = r.u32()?;
            let typlen = r.u16()? as i16;
            let typbyval = r.u8()? != 0;
            let typalign = r.u8()?;
            Payload::Var(VarDesc {
                slot_id,
                typlen,
                typbyval,
                typalign,
            })
        }
        OpCode::LoadVars => {
            let depth = r.i32()?;
            let n = r.count(12)?;
            let mut entries = Vec::with_capacity(n);
            for _ in 0..n {
                entries.push(LoadEntry {
                    resno: r.i32()?,
                    slot_id: r.u32()?,
                    slot_off: r.u32()?,
                });
            }
            Payload::LoadVars { depth, entries }
        }
        OpCode::SaveExpr => Payload::SaveExpr { slot_id: r.u32()? },
        OpCode::Projection => {
            let n = r.count(4)?;
            let slots = (0..n).map(|_| r.u32()).collect::<Result<Vec<_>>>()?;
            Payload::Projection { slots }
        }
        OpCode::Packed => {
            let n = r.count(4)?;
            let offsets = (0..n).map(|_| r.u32()).collect::<Result<Vec<_>>>()?;
            Payload::Packed { offsets }
        }
        OpCode::AggFuncs => {
            let n = r.count(12)?;
            let mut descs = Vec::with_capacity(n);
            for _ in 0..n {
                let code = r.u16()?;
                let action = match AggAction::from_u16(code) {
                    Some(a) => a,
                    None => return corrupted(node, format!("unknown aggregate action {}", code)),
                };
                r.u16()?;
                descs.push(AggDesc {
                    action,
                    arg0: r.i32()?,
                    arg1: r.i32()?,
                });
            }
            Payload::AggFuncs { descs }
        }
        _ => Payload::None,
    };
    if r.pos > bytes.len() {
        return corrupted(node, "payload underrun".to_string());
    }
    Ok((payload, r.pos))
}

/// A validated bytecode blob
///
/// Construction walks the whole tree once and checks every node: bounds,
/// alignment, the trailer, zero padding, the payload, and that the number of
/// children found by walking lengths equals `nr_args`. Readers can therefore
/// trust every node reachable from `root()`.
#[derive(Clone, PartialEq, Eq)]
pub struct Bytecode {
    bytes: Vec<u8>,
}

impl Bytecode {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let len = validate_node(&bytes, 0, bytes.len())?;
        if len != bytes.len() {
            return corrupted(0, format!("root length {} differs from blob length {}", len, bytes.len()));
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn root(&self) -> KexpNode<'_> {
        KexpNode {
            blob: &self.bytes,
            pos: 0,
        }
    }

    /// Node offsets in pre-order, found by advancing over siblings by
    /// their length.
    pub fn node_offsets_by_length(&self) -> Vec<usize> {
        fn visit(node: KexpNode<'_>, out: &mut Vec<usize>) {
            out.push(node.offset());
            let end = node.offset() + node.len() - KEXP_TRAILER_SZ;
            let mut pos = node.offset() + node.args_offset();
            while pos + KEXP_MIN_LEN <= end && get_u32(node.blob, pos).unwrap_or(0) != 0 {
                let child = KexpNode {
                    blob: node.blob,
                    pos,
                };
                pos += child.len();
                visit(child, out);
            }
        }
        let mut out = Vec::new();
        visit(self.root(), &mut out);
        out
    }

    /// Node offsets in pre-order, found by descending into exactly
    /// `nr_args` children of every node.
    pub fn node_offsets_by_args(&self) -> Vec<usize> {
        fn visit(node: KexpNode<'_>, out: &mut Vec<usize>) {
            out.push(node.offset());
            let mut pos = node.offset() + node.args_offset();
            for _ in 0..node.nr_args() {
                let child = KexpNode {
                    blob: node.blob,
                    pos,
                };
                pos += child.len();
                visit(child, out);
            }
        }
        let mut out = Vec::new();
        visit(self.root(), &mut out);
        out
    }

    /// Decodes the whole tree.
    pub fn decode(&self) -> Result<KexpTree> {
        self.root().decode()
    }
}

impl fmt::Debug for Bytecode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Bytecode")
            .field("len", &self.bytes.len())
            .finish()
    }
}

fn validate_node(blob: &[u8], pos: usize, limit: usize) -> Result<usize> {
    if pos % MAXALIGN != 0 {
        return corrupted(pos, "misaligned node".to_string());
    }
    if pos + KEXP_MIN_LEN > limit {
        return corrupted(pos, "truncated node header".to_string());
    }
    let len = get_u32(blob, pos).unwrap_or(0) as usize;
    if len < KEXP_MIN_LEN || len % MAXALIGN != 0 || pos + len > limit {
        return corrupted(pos, format!("invalid node length {}", len));
    }
    let raw_exptype = get_u16(blob, pos + 4).unwrap_or(0);
    let raw_opcode = get_u16(blob, pos + 6).unwrap_or(0);
    let nr_args = get_u32(blob, pos + 12).unwrap_or(0) as usize;
    let args_offset = get_u32(blob, pos + 16).unwrap_or(0) as usize;
    if get_u32(blob, pos + 20) != Some(0) {
        return corrupted(pos, "reserved header field is not zero".to_string());
    }
    if args_offset < KEXP_HEADER_SZ
        || args_offset % MAXALIGN != 0
        || args_offset > len - KEXP_TRAILER_SZ
    {
        return corrupted(pos, format!("invalid args offset {}", args_offset));
    }

    let mut hasher = Hasher::new();
    hasher.update(&blob[pos..pos + args_offset]);
    let expected = trailer_magic(raw_exptype, raw_opcode, hasher.finalize());
    let trailer_pos = pos + len - KEXP_TRAILER_SZ;
    if get_u32(blob, trailer_pos) != Some(expected) {
        return corrupted(pos, "trailer magic mismatch".to_string());
    }

    let exptype = match TypeOpCode::from_u16(raw_exptype) {
        Some(t) => t,
        None => return corrupted(pos, format!("unknown type opcode {}", raw_exptype)),
    };
    let opcode = match OpCode::from_u16(raw_opcode) {
        Some(o) => o,
        None => return corrupted(pos, format!("unknown opcode {}", raw_opcode)),
    };
    let payload_bytes = &blob[pos + KEXP_HEADER_SZ..pos + args_offset];
    let (payload, consumed) = parse_payload(pos, exptype, opcode, payload_bytes)?;
    if payload_bytes[consumed..].iter().any(|b| *b != 0) {
        return corrupted(pos, "payload overrun into padding".to_string());
    }

    let mut child_offsets = Vec::with_capacity(nr_args);
    let mut cursor = pos + args_offset;
    while cursor + KEXP_MIN_LEN <= trailer_pos && get_u32(blob, cursor).unwrap_or(0) != 0 {
        child_offsets.push((cursor - pos) as u32);
        cursor += validate_node(blob, cursor, trailer_pos)?;
    }
    if blob[cursor..trailer_pos].iter().any(|b| *b != 0) {
        return corrupted(pos, "non-zero padding after arguments".to_string());
    }
    if child_offsets.len() != nr_args {
        return corrupted(
            pos,
            format!(
                "node-count mismatch: header declares {} arguments, found {}",
                nr_args,
                child_offsets.len()
            ),
        );
    }
    if let Payload::Packed { offsets } = &payload {
        let present: Vec<u32> = offsets.iter().copied().filter(|o| *o != 0).collect();
        if present != child_offsets {
            return corrupted(pos, "packed item offsets do not match arguments".to_string());
        }
    }
    Ok(len)
}

/// A node of a validated `Bytecode`
#[derive(Clone, Copy)]
pub struct KexpNode<'a> {
    blob: &'a [u8],
    pos: usize,
}

impl<'a> KexpNode<'a> {
    /// Offset of the node within the blob.
    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        get_u32(self.blob, self.pos).unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn exptype(&self) -> TypeOpCode {
        get_u16(self.blob, self.pos + 4)
            .and_then(TypeOpCode::from_u16)
            .unwrap_or(TypeOpCode::Invalid)
    }

    /// The operation; validated nodes always carry a known opcode.
    pub fn opcode(&self) -> OpCode {
        get_u16(self.blob, self.pos + 6)
            .and_then(OpCode::from_u16)
            .unwrap_or(OpCode::Const)
    }

    pub fn flags(&self) -> KexpFlags {
        KexpFlags::from_bits_truncate(get_u32(self.blob, self.pos + 8).unwrap_or(0))
    }

    pub fn nr_args(&self) -> usize {
        get_u32(self.blob, self.pos + 12).unwrap_or(0) as usize
    }

    pub fn args_offset(&self) -> usize {
        get_u32(self.blob, self.pos + 16).unwrap_or(0) as usize
    }

    /// Raw bytes of the whole node.
    pub fn bytes(&self) -> &'a [u8] {
        &self.blob[self.pos..self.pos + self.len()]
    }

    pub fn payload(&self) -> Result<Payload> {
        let bytes = &self.blob[self.pos + KEXP_HEADER_SZ..self.pos + self.args_offset()];
        parse_payload(self.pos, self.exptype(), self.opcode(), bytes).map(|(p, _)| p)
    }

    /// First word of the payload: the slot of a Var or SaveExpr, the id of
    /// a Param.
    pub fn payload_u32(&self) -> u32 {
        get_u32(self.blob, self.pos + KEXP_HEADER_SZ).unwrap_or(0)
    }

    pub fn children(&self) -> Children<'a> {
        Children {
            blob: self.blob,
            pos: self.pos + self.args_offset(),
            remaining: self.nr_args(),
        }
    }

    pub fn child(&self, index: usize) -> Option<KexpNode<'a>> {
        self.children().nth(index)
    }

    /// Item `index` of a Packed node, or `None` if absent.
    pub fn packed_item(&self, index: usize) -> Option<KexpNode<'a>> {
        if self.opcode() != OpCode::Packed {
            return None;
        }
        let npacked = self.payload_u32() as usize;
        if index >= npacked {
            return None;
        }
        let off = get_u32(self.blob, self.pos + KEXP_HEADER_SZ + 4 + 4 * index)? as usize;
        if off == 0 {
            None
        } else {
            Some(KexpNode {
                blob: self.blob,
                pos: self.pos + off,
            })
        }
    }

    pub fn decode(&self) -> Result<KexpTree> {
        Ok(KexpTree {
            exptype: self.exptype(),
            opcode: self.opcode(),
            flags: self.flags(),
            payload: self.payload()?,
            children: self
                .children()
                .map(|c| c.decode())
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

impl<'a> fmt::Debug for KexpNode<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KexpNode")
            .field("offset", &self.pos)
            .field("opcode", &self.opcode())
            .field("exptype", &self.exptype())
            .field("nr_args", &self.nr_args())
            .finish()
    }
}

/// Iterator over the children of a node
pub struct Children<'a> {
    blob: &'a [u8],
    pos: usize,
    remaining: usize,
}

impl<'a> Iterator for Children<'a> {
    type Item = KexpNode<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let node = KexpNode {
            blob: self.blob,
            pos: self.pos,
        };
        self.remaining -= 1;
        self.pos += node.len();
        Some(node)
    }
}
