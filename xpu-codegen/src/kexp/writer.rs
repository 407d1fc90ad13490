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
    maxalign, trailer_magic, Bytecode, Payload, KEXP_HEADER_SZ, KEXP_TRAILER_SZ, MAXALIGN,
};
use crate::error::{ErrorKind, Result};
use crate::opcodes::{KexpFlags, OpCode, TypeOpCode};
use crc32fast::Hasher;
use std::convert::TryFrom;

/// An open node of a `KexpWriter`
#[derive(Debug)]
pub struct NodeMark {
    start: usize,
    args_offset: Option<usize>,
}

impl NodeMark {
    pub fn start(&self) -> usize {
        self.start
    }
}

/// Appends bytecode nodes to a growable buffer
///
/// A node is opened with `begin`, followed by its payload. `start_args` ends
/// the payload. Children are emitted as nested nodes. `finish` pads the node,
/// appends the trailer, and back-patches the length into the header.
#[derive(Debug, Default)]
pub struct KexpWriter {
    buf: Vec<u8>,
}

impl KexpWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn begin(&mut self, exptype: TypeOpCode, opcode: OpCode, flags: KexpFlags) -> NodeMark {
        debug_assert_eq!(self.buf.len() % MAXALIGN, 0);
        let start = self.buf.len();
        self.put_u32(0);
        self.put_u16(exptype.to_u16());
        self.put_u16(opcode.to_u16());
        self.put_u32(flags.bits());
        self.put_u32(0);
        self.put_u32(0);
        self.put_u32(0);
        NodeMark {
            start,
            args_offset: None,
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn patch_u32(&mut self, pos: usize, value: u32) {
        self.buf[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn pad_to(&mut self, len: usize) {
        self.buf.resize(len, 0);
    }

    /// Appends a payload.
    pub fn put_payload(&mut self, payload: &Payload) {
        match payload {
            Payload::None => {}
            Payload::Const { type_oid, value } => {
                self.put_u32(*type_oid);
                self.put_u8(value.is_none() as u8);
                self.put_bytes(&[0; 3]);
                if let Some(value) = value {
                    value.encode(&mut self.buf);
                }
            }
            Payload::Param { param_id } => self.put_u32(*param_id),
            Payload::Var(desc) => {
                self.put_u32(desc.slot_id);
                self.put_i16(desc.typlen);
                self.put_u8(desc.typbyval as u8);
                self.put_u8(desc.typalign);
            }
            Payload::LoadVars { depth, entries } => {
                self.put_i32(*depth);
                self.put_u32(entries.len() as u32);
                for entry in entries {
                    self.put_i32(entry.resno);
                    self.put_u32(entry.slot_id);
                    self.put_u32(entry.slot_off);
                }
            }
            Payload::SaveExpr { slot_id } => self.put_u32(*slot_id),
            Payload::Projection { slots } => {
                self.put_u32(slots.len() as u32);
                slots.iter().for_each(|s| self.put_u32(*s));
            }
            Payload::Packed { offsets } => {
                self.put_u32(offsets.len() as u32);
                offsets.iter().for_each(|o| self.put_u32(*o));
            }
            Payload::AggFuncs { descs } => {
                self.put_u32(descs.len() as u32);
                for desc in descs {
                    self.put_u16(desc.action.to_u16());
                    self.put_u16(0);
                    self.put_i32(desc.arg0);
                    self.put_i32(desc.arg1);
                }
            }
        }
    }

    /// Ends the payload of the node; children follow.
    pub fn start_args(&mut self, mark: &mut NodeMark) {
        if mark.args_offset.is_none() {
            let aligned = maxalign(self.buf.len());
            self.pad_to(aligned);
            mark.args_offset = Some(aligned - mark.start);
        }
    }

    /// Closes the node and returns its length.
    pub fn finish(&mut self, mut mark: NodeMark, nr_args: u32) -> Result<usize> {
        self.start_args(&mut mark);
        let args_offset = mark.args_offset.unwrap_or(KEXP_HEADER_SZ);
        let start = mark.start;

        while (self.buf.len() - start + KEXP_TRAILER_SZ) % MAXALIGN != 0 {
            self.buf.push(0);
        }
        let len = self.buf.len() - start + KEXP_TRAILER_SZ;
        let len32 = u32::try_from(len).map_err(|_| {
            ErrorKind::InvalidArgument(format!("kernel expression of {} bytes is too large", len))
        })?;
        self.patch_u32(start, len32);
        self.patch_u32(start + 12, nr_args);
        self.patch_u32(start + 16, args_offset as u32);

        let mut hasher = Hasher::new();
        hasher.update(&self.buf[start..start + args_offset]);
        let exptype = u16::from_le_bytes([self.buf[start + 4], self.buf[start + 5]]);
        let opcode = u16::from_le_bytes([self.buf[start + 6], self.buf[start + 7]]);
        self.put_u32(trailer_magic(exptype, opcode, hasher.finalize()));
        Ok(len)
    }

    /// Discards everything written after `pos`.
    pub fn truncate(&mut self, pos: usize) {
        self.buf.truncate(pos);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Validates the written tree.
    pub fn into_bytecode(self) -> Result<Bytecode> {
        Bytecode::from_bytes(self.buf)
    }
}
