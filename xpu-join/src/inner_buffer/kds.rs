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


//! Kernel data store (KDS) of one inner relation.
//!
//! ```text
//! 0    u32  length      bytes of the store
//! 4    u32  format      1 = row (nested loop), 2 = hash
//! 8    u32  nitems
//! 12   u32  nslots      hash slots, 0 for the row format
//! 16   u32  usage       bytes of the item area at the tail
//! 20   u32  ncols
//! 24   u64  reserved
//! 32   u32  row_index[nitems]   item offsets
//!      u32  hash_slot[nslots]   chain heads, 0 = empty
//!      ...  gap
//!      items, growing backward from `length`
//! ```
//!
//! Every item is `{hash, next, rowid, t_len}` followed by the row image and
//! padding to 8 bytes. All offsets are relative to the store, so the store
//! is copied to a device as is.

use crate::error::{ErrorKind, Result};
use crate::tuple::{align8, decode_row, encode_row, read_u32, write_u32};
use tracing::debug;
use xpu_codegen::datum::{Datum, Row};

pub const KDS_HEADER_SZ: usize = 32;
pub const KDS_ITEM_HEADER_SZ: usize = 16;

/// Physical format of a store
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KdsFormat {
    Row = 1,
    Hash = 2,
}

impl KdsFormat {
    fn from_u32(format: u32) -> Option<Self> {
        match format {
            1 => Some(KdsFormat::Row),
            2 => Some(KdsFormat::Hash),
            _ => None,
        }
    }
}

/// Number of hash slots for `nitems` items.
pub fn hash_nslots(nitems: usize) -> usize {
    nitems + nitems / 2 + 1
}

fn frontend_len(nitems: usize, nslots: usize) -> usize {
    align8(KDS_HEADER_SZ + 4 * nitems + 4 * nslots)
}

/// Growth and compaction policy of a store
#[derive(Clone, Copy, Debug)]
pub struct KdsPolicy {
    pub initial_len: usize,
    pub growth_factor: f64,
    pub compaction_threshold: usize,
    pub max_len: usize,
}

/// A store under construction
pub struct KdsBuilder {
    bytes: Vec<u8>,
    format: KdsFormat,
    nitems: usize,
    usage: usize,
    ncols: Option<usize>,
    policy: KdsPolicy,
    expansions: usize,
}

impl KdsBuilder {
    pub fn new(format: KdsFormat, policy: KdsPolicy) -> Result<Self> {
        let initial_len = align8(policy.initial_len.max(frontend_len(0, 1)));
        if initial_len > policy.max_len {
            Err(ErrorKind::InvalidArgument(format!(
                "initial store length {} exceeds the limit of {} bytes",
                initial_len, policy.max_len
            )))?;
        }
        Ok(Self {
            bytes: vec![0; initial_len],
            format,
            nitems: 0,
            usage: 0,
            ncols: None,
            policy,
            expansions: 0,
        })
    }

    pub fn nitems(&self) -> usize {
        self.nitems
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nitems == 0
    }

    /// Number of times the store grew.
    pub fn expansions(&self) -> usize {
        self.expansions
    }

    fn reserved_nslots(&self, nitems: usize) -> usize {
        match self.format {
            KdsFormat::Row => 0,
            KdsFormat::Hash => hash_nslots(nitems),
        }
    }

    /// Appends a row; `hash` is ignored by the row format.
    pub fn insert(&mut self, row: &[Datum], hash: u32) -> Result<()> {
        match self.ncols {
            None => self.ncols = Some(row.len()),
            Some(n) if n != row.len() => Err(ErrorKind::InvalidArgument(format!(
                "row of {} attributes inserted into a store of {} columns",
                row.len(),
                n
            )))?,
            Some(_) => {}
        }

        let mut item = Vec::with_capacity(KDS_ITEM_HEADER_SZ + 64);
        item.extend_from_slice(&hash.to_le_bytes());
        item.extend_from_slice(&0u32.to_le_bytes());
        item.extend_from_slice(&(self.nitems as u32).to_le_bytes());
        item.extend_from_slice(&0u32.to_le_bytes());
        encode_row(row, &mut item)?;
        let t_len = item.len() - KDS_ITEM_HEADER_SZ;
        write_u32(&mut item, 12, t_len as u32);
        item.resize(align8(item.len()), 0);

        let nitems = self.nitems + 1;
        loop {
            let head = frontend_len(nitems, self.reserved_nslots(nitems));
            if head + self.usage + item.len() <= self.bytes.len() {
                break;
            }
            self.expand()?;
        }

        let len = self.bytes.len();
        let offset = len - self.usage - item.len();
        self.bytes[offset..offset + item.len()].copy_from_slice(&item);
        self.usage += item.len();
        write_u32(&mut self.bytes, KDS_HEADER_SZ + 4 * self.nitems, offset as u32);
        self.nitems = nitems;
        Ok(())
    }

    /// Grows the store and shifts the item area to the new tail.
    fn expand(&mut self) -> Result<()> {
        let len = self.bytes.len();
        if len >= self.policy.max_len {
            Err(ErrorKind::InnerBufferOverflow(format!(
                "store of {} items and {} bytes cannot grow beyond {} bytes",
                self.nitems, len, self.policy.max_len
            )))?;
        }
        let grown = align8((len as f64 * self.policy.growth_factor) as usize).max(len + 8);
        let new_len = grown.min(self.policy.max_len & !7);
        if new_len <= len {
            Err(ErrorKind::InnerBufferOverflow(format!(
                "store of {} bytes reached the limit of {} bytes",
                len, self.policy.max_len
            )))?;
        }
        let shift = new_len - len;

        self.bytes.resize(new_len, 0);
        if self.usage > 0 {
            self.bytes.copy_within(len - self.usage..len, new_len - self.usage);
            for i in 0..self.nitems {
                let pos = KDS_HEADER_SZ + 4 * i;
                let offset = read_u32(&self.bytes, pos)? as usize;
                write_u32(&mut self.bytes, pos, (offset + shift) as u32);
            }
        }
        self.expansions += 1;
        debug!(
            old_len = len,
            new_len,
            nitems = self.nitems,
            "inner store expanded"
        );
        Ok(())
    }

    /// Closes the gap between the front arrays and the item area if it
    /// exceeds the compaction threshold. Returns the bytes reclaimed.
    fn compact(&mut self, nslots: usize) -> Result<usize> {
        let head = frontend_len(self.nitems, nslots);
        let len = self.bytes.len();
        let gap = len - head - self.usage;
        if gap <= self.policy.compaction_threshold {
            return Ok(0);
        }
        self.bytes.copy_within(len - self.usage..len, head);
        for i in 0..self.nitems {
            let pos = KDS_HEADER_SZ + 4 * i;
            let offset = read_u32(&self.bytes, pos)? as usize;
            write_u32(&mut self.bytes, pos, (offset - gap) as u32);
        }
        self.bytes.truncate(head + self.usage);
        Ok(gap)
    }

    /// Completes the store: fixes the hash slots, compacts, and links the
    /// hash chains.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        let nslots = self.reserved_nslots(self.nitems);
        let reclaimed = self.compact(nslots)?;
        let len = self.bytes.len();

        write_u32(&mut self.bytes, 0, len as u32);
        write_u32(&mut self.bytes, 4, self.format as u32);
        write_u32(&mut self.bytes, 8, self.nitems as u32);
        write_u32(&mut self.bytes, 12, nslots as u32);
        write_u32(&mut self.bytes, 16, self.usage as u32);
        write_u32(&mut self.bytes, 20, self.ncols.unwrap_or(0) as u32);

        let slots_pos = KDS_HEADER_SZ + 4 * self.nitems;
        for slot in 0..nslots {
            write_u32(&mut self.bytes, slots_pos + 4 * slot, 0);
        }
        if nslots > 0 {
            for i in 0..self.nitems {
                let item = read_u32(&self.bytes, KDS_HEADER_SZ + 4 * i)? as usize;
                let hash = read_u32(&self.bytes, item)?;
                let slot_pos = slots_pos + 4 * (hash as usize % nslots);
                let head = read_u32(&self.bytes, slot_pos)?;
                write_u32(&mut self.bytes, item + 4, head);
                write_u32(&mut self.bytes, slot_pos, item as u32);
            }
        }

        debug!(
            format = ?self.format,
            nitems = self.nitems,
            nslots,
            length = len,
            reclaimed,
            "inner store built"
        );
        Ok(self.bytes)
    }
}

/// An item of a store
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KdsItem {
    pub offset: u32,
    pub hash: u32,
    pub next: u32,
    pub rowid: u32,
}

/// A read-only view of a finished store
#[derive(Clone, Copy)]
pub struct KdsView<'a> {
    bytes: &'a [u8],
    format: KdsFormat,
    nitems: u32,
    nslots: u32,
}

impl<'a> KdsView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let length = read_u32(bytes, 0)? as usize;
        let format = read_u32(bytes, 4)?;
        let format = KdsFormat::from_u32(format)
            .ok_or_else(|| ErrorKind::LogicError(format!("unknown store format {}", format)))?;
        let nitems = read_u32(bytes, 8)?;
        let nslots = read_u32(bytes, 12)?;
        if length > bytes.len() || frontend_len(nitems as usize, nslots as usize) > length {
            Err(ErrorKind::LogicError(format!(
                "store of {} bytes with {} items and {} slots exceeds its image of {} bytes",
                length,
                nitems,
                nslots,
                bytes.len()
            )))?;
        }
        Ok(Self {
            bytes: &bytes[..length],
            format,
            nitems,
            nslots,
        })
    }

    pub fn format(&self) -> KdsFormat {
        self.format
    }

    pub fn nitems(&self) -> u32 {
        self.nitems
    }

    pub fn nslots(&self) -> u32 {
        self.nslots
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nitems == 0
    }

    /// Offset of item `rowid`.
    pub fn item_offset(&self, rowid: u32) -> Result<u32> {
        if rowid >= self.nitems {
            Err(ErrorKind::LogicError(format!(
                "row {} beyond store of {} items",
                rowid, self.nitems
            )))?;
        }
        read_u32(self.bytes, KDS_HEADER_SZ + 4 * rowid as usize)
    }

    /// Reads the item header at `offset`.
    pub fn item(&self, offset: u32) -> Result<KdsItem> {
        let pos = offset as usize;
        if pos < frontend_len(self.nitems as usize, self.nslots as usize) {
            Err(ErrorKind::LogicError(format!(
                "item offset {} points into the store header",
                offset
            )))?;
        }
        Ok(KdsItem {
            offset,
            hash: read_u32(self.bytes, pos)?,
            next: read_u32(self.bytes, pos + 4)?,
            rowid: read_u32(self.bytes, pos + 8)?,
        })
    }

    /// Decodes the row of the item at `offset`.
    pub fn item_row(&self, offset: u32) -> Result<Row> {
        let pos = offset as usize + KDS_ITEM_HEADER_SZ;
        let image = self.bytes.get(pos..).ok_or_else(|| {
            ErrorKind::LogicError(format!("item offset {} beyond the store", offset))
        })?;
        Ok(decode_row(image)?.0)
    }

    /// Decodes row `rowid`.
    pub fn row(&self, rowid: u32) -> Result<Row> {
        self.item_row(self.item_offset(rowid)?)
    }

    /// Offset of the first item of the chain of `hash`, 0 if the chain is
    /// empty.
    pub fn chain_head(&self, hash: u32) -> Result<u32> {
        if self.format != KdsFormat::Hash || self.nslots == 0 {
            Err(ErrorKind::LogicError(
                "hash probe of a store without hash slots".to_string(),
            ))?;
        }
        let slot = (hash % self.nslots) as usize;
        read_u32(self.bytes, KDS_HEADER_SZ + 4 * self.nitems as usize + 4 * slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xpu_codegen::datum::Value;

    fn policy(initial_len: usize) -> KdsPolicy {
        KdsPolicy {
            initial_len,
            growth_factor: 1.5,
            compaction_threshold: 32 * 1024,
            max_len: u32::max_value() as usize,
        }
    }

    #[test]
    fn growth_rewrites_row_index() {
        let mut builder = KdsBuilder::new(KdsFormat::Row, policy(64)).unwrap();
        for i in 0..100 {
            builder.insert(&[Some(Value::Int4(i))], 0).unwrap();
        }
        assert!(builder.expansions() > 0);
        let bytes = builder.finish().unwrap();
        let kds = KdsView::new(&bytes).unwrap();
        assert_eq!(kds.nitems(), 100);
        for i in 0..100 {
            assert_eq!(kds.row(i as u32).unwrap(), vec![Some(Value::Int4(i))]);
        }
    }

    #[test]
    fn large_gaps_are_compacted() {
        let mut builder = KdsBuilder::new(KdsFormat::Row, policy(128 * 1024)).unwrap();
        builder.insert(&[Some(Value::Int8(1))], 0).unwrap();
        let bytes = builder.finish().unwrap();
        assert!(bytes.len() < 1024);
        assert_eq!(KdsView::new(&bytes).unwrap().row(0).unwrap()[0], Some(Value::Int8(1)));
    }

    #[test]
    fn small_gaps_are_kept() {
        let mut builder = KdsBuilder::new(KdsFormat::Row, policy(16 * 1024)).unwrap();
        builder.insert(&[Some(Value::Int8(1))], 0).unwrap();
        assert_eq!(builder.finish().unwrap().len(), 16 * 1024);
    }

    #[test]
    fn limit_is_a_resource_error() {
        let mut p = policy(64);
        p.max_len = 256;
        let mut builder = KdsBuilder::new(KdsFormat::Row, p).unwrap();
        let err = (0..100)
            .map(|i| builder.insert(&[Some(Value::Int8(i))], 0))
            .find(|r| r.is_err())
            .unwrap()
            .unwrap_err();
        match err.kind() {
            ErrorKind::InnerBufferOverflow(_) => {}
            other => panic!("unexpected error {:?}", other),
        }
    }
}
