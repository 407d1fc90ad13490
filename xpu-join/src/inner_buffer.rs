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


//! The inner multi-relation buffer.
//!
//! The leader pulls the rows of every inner depth, stores each depth in a
//! kernel data store (see [`kds`]), and concatenates the stores into one
//! relocatable image. The image is replicated to every device before the
//! first join kernel launches, and read-only afterwards. The only mutable
//! shared state are the outer-join maps.
//!
//! ```text
//! 0    u64  length
//! 8    u32  nrels
//! 12   u32  reserved
//! 16   chunk[nrels]: u64 kds_offset, u32 flags, u32 nitems
//!      kds of depth 1, ..., kds of depth nrels (8-byte aligned)
//! ```

pub mod kds;
pub mod ojmap;
pub mod registry;

pub use kds::{KdsFormat, KdsView};
pub use ojmap::OuterJoinMaps;
pub use registry::InnerBufferRegistry;

use self::kds::{KdsBuilder, KdsPolicy};
use crate::device_mem::{DeviceAlloc, IpcMapping};
use crate::error::{ErrorKind, Result};
use crate::plan::{JoinPlan, JoinType};
use crate::tuple::{align8, read_u32, read_u64, write_u32, write_u64};
use bitflags::bitflags;
use std::sync::Arc;
use tracing::{debug, info};
use xpu_codegen::catalog::hash::hash_keys;
use xpu_codegen::catalog::DevCatalog;
use xpu_codegen::datum::{Datum, Row};
use xpu_codegen::host_eval::{HostEnv, HostEvaluator};
use xpu_runtime::runtime::allocator::MemType;
use xpu_runtime::runtime::cancel::CancellationToken;
use xpu_runtime::runtime::memory::{MemHandle, MemService};
use xpu_runtime::runtime::sync::ColocationBarrier;

const KMRELS_HEADER_SZ: usize = 16;
const KMRELS_CHUNK_SZ: usize = 16;

/// Default initial length of a store
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
/// Default growth factor of a store
pub const DEFAULT_GROWTH_FACTOR: f64 = 1.5;
/// Gaps larger than this are closed after loading
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 32 * 1024;

bitflags! {
    /// Properties of an inner depth
    pub struct ChunkFlags: u32 {
        const NESTLOOP = 0b001;
        const LEFT_OUTER = 0b010;
        const RIGHT_OUTER = 0b100;
    }
}

/// An inner depth as seen by a kernel
#[derive(Clone, Copy)]
pub struct InnerChunk<'a> {
    pub flags: ChunkFlags,
    pub kds: KdsView<'a>,
}

/// A read-only view of a multi-relation image
pub struct KmrelsView<'a> {
    chunks: Vec<InnerChunk<'a>>,
}

impl<'a> KmrelsView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let length = read_u64(bytes, 0)? as usize;
        let nrels = read_u32(bytes, 8)? as usize;
        if length > bytes.len() {
            Err(ErrorKind::LogicError(format!(
                "inner buffer of {} bytes exceeds its image of {} bytes",
                length,
                bytes.len()
            )))?;
        }
        let mut chunks = Vec::with_capacity(nrels);
        for i in 0..nrels {
            let pos = KMRELS_HEADER_SZ + KMRELS_CHUNK_SZ * i;
            let offset = read_u64(bytes, pos)? as usize;
            let flags = ChunkFlags::from_bits(read_u32(bytes, pos + 8)?).ok_or_else(|| {
                ErrorKind::LogicError(format!("invalid flags of inner depth {}", i + 1))
            })?;
            let kds_bytes = bytes.get(offset..length).ok_or_else(|| {
                ErrorKind::LogicError(format!("inner depth {} beyond the buffer", i + 1))
            })?;
            chunks.push(InnerChunk {
                flags,
                kds: KdsView::new(kds_bytes)?,
            });
        }
        Ok(Self { chunks })
    }

    /// Number of inner depths.
    pub fn nrels(&self) -> usize {
        self.chunks.len()
    }

    /// Inner depth `depth`, counting from 1.
    pub fn chunk(&self, depth: usize) -> Result<InnerChunk<'a>> {
        depth
            .checked_sub(1)
            .and_then(|d| self.chunks.get(d))
            .copied()
            .ok_or_else(|| {
                ErrorKind::LogicError(format!("inner depth {} does not exist", depth)).into()
            })
    }
}

/// Summary of an inner depth
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InnerDepth {
    pub join_type: JoinType,
    pub format: KdsFormat,
    pub nitems: usize,
    /// Rows skipped because all their join keys are NULL
    pub skipped: usize,
    pub length: usize,
    pub expansions: usize,
}

struct Replica {
    device: u16,
    alloc: DeviceAlloc,
}

/// The inner relations of a join, ready to be probed
pub struct InnerBuffer {
    kmrels: Vec<u8>,
    depths: Vec<InnerDepth>,
    ojmaps: OuterJoinMaps,
    replicas: Vec<Replica>,
    mem: Option<Arc<dyn MemService>>,
    colocation: ColocationBarrier,
}

impl InnerBuffer {
    /// The host image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.kmrels
    }

    pub fn len(&self) -> usize {
        self.kmrels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depths.iter().all(|d| d.nitems == 0)
    }

    pub fn view(&self) -> Result<KmrelsView<'_>> {
        KmrelsView::new(&self.kmrels)
    }

    pub fn ndepths(&self) -> usize {
        self.depths.len()
    }

    /// Summary of inner depth `depth`, counting from 1.
    pub fn depth(&self, depth: usize) -> Option<&InnerDepth> {
        depth.checked_sub(1).and_then(|d| self.depths.get(d))
    }

    pub fn ojmaps(&self) -> &OuterJoinMaps {
        &self.ojmaps
    }

    /// Returns `true` if the join cannot produce any row: some depth is
    /// empty and not left outer, and every deeper depth is an inner join.
    pub fn produces_no_rows(&self) -> bool {
        for depth in self.depths.iter().rev() {
            if depth.nitems == 0 && !depth.join_type.is_left_outer() {
                return true;
            }
            if depth.join_type != JoinType::Inner {
                break;
            }
        }
        false
    }

    /// Replicates the image to every device in `devices`.
    pub fn upload(&mut self, mem: &Arc<dyn MemService>, devices: &[u16]) -> Result<()> {
        for &device in devices {
            if self.replicas.iter().any(|r| r.device == device) {
                continue;
            }
            let alloc = DeviceAlloc::stage(mem, device, &self.kmrels)?;
            debug!(device, length = self.kmrels.len(), mem_type = ?alloc.mem_type(), "inner buffer replicated");
            self.replicas.push(Replica { device, alloc });
        }
        self.mem = Some(mem.clone());
        Ok(())
    }

    fn replica(&self, device: u16) -> Result<&Replica> {
        self.replicas
            .iter()
            .find(|r| r.device == device)
            .ok_or_else(|| {
                ErrorKind::InvalidArgument(format!(
                    "inner buffer is not replicated to device {}",
                    device
                ))
                .into()
            })
    }

    /// Handle of the replica on `device`.
    pub fn replica_handle(&self, device: u16) -> Result<MemHandle> {
        Ok(self.replica(device)?.alloc.handle())
    }

    /// Placement of the replica on `device`.
    pub fn replica_mem_type(&self, device: u16) -> Result<MemType> {
        Ok(self.replica(device)?.alloc.mem_type())
    }

    /// Maps the replica on `device` into a worker.
    pub fn attach(&self, device: u16) -> Result<IpcMapping> {
        let replica = self.replica(device)?;
        let mem = self.mem.as_ref().ok_or_else(|| {
            ErrorKind::LogicError("inner buffer was never uploaded".to_string())
        })?;
        IpcMapping::open(mem, &replica.alloc)
    }

    /// Merges the per-device outer-join maps into the host copy, once
    /// among all callers.
    pub fn colocate_outer_join_maps(&self, cancel: &CancellationToken) -> Result<bool> {
        let merged = self.colocation.run_once(cancel, || {
            self.ojmaps.merge();
            Ok(())
        })?;
        if merged {
            debug!("outer-join maps colocated");
        }
        Ok(merged)
    }

    /// Requires another merge before the next read, e.g., after a sweep set
    /// bits of deeper depths.
    pub fn rearm_colocation(&self) {
        self.colocation.rearm();
    }
}

/// Builds an `InnerBuffer`
#[derive(Clone, Debug)]
pub struct InnerBufferBuilder {
    initial_chunk_size: usize,
    growth_factor: f64,
    compaction_threshold: usize,
    max_kds_len: usize,
    num_devices: usize,
}

impl InnerBufferBuilder {
    pub fn new() -> Self {
        Self {
            initial_chunk_size: DEFAULT_CHUNK_SIZE,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            max_kds_len: u32::max_value() as usize,
            num_devices: 1,
        }
    }

    pub fn initial_chunk_size(mut self, bytes: usize) -> Self {
        self.initial_chunk_size = bytes;
        self
    }

    pub fn growth_factor(mut self, factor: f64) -> Self {
        self.growth_factor = factor;
        self
    }

    pub fn compaction_threshold(mut self, bytes: usize) -> Self {
        self.compaction_threshold = bytes;
        self
    }

    /// Limits the length of a single store. The limit cannot exceed the
    /// 32-bit offset range.
    pub fn max_kds_len(mut self, bytes: usize) -> Self {
        self.max_kds_len = bytes;
        self
    }

    /// Number of devices that keep an outer-join map copy.
    pub fn num_devices(mut self, num_devices: usize) -> Self {
        self.num_devices = num_devices;
        self
    }

    fn policy(&self) -> Result<KdsPolicy> {
        if !(self.growth_factor > 1.0) {
            Err(ErrorKind::InvalidArgument(format!(
                "growth factor {} must be greater than 1",
                self.growth_factor
            )))?;
        }
        if self.max_kds_len > u32::max_value() as usize {
            Err(ErrorKind::InvalidArgument(format!(
                "store limit of {} bytes exceeds the 32-bit offset range",
                self.max_kds_len
            )))?;
        }
        Ok(KdsPolicy {
            initial_len: self.initial_chunk_size,
            growth_factor: self.growth_factor,
            compaction_threshold: self.compaction_threshold,
            max_len: self.max_kds_len,
        })
    }

    /// Loads the rows of every inner depth of `plan`.
    ///
    /// `inners[d - 1]` yields the rows of depth `d`.
    pub fn build<I>(self, plan: &JoinPlan, catalog: &DevCatalog, inners: Vec<I>) -> Result<InnerBuffer>
    where
        I: IntoIterator<Item = Row>,
    {
        plan.validate()?;
        if inners.len() != plan.ndepths() {
            Err(ErrorKind::InvalidArgument(format!(
                "{} inner relations given for {} depths",
                inners.len(),
                plan.ndepths()
            )))?;
        }
        let policy = self.policy()?;
        let evaluator = HostEvaluator::new(catalog);

        let mut stores = Vec::with_capacity(inners.len());
        let mut depths = Vec::with_capacity(inners.len());
        for (i, rows) in inners.into_iter().enumerate() {
            let depth = i + 1;
            let depth_plan = &plan.depths[i];
            let format = if depth_plan.is_hash_join() {
                KdsFormat::Hash
            } else {
                KdsFormat::Row
            };
            let mut builder = KdsBuilder::new(format, policy)?;
            let mut skipped = 0;

            for row in rows {
                let hash = if depth_plan.is_hash_join() {
                    let (hash, all_null) = inner_hash(&evaluator, plan, depth, &row)?;
                    let unmatched_is_dropped = depth_plan.join_type == JoinType::Inner
                        || depth_plan.join_type == JoinType::Left;
                    if all_null && unmatched_is_dropped {
                        skipped += 1;
                        continue;
                    }
                    hash
                } else {
                    0
                };
                builder.insert(&row, hash)?;
            }

            let nitems = builder.nitems();
            let expansions = builder.expansions();
            let bytes = builder.finish()?;
            depths.push(InnerDepth {
                join_type: depth_plan.join_type,
                format,
                nitems,
                skipped,
                length: bytes.len(),
                expansions,
            });
            stores.push(bytes);
        }

        let mut kmrels = vec![0; align8(KMRELS_HEADER_SZ + KMRELS_CHUNK_SZ * stores.len())];
        for (i, store) in stores.iter().enumerate() {
            let pos = KMRELS_HEADER_SZ + KMRELS_CHUNK_SZ * i;
            let offset = kmrels.len();
            let join_type = depths[i].join_type;
            let mut flags = ChunkFlags::empty();
            if depths[i].format == KdsFormat::Row {
                flags |= ChunkFlags::NESTLOOP;
            }
            if join_type.is_left_outer() {
                flags |= ChunkFlags::LEFT_OUTER;
            }
            if join_type.is_right_outer() {
                flags |= ChunkFlags::RIGHT_OUTER;
            }
            write_u64(&mut kmrels, pos, offset as u64);
            write_u32(&mut kmrels, pos + 8, flags.bits());
            write_u32(&mut kmrels, pos + 12, depths[i].nitems as u32);
            kmrels.extend_from_slice(store);
            kmrels.resize(align8(kmrels.len()), 0);
        }
        let length = kmrels.len() as u64;
        write_u64(&mut kmrels, 0, length);
        write_u32(&mut kmrels, 8, stores.len() as u32);

        let ojmaps = OuterJoinMaps::new(
            self.num_devices,
            &depths
                .iter()
                .map(|d| (d.join_type.is_right_outer(), d.nitems))
                .collect::<Vec<_>>(),
        );
        for (i, d) in depths.iter().enumerate() {
            info!(
                depth = i + 1,
                nitems = d.nitems,
                skipped = d.skipped,
                length = d.length,
                expansions = d.expansions,
                "inner depth loaded"
            );
        }

        Ok(InnerBuffer {
            kmrels,
            depths,
            ojmaps,
            replicas: Vec::new(),
            mem: None,
            colocation: ColocationBarrier::new(),
        })
    }
}

impl Default for InnerBufferBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Hashes the inner keys of `row` at `depth` on the host.
fn inner_hash(
    evaluator: &HostEvaluator<'_>,
    plan: &JoinPlan,
    depth: usize,
    row: &[Datum],
) -> Result<(u32, bool)> {
    let mut rows: Vec<Option<&[Datum]>> = vec![None; plan.ndepths() + 1];
    rows[depth] = Some(row);
    let env = HostEnv {
        input_rels: &plan.input_rels,
        rows: &rows,
        params: &plan.params,
    };
    let keys = plan.depths[depth - 1]
        .inner_keys
        .iter()
        .map(|k| evaluator.eval(k, &env))
        .collect::<std::result::Result<Vec<Datum>, _>>()
        .map_err(|e| ErrorKind::ExecutionError(format!("inner hash key of depth {}: {}", depth, e)))?;
    Ok(hash_keys(keys.iter().map(Option::as_ref)))
}
