/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2022 German Research Center for Artificial Intelligence (DFKI)
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

//! Heterogeneous memory allocator.
//!
//! Presents a consistent interface for allocating memory with specific
//! placement properties through a `MemService`. Examples include allocating
//! device memory, or allocating an I/O-mapped staging region for data that
//! is still read lazily from storage.

use super::memory::{MemHandle, MemService};
use crate::error::Result;
use tracing::warn;

/// Heterogeneous memory allocator.
pub struct Allocator;

/// Memory type specifier
///
/// Some memory types cannot be directly accessed on the host, e.g., DevMem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemType {
    /// System memory allocated with Rust's global allocator
    SysMem,
    /// Page-locked host memory that devices can access via DMA
    PinnedMem,
    /// Device memory on the specified device
    DevMem(u16),
    /// Unified memory that migrates on demand, charged to the specified device
    UniMem(u16),
    /// Device memory mapped for direct I/O on the specified device
    ///
    /// The mapping keeps a bounce region of the same size, thus the
    /// footprint is twice the length.
    IoMapMem(u16),
}

impl MemType {
    /// The device whose capacity the allocation is charged against.
    pub fn device(&self) -> Option<u16> {
        match *self {
            MemType::SysMem | MemType::PinnedMem => None,
            MemType::DevMem(d) | MemType::UniMem(d) | MemType::IoMapMem(d) => Some(d),
        }
    }

    /// Bytes charged for an allocation of `len` bytes.
    pub fn footprint(&self, len: usize) -> usize {
        match self {
            MemType::IoMapMem(_) => len.saturating_mul(2),
            _ => len,
        }
    }
}

impl Allocator {
    /// Allocates memory, retrying once with a reduced footprint.
    ///
    /// If the first allocation fails with out-of-memory, `shrink` is invoked
    /// to release whatever the caller can give up (e.g., by materializing a
    /// lazily staged input in host memory). `shrink` returns the placement and
    /// length for the second attempt. A second failure is returned as-is.
    pub fn alloc_with_retry<F>(
        mem: &dyn MemService,
        len: usize,
        mem_type: MemType,
        shrink: F,
    ) -> Result<(MemHandle, MemType, usize)>
    where
        F: FnOnce() -> Result<(MemType, usize)>,
    {
        match mem.alloc(len, mem_type) {
            Ok(handle) => Ok((handle, mem_type, len)),
            Err(ref e) if e.is_out_of_memory() => {
                let (retry_type, retry_len) = shrink()?;
                warn!(
                    len,
                    ?mem_type,
                    retry_len,
                    ?retry_type,
                    "device memory exhausted, retrying with reduced footprint"
                );
                let handle = mem.alloc(retry_len, retry_type)?;
                Ok((handle, retry_type, retry_len))
            }
            Err(e) => Err(e),
        }
    }

    /// Allocates memory and fills it with `data`.
    pub fn alloc_and_copy(
        mem: &dyn MemService,
        data: &[u8],
        mem_type: MemType,
    ) -> Result<MemHandle> {
        let handle = mem.alloc(data.len(), mem_type)?;
        if let Err(e) = mem.copy_host_to_device(handle, 0, data) {
            mem.free(handle)?;
            return Err(e);
        }
        Ok(handle)
    }
}
