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


//! Owned device allocations.
//!
//! Allocations and IPC mappings are released when their owner is dropped,
//! so that an error or a cancellation unwinds without leaking device
//! memory.

use crate::error::Result;
use std::sync::Arc;
use tracing::warn;
use xpu_runtime::runtime::allocator::{Allocator, MemType};
use xpu_runtime::runtime::memory::{MemHandle, MemService};

/// An allocation that is freed on drop
pub struct DeviceAlloc {
    mem: Arc<dyn MemService>,
    handle: MemHandle,
    mem_type: MemType,
    len: usize,
}

impl DeviceAlloc {
    /// Stages `data` on `device`.
    ///
    /// The data is first placed in I/O-mapped memory. If the device is out
    /// of memory, the staging falls back to plain device memory once, which
    /// needs no bounce region.
    pub fn stage(mem: &Arc<dyn MemService>, device: u16, data: &[u8]) -> Result<Self> {
        let (handle, mem_type, len) =
            Allocator::alloc_with_retry(mem.as_ref(), data.len(), MemType::IoMapMem(device), || {
                Ok((MemType::DevMem(device), data.len()))
            })?;
        let alloc = Self {
            mem: mem.clone(),
            handle,
            mem_type,
            len,
        };
        mem.copy_host_to_device(handle, 0, data)?;
        Ok(alloc)
    }

    pub fn handle(&self) -> MemHandle {
        self.handle
    }

    pub fn mem_type(&self) -> MemType {
        self.mem_type
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for DeviceAlloc {
    fn drop(&mut self) {
        if let Err(e) = self.mem.free(self.handle) {
            warn!(handle = ?self.handle, error = %e, "failed to free device memory");
        }
    }
}

/// A mapping of another worker's allocation that is closed on drop
pub struct IpcMapping {
    mem: Arc<dyn MemService>,
    handle: MemHandle,
}

impl IpcMapping {
    /// Maps `alloc` into the calling worker.
    pub fn open(mem: &Arc<dyn MemService>, alloc: &DeviceAlloc) -> Result<Self> {
        let ipc = mem.export_ipc_handle(alloc.handle())?;
        let handle = mem.open_ipc_handle(ipc)?;
        Ok(Self {
            mem: mem.clone(),
            handle,
        })
    }

    pub fn handle(&self) -> MemHandle {
        self.handle
    }
}

impl Drop for IpcMapping {
    fn drop(&mut self) {
        if let Err(e) = self.mem.close_ipc_handle(self.handle) {
            warn!(handle = ?self.handle, error = %e, "failed to close IPC mapping");
        }
    }
}
