// Copyright 2018-2022 Clemens Lutz
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

//! Device memory service.
//!
//! The join engine never touches device memory directly. Instead, it acquires
//! and releases allocations through the `MemService` trait, which mirrors the
//! primitives of a device driver: allocate with a placement hint, free, copy
//! between host and device, and share an allocation between cooperating
//! workers via IPC handles.
//!
//! `HostMemService` implements the trait with host memory. Each emulated
//! device has a fixed capacity, and allocations that exceed it fail with
//! `ErrorKind::OutOfMemory`, exactly as a device driver would.

use super::allocator::MemType;
use crate::error::{ErrorKind, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// An opaque handle to an allocation of a memory service.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct MemHandle {
    id: u64,
    device: Option<u16>,
}

impl MemHandle {
    /// The device that owns the memory, or `None` for host memory.
    pub fn device(&self) -> Option<u16> {
        self.device
    }
}

/// A handle that can be passed to another worker to map the same allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct IpcHandle {
    id: u64,
    device: Option<u16>,
}

/// A device memory service
///
/// Implementations must be thread-safe, because workers share one service.
pub trait MemService: Send + Sync {
    /// Number of devices managed by the service.
    fn num_devices(&self) -> u16;

    /// Allocates `len` bytes with the placement specified by `mem_type`.
    fn alloc(&self, len: usize, mem_type: MemType) -> Result<MemHandle>;

    /// Releases an allocation.
    fn free(&self, handle: MemHandle) -> Result<()>;

    /// Copies `src` into the allocation starting at `offset`.
    fn copy_host_to_device(&self, dst: MemHandle, offset: usize, src: &[u8]) -> Result<()>;

    /// Copies `dst.len()` bytes from the allocation starting at `offset`.
    fn copy_device_to_host(&self, dst: &mut [u8], src: MemHandle, offset: usize) -> Result<()>;

    /// Copies `len` bytes between two allocations.
    fn copy_device_to_device(
        &self,
        dst: MemHandle,
        dst_offset: usize,
        src: MemHandle,
        src_offset: usize,
        len: usize,
    ) -> Result<()>;

    /// Exports an allocation so that another worker can map it.
    fn export_ipc_handle(&self, handle: MemHandle) -> Result<IpcHandle>;

    /// Maps an allocation that another worker exported.
    fn open_ipc_handle(&self, ipc: IpcHandle) -> Result<MemHandle>;

    /// Unmaps an allocation that was mapped with `open_ipc_handle`.
    fn close_ipc_handle(&self, handle: MemHandle) -> Result<()>;
}

/// Shared bytes of an allocation.
pub type SharedBytes = Arc<RwLock<Vec<u8>>>;

struct Allocation {
    bytes: SharedBytes,
    charged: usize,
    mapping_of: Option<u64>,
}

struct Arena {
    capacity: usize,
    used: AtomicUsize,
    allocations: Mutex<HashMap<u64, Allocation>>,
}

impl Arena {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: AtomicUsize::new(0),
            allocations: Mutex::new(HashMap::new()),
        }
    }

    fn charge(&self, len: usize) -> bool {
        let mut used = self.used.load(Ordering::SeqCst);
        loop {
            let new_used = match used.checked_add(len) {
                Some(n) if n <= self.capacity => n,
                _ => return false,
            };
            match self
                .used
                .compare_exchange(used, new_used, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(current) => used = current,
            }
        }
    }

    fn uncharge(&self, len: usize) {
        self.used.fetch_sub(len, Ordering::SeqCst);
    }
}

/// A memory service backed by host memory
///
/// Device allocations are charged against a per-device capacity. Host
/// allocations (`SysMem`, `PinnedMem`) are unlimited.
pub struct HostMemService {
    host: Arena,
    devices: Vec<Arena>,
    next_id: AtomicU64,
}

impl HostMemService {
    /// Creates a service with `num_devices` devices of `device_capacity`
    /// bytes each.
    pub fn new(num_devices: u16, device_capacity: usize) -> Self {
        let devices = (0..num_devices)
            .map(|_| Arena::new(device_capacity))
            .collect();

        Self {
            host: Arena::new(usize::max_value()),
            devices,
            next_id: AtomicU64::new(1),
        }
    }

    /// Bytes currently charged against `device`.
    pub fn used_bytes(&self, device: u16) -> Result<usize> {
        Ok(self.arena(Some(device))?.used.load(Ordering::SeqCst))
    }

    /// Number of live allocations and mappings on `device`, or on the host
    /// for `None`.
    pub fn live_allocations(&self, device: Option<u16>) -> Result<usize> {
        let arena = self.arena(device)?;
        let allocations = arena
            .allocations
            .lock()
            .map_err(|_| ErrorKind::LogicError("Memory service lock poisoned".to_string()))?;
        Ok(allocations.len())
    }

    /// Maps the bytes of an allocation into the caller's address space.
    ///
    /// This is the view an emulated kernel uses to read device memory.
    pub fn mapped(&self, handle: MemHandle) -> Result<SharedBytes> {
        self.with_allocation(handle, |a| Ok(a.bytes.clone()))
    }

    fn arena(&self, device: Option<u16>) -> Result<&Arena> {
        match device {
            None => Ok(&self.host),
            Some(d) => self.devices.get(d as usize).ok_or_else(|| {
                ErrorKind::InvalidArgument(format!("Device {} does not exist", d)).into()
            }),
        }
    }

    fn with_allocation<F, R>(&self, handle: MemHandle, f: F) -> Result<R>
    where
        F: FnOnce(&Allocation) -> Result<R>,
    {
        let arena = self.arena(handle.device)?;
        let allocations = arena
            .allocations
            .lock()
            .map_err(|_| ErrorKind::LogicError("Memory service lock poisoned".to_string()))?;
        let allocation = allocations.get(&handle.id).ok_or_else(|| {
            ErrorKind::InvalidArgument(format!("Unknown memory handle {:?}", handle))
        })?;
        f(allocation)
    }

    fn insert(&self, device: Option<u16>, allocation: Allocation) -> Result<MemHandle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let arena = self.arena(device)?;
        arena
            .allocations
            .lock()
            .map_err(|_| ErrorKind::LogicError("Memory service lock poisoned".to_string()))?
            .insert(id, allocation);
        Ok(MemHandle { id, device })
    }

    fn remove(&self, handle: MemHandle) -> Result<()> {
        let arena = self.arena(handle.device)?;
        let mut allocations = arena
            .allocations
            .lock()
            .map_err(|_| ErrorKind::LogicError("Memory service lock poisoned".to_string()))?;
        let allocation = allocations.remove(&handle.id).ok_or_else(|| {
            ErrorKind::InvalidArgument(format!("Unknown memory handle {:?}", handle))
        })?;
        arena.uncharge(allocation.charged);
        Ok(())
    }
}

fn check_range(what: &str, offset: usize, len: usize, total: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= total => Ok(()),
        _ => Err(ErrorKind::InvalidArgument(format!(
            "{} range {}+{} exceeds allocation of {} bytes",
            what, offset, len, total
        )))?,
    }
}

impl MemService for HostMemService {
    fn num_devices(&self) -> u16 {
        self.devices.len() as u16
    }

    fn alloc(&self, len: usize, mem_type: MemType) -> Result<MemHandle> {
        let device = mem_type.device();
        let charged = mem_type.footprint(len);
        let arena = self.arena(device)?;

        if !arena.charge(charged) {
            Err(ErrorKind::OutOfMemory(format!(
                "{} bytes of {:?} requested, {} of {} bytes in use",
                charged,
                mem_type,
                arena.used.load(Ordering::SeqCst),
                arena.capacity
            )))?;
        }

        let allocation = Allocation {
            bytes: Arc::new(RwLock::new(vec![0; len])),
            charged,
            mapping_of: None,
        };
        let handle = self.insert(device, allocation)?;
        debug!(?handle, len, ?mem_type, "allocated");
        Ok(handle)
    }

    fn free(&self, handle: MemHandle) -> Result<()> {
        self.with_allocation(handle, |a| {
            if a.mapping_of.is_some() {
                Err(ErrorKind::LogicError(
                    "IPC mappings must be released with close_ipc_handle".to_string(),
                ))?;
            }
            Ok(())
        })?;
        self.remove(handle)?;
        debug!(?handle, "freed");
        Ok(())
    }

    fn copy_host_to_device(&self, dst: MemHandle, offset: usize, src: &[u8]) -> Result<()> {
        let bytes = self.mapped(dst)?;
        let mut guard = bytes
            .write()
            .map_err(|_| ErrorKind::LogicError("Allocation lock poisoned".to_string()))?;
        check_range("Destination", offset, src.len(), guard.len())?;
        guard[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn copy_device_to_host(&self, dst: &mut [u8], src: MemHandle, offset: usize) -> Result<()> {
        let bytes = self.mapped(src)?;
        let guard = bytes
            .read()
            .map_err(|_| ErrorKind::LogicError("Allocation lock poisoned".to_string()))?;
        check_range("Source", offset, dst.len(), guard.len())?;
        dst.copy_from_slice(&guard[offset..offset + dst.len()]);
        Ok(())
    }

    fn copy_device_to_device(
        &self,
        dst: MemHandle,
        dst_offset: usize,
        src: MemHandle,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        let src_bytes = self.mapped(src)?;
        let dst_bytes = self.mapped(dst)?;

        if Arc::ptr_eq(&src_bytes, &dst_bytes) {
            let mut guard = dst_bytes
                .write()
                .map_err(|_| ErrorKind::LogicError("Allocation lock poisoned".to_string()))?;
            check_range("Source", src_offset, len, guard.len())?;
            check_range("Destination", dst_offset, len, guard.len())?;
            guard.copy_within(src_offset..src_offset + len, dst_offset);
            return Ok(());
        }

        let src_guard = src_bytes
            .read()
            .map_err(|_| ErrorKind::LogicError("Allocation lock poisoned".to_string()))?;
        let mut dst_guard = dst_bytes
            .write()
            .map_err(|_| ErrorKind::LogicError("Allocation lock poisoned".to_string()))?;
        check_range("Source", src_offset, len, src_guard.len())?;
        check_range("Destination", dst_offset, len, dst_guard.len())?;
        dst_guard[dst_offset..dst_offset + len]
            .copy_from_slice(&src_guard[src_offset..src_offset + len]);
        Ok(())
    }

    fn export_ipc_handle(&self, handle: MemHandle) -> Result<IpcHandle> {
        self.with_allocation(handle, |a| {
            if a.mapping_of.is_some() {
                Err(ErrorKind::InvalidArgument(
                    "Cannot export an IPC mapping".to_string(),
                ))?;
            }
            Ok(IpcHandle {
                id: handle.id,
                device: handle.device,
            })
        })
    }

    fn open_ipc_handle(&self, ipc: IpcHandle) -> Result<MemHandle> {
        let owner = MemHandle {
            id: ipc.id,
            device: ipc.device,
        };
        let bytes = self.mapped(owner)?;
        let mapping = Allocation {
            bytes,
            charged: 0,
            mapping_of: Some(ipc.id),
        };
        self.insert(ipc.device, mapping)
    }

    fn close_ipc_handle(&self, handle: MemHandle) -> Result<()> {
        self.with_allocation(handle, |a| {
            if a.mapping_of.is_none() {
                Err(ErrorKind::LogicError(
                    "Owned allocations must be released with free".to_string(),
                ))?;
            }
            Ok(())
        })?;
        self.remove(handle)?;
        Ok(())
    }
}
