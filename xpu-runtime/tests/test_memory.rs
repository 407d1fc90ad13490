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

use std::cell::Cell;
use std::error::Error;
use xpu_runtime::runtime::allocator::{Allocator, MemType};
use xpu_runtime::runtime::memory::{HostMemService, MemService};

#[test]
fn copy_round_trip_between_host_and_devices() -> Result<(), Box<dyn Error>> {
    let mem = HostMemService::new(2, 1 << 20);
    let data: Vec<u8> = (0..=255).collect();

    let d0 = Allocator::alloc_and_copy(&mem, &data, MemType::DevMem(0))?;
    let d1 = mem.alloc(data.len(), MemType::DevMem(1))?;
    mem.copy_device_to_device(d1, 0, d0, 0, data.len())?;

    let mut back = vec![0_u8; 16];
    mem.copy_device_to_host(&mut back, d1, 100)?;
    assert_eq!(back.as_slice(), &data[100..116]);

    mem.free(d0)?;
    mem.free(d1)?;
    assert_eq!(mem.used_bytes(0)?, 0);
    assert_eq!(mem.used_bytes(1)?, 0);
    Ok(())
}

#[test]
fn out_of_range_copy_is_rejected() -> Result<(), Box<dyn Error>> {
    let mem = HostMemService::new(1, 1024);
    let handle = mem.alloc(64, MemType::DevMem(0))?;
    assert!(mem.copy_host_to_device(handle, 60, &[0; 8]).is_err());
    mem.free(handle)?;
    Ok(())
}

#[test]
fn capacity_is_enforced() -> Result<(), Box<dyn Error>> {
    let mem = HostMemService::new(1, 1000);
    let a = mem.alloc(600, MemType::DevMem(0))?;
    let err = mem
        .alloc(600, MemType::DevMem(0))
        .expect_err("second allocation must exceed the capacity");
    assert!(err.is_out_of_memory());

    // Host memory is not charged against the device.
    let h = mem.alloc(4096, MemType::PinnedMem)?;
    mem.free(h)?;
    mem.free(a)?;
    Ok(())
}

#[test]
fn retry_uses_reduced_footprint_once() -> Result<(), Box<dyn Error>> {
    let mem = HostMemService::new(1, 1000);
    let shrunk = Cell::new(false);

    // I/O-mapped memory doubles the footprint and does not fit.
    let (handle, mem_type, len) =
        Allocator::alloc_with_retry(&mem, 600, MemType::IoMapMem(0), || {
            shrunk.set(true);
            Ok((MemType::DevMem(0), 600))
        })?;
    assert!(shrunk.get());
    assert_eq!(mem_type, MemType::DevMem(0));
    assert_eq!(len, 600);
    mem.free(handle)?;

    // A second failure is fatal.
    let result = Allocator::alloc_with_retry(&mem, 2000, MemType::IoMapMem(0), || {
        Ok((MemType::DevMem(0), 1500))
    });
    assert!(result.map(|_| ()).unwrap_err().is_out_of_memory());
    Ok(())
}

#[test]
fn ipc_mapping_shares_bytes() -> Result<(), Box<dyn Error>> {
    let mem = HostMemService::new(1, 1 << 16);
    let owner = Allocator::alloc_and_copy(&mem, &[1, 2, 3, 4], MemType::DevMem(0))?;
    let ipc = mem.export_ipc_handle(owner)?;
    let mapping = mem.open_ipc_handle(ipc)?;

    mem.copy_host_to_device(mapping, 0, &[9])?;
    let mut byte = [0_u8; 1];
    mem.copy_device_to_host(&mut byte, owner, 0)?;
    assert_eq!(byte[0], 9);

    // Mappings are not charged and must be closed, not freed.
    assert_eq!(mem.used_bytes(0)?, 4);
    assert!(mem.free(mapping).is_err());
    mem.close_ipc_handle(mapping)?;
    mem.free(owner)?;
    assert_eq!(mem.live_allocations(Some(0))?, 0);
    Ok(())
}
