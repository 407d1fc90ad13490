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


//! The join execution driver.
//!
//! A join runs on one leader and cooperating workers. The leader builds the
//! inner buffer, replicates it to every device, and publishes it through the
//! preload latch. Workers then take outer morsels from a shared dispatcher.
//! A device worker stages each morsel and launches the kernel until no
//! group is suspended. If a launch reports a host re-check, the task is
//! completed by the CPU fallback, starting from the state captured after
//! the last shipped launch. CPU workers join their morsels on the host.
//!
//! After all workers finished, the outer-join maps are merged and every
//! right or full outer depth is swept for unmatched rows, one depth after
//! another.

use crate::device_mem::DeviceAlloc;
use crate::error::{ErrorKind, Result};
use crate::fallback::{CpuFallback, FallbackSource};
use crate::inner_buffer::{InnerBuffer, InnerBufferBuilder, InnerBufferRegistry};
use crate::kernel::suspend::{self, GroupState};
use crate::kernel::{
    EmulatedDevice, FaultInjection, JoinKernel, LaunchArgs, LaunchCounters, LaunchSource,
    LaunchStatus,
};
use crate::plan::{JoinPlan, JoinProgram};
use crate::source::SourceChunk;
use crate::stats::{JoinStats, StatsSnapshot};
use crate::tuple::decode_row;
use once_cell::sync::OnceCell;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use xpu_codegen::catalog::DevCatalog;
use xpu_codegen::datum::Row;
use xpu_runtime::runtime::cancel::CancellationToken;
use xpu_runtime::runtime::dispatcher::{MorselDispatcher, Worker, WorkerPoolBuilder};
use xpu_runtime::runtime::memory::{HostMemService, MemHandle, MemService};
use xpu_runtime::runtime::sync::{PreloadLatch, PreloadStatus};

pub const DEFAULT_GRID: usize = 4;
pub const DEFAULT_LANES: usize = 32;
pub const DEFAULT_STACK_ROOMS: usize = 2048;
pub const DEFAULT_DST_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MORSEL_LEN: usize = 16 * 1024;

/// Build a `GpuJoin`.
#[derive(Clone)]
pub struct GpuJoinBuilder {
    devices: Vec<u16>,
    cpu_workers: usize,
    grid: usize,
    lanes: usize,
    stack_rooms: usize,
    dst_bytes: usize,
    cpu_fallback: bool,
    morsel_len: usize,
    inner_buffer: InnerBufferBuilder,
    fault_injection: Option<FaultInjection>,
    shared_inner: Option<(Arc<InnerBufferRegistry<String>>, String)>,
}

impl GpuJoinBuilder {
    pub fn new() -> Self {
        Self {
            devices: vec![0],
            cpu_workers: 0,
            grid: DEFAULT_GRID,
            lanes: DEFAULT_LANES,
            stack_rooms: DEFAULT_STACK_ROOMS,
            dst_bytes: DEFAULT_DST_BYTES,
            cpu_fallback: true,
            morsel_len: DEFAULT_MORSEL_LEN,
            inner_buffer: InnerBufferBuilder::new(),
            fault_injection: None,
            shared_inner: None,
        }
    }

    /// Devices that run join kernels, one worker each.
    pub fn devices(mut self, devices: Vec<u16>) -> Self {
        self.devices = devices;
        self
    }

    /// Workers that join outer morsels on the host.
    pub fn cpu_workers(mut self, cpu_workers: usize) -> Self {
        self.cpu_workers = cpu_workers;
        self
    }

    /// Thread-groups per launch.
    pub fn grid(mut self, grid: usize) -> Self {
        self.grid = grid;
        self
    }

    /// Lanes per thread-group.
    pub fn lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes;
        self
    }

    /// Capacity of every per-depth stack of a thread-group, in entries.
    pub fn stack_rooms(mut self, stack_rooms: usize) -> Self {
        self.stack_rooms = stack_rooms;
        self
    }

    /// Capacity of the destination buffer of a launch.
    pub fn dst_bytes(mut self, dst_bytes: usize) -> Self {
        self.dst_bytes = dst_bytes;
        self
    }

    pub fn cpu_fallback(mut self, enabled: bool) -> Self {
        self.cpu_fallback = enabled;
        self
    }

    /// Outer rows per task.
    pub fn morsel_len(mut self, morsel_len: usize) -> Self {
        self.morsel_len = morsel_len;
        self
    }

    pub fn inner_buffer(mut self, inner_buffer: InnerBufferBuilder) -> Self {
        self.inner_buffer = inner_buffer;
        self
    }

    pub fn fault_injection(mut self, fault: FaultInjection) -> Self {
        self.fault_injection = Some(fault);
        self
    }

    /// Shares the inner buffer with sibling joins that use the same key.
    pub fn shared_inner(mut self, registry: Arc<InnerBufferRegistry<String>>, key: String) -> Self {
        self.shared_inner = Some((registry, key));
        self
    }

    pub fn build(
        &self,
        plan: JoinPlan,
        catalog: Arc<DevCatalog>,
        mem: Arc<HostMemService>,
    ) -> Result<GpuJoin> {
        if self.grid == 0 || self.lanes == 0 || self.stack_rooms == 0 {
            Err(ErrorKind::InvalidArgument(
                "Grid, lanes, and stack rooms must be at least 1".to_string(),
            ))?;
        }
        if self.stack_rooms >= suspend::NULL_REF as usize {
            Err(ErrorKind::InvalidArgument(format!(
                "{} stack rooms exceed the entry range",
                self.stack_rooms
            )))?;
        }
        if self.dst_bytes == 0 {
            Err(ErrorKind::InvalidArgument(
                "Destination buffer must not be empty".to_string(),
            ))?;
        }
        if self.devices.is_empty() && self.cpu_workers == 0 {
            Err(ErrorKind::InvalidArgument(
                "A join requires at least one device or CPU worker".to_string(),
            ))?;
        }
        for (i, &device) in self.devices.iter().enumerate() {
            if device >= mem.num_devices() {
                Err(ErrorKind::InvalidArgument(format!(
                    "Device {} does not exist",
                    device
                )))?;
            }
            if self.devices[..i].contains(&device) {
                Err(ErrorKind::InvalidArgument(format!(
                    "Device {} is listed twice",
                    device
                )))?;
            }
        }
        plan.validate()?;
        if self.shared_inner.is_some() && plan.depths.iter().any(|d| d.join_type.is_right_outer()) {
            Err(ErrorKind::InvalidArgument(
                "Right outer joins sweep their own outer-join maps and cannot share an inner buffer"
                    .to_string(),
            ))?;
        }

        let program = match JoinProgram::compile(&plan, &catalog) {
            Ok(program) => Some(program),
            Err(ref e) if e.is_unsupported() => {
                info!(error = %e, "join has no device translation, running on the host");
                None
            }
            Err(e) => return Err(e),
        };

        let kernels = self
            .devices
            .iter()
            .enumerate()
            .map(|(copy, &device)| {
                let kernel = EmulatedDevice::new(mem.clone(), device, copy);
                let kernel = match self.fault_injection {
                    Some(fault) => kernel.with_fault_injection(fault),
                    None => kernel,
                };
                Box::new(kernel) as Box<dyn JoinKernel>
            })
            .collect();

        let mem_service: Arc<dyn MemService> = mem;
        Ok(GpuJoin {
            plan,
            catalog,
            program,
            mem: mem_service,
            kernels,
            devices: self.devices.clone(),
            cpu_workers: self.cpu_workers,
            grid: self.grid,
            lanes: self.lanes,
            stack_rooms: self.stack_rooms,
            dst_bytes: self.dst_bytes,
            cpu_fallback: self.cpu_fallback,
            morsel_len: self.morsel_len,
            inner_buffer: self.inner_buffer.clone(),
            shared_inner: self.shared_inner.clone(),
        })
    }
}

impl Default for GpuJoinBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The result of a join
#[derive(Debug)]
pub struct JoinOutput {
    pub rows: Vec<Row>,
    pub stats: StatsSnapshot,
}

/// An N-way join executed on devices and host workers
pub struct GpuJoin {
    plan: JoinPlan,
    catalog: Arc<DevCatalog>,
    program: Option<JoinProgram>,
    mem: Arc<dyn MemService>,
    kernels: Vec<Box<dyn JoinKernel>>,
    devices: Vec<u16>,
    cpu_workers: usize,
    grid: usize,
    lanes: usize,
    stack_rooms: usize,
    dst_bytes: usize,
    cpu_fallback: bool,
    morsel_len: usize,
    inner_buffer: InnerBufferBuilder,
    shared_inner: Option<(Arc<InnerBufferRegistry<String>>, String)>,
}

/// State shared by the workers of one run
struct RunState<'r, I> {
    outer: &'r SourceChunk,
    cancel: &'r CancellationToken,
    inners: Mutex<Option<Vec<I>>>,
    latch: PreloadLatch,
    buffer: OnceCell<Arc<InnerBuffer>>,
    dispatcher: MorselDispatcher,
    stats: JoinStats,
}

impl GpuJoin {
    pub fn plan(&self) -> &JoinPlan {
        &self.plan
    }

    /// Returns `true` if the join runs on devices.
    pub fn has_device_program(&self) -> bool {
        self.program.is_some()
    }

    /// Joins `outer` with the inner relations.
    ///
    /// `inners[d - 1]` yields the rows of inner depth `d`. The rows of the
    /// result are in no particular order.
    pub fn run<I>(
        &self,
        outer: &SourceChunk,
        inners: Vec<I>,
        cancel: &CancellationToken,
    ) -> Result<JoinOutput>
    where
        I: IntoIterator<Item = Row> + Send,
    {
        let state = RunState {
            outer,
            cancel,
            inners: Mutex::new(Some(inners)),
            latch: PreloadLatch::new(),
            buffer: OnceCell::new(),
            dispatcher: MorselDispatcher::new(outer.nrows(), self.morsel_len),
            stats: JoinStats::new(self.plan.ndepths()),
        };

        let pool = WorkerPoolBuilder::new()
            .cpu_workers(self.cpu_workers)
            .gpu_ids(self.devices.clone())
            .build()?;
        let worker_results = pool.run(|worker| Ok(self.worker_main(worker, &state)));

        let mut result: Result<Vec<Row>> = match worker_results {
            Ok(results) => results
                .into_iter()
                .collect::<Result<Vec<Vec<Row>>>>()
                .map(|rows| rows.into_iter().flatten().collect()),
            Err(e) => Err(e.into()),
        };

        if let Ok(rows) = result.as_mut() {
            if state.latch.status()? == PreloadStatus::Ready {
                if let Some(buffer) = state.buffer.get() {
                    let swept = self.right_outer_sweeps(buffer, &state);
                    match swept {
                        Ok(swept) => rows.extend(swept),
                        Err(e) => result = Err(e),
                    }
                }
            }
        }

        if let Some((registry, key)) = &self.shared_inner {
            if state.buffer.get().is_some() {
                registry.release(key)?;
            }
        }

        let rows = result?;
        state.stats.add_results(rows.len() as u64);
        let stats = state.stats.snapshot();
        info!(
            rows = rows.len(),
            launches = stats.launches,
            suspends = stats.suspends,
            fallback_rows = stats.fallback_rows,
            "join finished"
        );
        Ok(JoinOutput { rows, stats })
    }

    fn worker_main<I>(&self, worker: Worker, state: &RunState<'_, I>) -> Result<Vec<Row>>
    where
        I: IntoIterator<Item = Row> + Send,
    {
        if worker.is_leader() {
            self.lead(state)?;
        }

        match state.latch.wait(state.cancel)? {
            PreloadStatus::Ready => {}
            PreloadStatus::NoWork => return Ok(Vec::new()),
            PreloadStatus::Failed(msg) => Err(ErrorKind::ExecutionError(format!(
                "Inner buffer preload failed: {}",
                msg
            )))?,
            PreloadStatus::Pending => Err(ErrorKind::LogicError(
                "Preload latch released while pending".to_string(),
            ))?,
        }
        let buffer = state.buffer.get().ok_or_else(|| {
            ErrorKind::LogicError("Inner buffer missing after preload".to_string())
        })?;

        match (worker.device.gpu(), &self.program) {
            (Some(device), Some(program)) => self.device_worker(device, program, buffer, state),
            _ => self.cpu_worker(buffer, state),
        }
    }

    /// Builds and publishes the inner buffer.
    fn lead<I>(&self, state: &RunState<'_, I>) -> Result<()>
    where
        I: IntoIterator<Item = Row> + Send,
    {
        let published = take_inners(state)
            .and_then(|inners| self.preload(inners))
            .and_then(|buffer| {
                let no_rows = buffer.produces_no_rows();
                state.buffer.set(buffer).map_err(|_| {
                    ErrorKind::LogicError("Inner buffer published twice".to_string())
                })?;
                Ok(no_rows)
            });

        match published {
            Ok(false) => state.latch.publish(PreloadStatus::Ready)?,
            Ok(true) => {
                info!("an inner relation is empty, the join produces no rows");
                state.latch.publish(PreloadStatus::NoWork)?;
            }
            Err(e) => {
                state.latch.publish(PreloadStatus::Failed(e.to_string()))?;
                return Err(e);
            }
        }
        Ok(())
    }

    fn preload<I>(&self, inners: Vec<I>) -> Result<Arc<InnerBuffer>>
    where
        I: IntoIterator<Item = Row>,
    {
        let build = || -> Result<InnerBuffer> {
            let mut buffer = self
                .inner_buffer
                .clone()
                .num_devices(self.devices.len())
                .build(&self.plan, &self.catalog, inners)?;
            if self.program.is_some() && !buffer.produces_no_rows() {
                buffer.upload(&self.mem, &self.devices)?;
            }
            Ok(buffer)
        };

        match &self.shared_inner {
            Some((registry, key)) => registry.acquire(key, build),
            None => build().map(Arc::new),
        }
    }

    fn device_worker<I>(
        &self,
        device: u16,
        program: &JoinProgram,
        buffer: &InnerBuffer,
        state: &RunState<'_, I>,
    ) -> Result<Vec<Row>> {
        let kernel = self
            .kernels
            .iter()
            .find(|k| k.device() == device)
            .ok_or_else(|| ErrorKind::LogicError(format!("No kernel for device {}", device)))?;
        let mapping = buffer.attach(device)?;
        let mut rows = Vec::new();

        while let Some(range) = state.dispatcher.dispatch() {
            state.cancel.check()?;
            let chunk = state.outer.slice(range.clone());
            let staged = DeviceAlloc::stage(&self.mem, device, &chunk.to_bytes()?)?;
            debug!(device, ?range, mem_type = ?staged.mem_type(), "outer chunk staged");

            let groups = GroupState::split(
                self.grid,
                self.plan.ndepths(),
                self.lanes,
                self.stack_rooms,
                0,
                chunk.nrows(),
            );
            self.run_task(
                kernel.as_ref(),
                program,
                mapping.handle(),
                buffer,
                LaunchSource::Outer {
                    handle: staged.handle(),
                    nrows: chunk.nrows(),
                },
                FallbackSource::Outer(&chunk),
                groups,
                state,
                &mut rows,
            )?;
        }
        Ok(rows)
    }

    fn cpu_worker<I>(&self, buffer: &InnerBuffer, state: &RunState<'_, I>) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(range) = state.dispatcher.dispatch() {
            state.cancel.check()?;
            let chunk = state.outer.slice(range);
            let fallback = CpuFallback::new(
                &self.plan,
                &self.catalog,
                buffer.view()?,
                buffer.ojmaps(),
                FallbackSource::Outer(&chunk),
            );
            let out = fallback.run(0..chunk.nrows())?;
            state.stats.add_outer(&out.counters);
            state.stats.add_cpu_rows(out.rows.len() as u64);
            rows.extend(out.rows);
        }
        Ok(rows)
    }

    fn account<I>(&self, source: LaunchSource, counters: &LaunchCounters, state: &RunState<'_, I>) {
        match source {
            LaunchSource::Outer { .. } => state.stats.add_outer(counters),
            LaunchSource::Sweep { depth } => state.stats.add_sweep(depth, counters),
        }
    }

    /// Launches the kernel until all groups are done.
    fn run_task<I>(
        &self,
        kernel: &dyn JoinKernel,
        program: &JoinProgram,
        kmrels: MemHandle,
        buffer: &InnerBuffer,
        source: LaunchSource,
        host_source: FallbackSource<'_>,
        mut groups: Vec<GroupState>,
        state: &RunState<'_, I>,
        rows: &mut Vec<Row>,
    ) -> Result<()> {
        let mut snapshot = suspend::snapshot(&groups);

        loop {
            state.cancel.check()?;
            let outcome = kernel.launch(LaunchArgs {
                program,
                params: &self.plan.params,
                kmrels,
                ojmaps: buffer.ojmaps(),
                source,
                groups: &mut groups,
                dst_bytes: self.dst_bytes,
            })?;

            match outcome.status {
                LaunchStatus::Done | LaunchStatus::Suspended => {
                    let suspended = outcome.status == LaunchStatus::Suspended;
                    state.stats.add_launch(suspended);
                    self.account(source, &outcome.counters, state);
                    rows.extend(decode_dst(&outcome.dst, outcome.nitems)?);
                    if !suspended {
                        return Ok(());
                    }

                    let next = suspend::snapshot(&groups);
                    if next == snapshot {
                        Err(ErrorKind::KernelFault(
                            "Kernel suspended without progress".to_string(),
                        ))?;
                    }
                    snapshot = next;
                    debug!(
                        device = kernel.device(),
                        shipped = outcome.nitems,
                        "kernel suspended, resuming"
                    );
                }
                LaunchStatus::CpuReCheck(reason) => {
                    state.stats.add_launch(false);
                    if !self.cpu_fallback {
                        Err(ErrorKind::ExecutionError(format!(
                            "Device requires a CPU re-check, but CPU fallback is disabled: {}",
                            reason
                        )))?;
                    }
                    info!(device = kernel.device(), %reason, "falling back to CPU");

                    let groups = suspend::restore(&snapshot)?;
                    let fallback = CpuFallback::new(
                        &self.plan,
                        &self.catalog,
                        buffer.view()?,
                        buffer.ojmaps(),
                        host_source,
                    );
                    let out = fallback.resume(&groups)?;
                    self.account(source, &out.counters, state);
                    state.stats.add_fallback(out.rows.len() as u64);
                    rows.extend(out.rows);
                    return Ok(());
                }
            }
        }
    }

    /// Emits the unmatched rows of every right or full outer depth.
    fn right_outer_sweeps<I>(&self, buffer: &InnerBuffer, state: &RunState<'_, I>) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for depth in 1..=self.plan.ndepths() {
            if !buffer.ojmaps().has_map(depth) {
                continue;
            }
            state.cancel.check()?;
            buffer.rearm_colocation();
            buffer.colocate_outer_join_maps(state.cancel)?;

            let nitems = buffer.depth(depth).map_or(0, |d| d.nitems);
            let before = rows.len();
            info!(depth, nitems, "right outer sweep started");

            match (self.devices.first(), &self.program) {
                (Some(&device), Some(program)) => {
                    let kernel = self
                        .kernels
                        .first()
                        .ok_or_else(|| ErrorKind::LogicError("No kernel".to_string()))?;
                    let mapping = buffer.attach(device)?;
                    let groups = GroupState::split(
                        self.grid,
                        self.plan.ndepths(),
                        self.lanes,
                        self.stack_rooms,
                        depth,
                        nitems,
                    );
                    self.run_task(
                        kernel.as_ref(),
                        program,
                        mapping.handle(),
                        buffer,
                        LaunchSource::Sweep { depth },
                        FallbackSource::Sweep(depth),
                        groups,
                        state,
                        &mut rows,
                    )?;
                }
                _ => {
                    let fallback = CpuFallback::new(
                        &self.plan,
                        &self.catalog,
                        buffer.view()?,
                        buffer.ojmaps(),
                        FallbackSource::Sweep(depth),
                    );
                    let out = fallback.run(0..nitems)?;
                    state.stats.add_sweep(depth, &out.counters);
                    state.stats.add_cpu_rows(out.rows.len() as u64);
                    rows.extend(out.rows);
                }
            }
            info!(depth, rows = rows.len() - before, "right outer sweep finished");
        }
        Ok(rows)
    }
}

fn take_inners<I>(state: &RunState<'_, I>) -> Result<Vec<I>> {
    let mut inners = state
        .inners
        .lock()
        .map_err(|_| ErrorKind::LogicError("Inner relations lock poisoned".to_string()))?;
    inners
        .take()
        .ok_or_else(|| ErrorKind::LogicError("Inner relations taken twice".to_string()).into())
}

/// Decodes the row images of a destination buffer.
fn decode_dst(dst: &[u8], nitems: usize) -> Result<Vec<Row>> {
    let mut rows = Vec::with_capacity(nitems);
    let mut pos = 0;
    for _ in 0..nitems {
        let image = dst.get(pos..).ok_or_else(|| {
            ErrorKind::LogicError("Destination buffer underrun".to_string())
        })?;
        let (row, len) = decode_row(image)?;
        rows.push(row);
        pos += len;
    }
    if pos != dst.len() {
        Err(ErrorKind::LogicError(format!(
            "{} trailing bytes in the destination buffer",
            dst.len() - pos
        )))?;
    }
    Ok(rows)
}
