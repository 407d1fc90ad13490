/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019-2022, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

use crate::error::{ErrorKind, Result};
use crate::utils::DeviceType;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Mutex;

/// A participant of a `WorkerPool`
///
/// Worker 0 is the leader. Device workers drive one device each; CPU workers
/// execute on the host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Worker {
    pub id: usize,
    pub device: DeviceType<(), u16>,
}

impl Worker {
    pub fn is_leader(&self) -> bool {
        self.id == 0
    }
}

/// A pool of one leader and cooperating workers
pub struct WorkerPool {
    workers: Vec<Worker>,
    thread_pool: ThreadPool,
}

pub struct WorkerPoolBuilder {
    cpu_workers: usize,
    gpu_ids: Vec<u16>,
}

impl WorkerPoolBuilder {
    pub fn new() -> Self {
        Self {
            cpu_workers: 0,
            gpu_ids: vec![0],
        }
    }

    pub fn cpu_workers(mut self, cpu_workers: usize) -> Self {
        self.cpu_workers = cpu_workers;
        self
    }

    pub fn gpu_ids(mut self, gpu_ids: Vec<u16>) -> Self {
        self.gpu_ids = gpu_ids;
        self
    }

    pub fn build(self) -> Result<WorkerPool> {
        let workers: Vec<Worker> = self
            .gpu_ids
            .iter()
            .map(|&id| DeviceType::Gpu(id))
            .chain((0..self.cpu_workers).map(|_| DeviceType::Cpu(())))
            .enumerate()
            .map(|(id, device)| Worker { id, device })
            .collect();

        if workers.is_empty() {
            Err(ErrorKind::InvalidArgument(
                "Worker pool requires at least one worker".to_string(),
            ))?;
        }

        let thread_pool = ThreadPoolBuilder::new()
            .num_threads(workers.len())
            .thread_name(|index| format!("xpu-worker-{}", index))
            .build()?;

        Ok(WorkerPool {
            workers,
            thread_pool,
        })
    }
}

impl Default for WorkerPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Runs `f` once on every worker concurrently and collects the results
    /// in worker order.
    ///
    /// All workers run to completion, even if some fail. The first error in
    /// worker order is returned.
    pub fn run<F, R>(&self, f: F) -> Result<Vec<R>>
    where
        F: Fn(Worker) -> Result<R> + Send + Sync,
        R: Send,
    {
        let results: Vec<Mutex<Option<Result<R>>>> =
            self.workers.iter().map(|_| Mutex::new(None)).collect();
        let f = &f;
        let results_ref = &results;

        self.thread_pool.scope(|scope| {
            for (slot, &worker) in results_ref.iter().zip(self.workers.iter()) {
                scope.spawn(move |_| {
                    let result = f(worker);
                    if let Ok(mut guard) = slot.lock() {
                        *guard = Some(result);
                    }
                });
            }
        });

        results
            .into_iter()
            .map(|slot| {
                slot.into_inner()
                    .map_err(|_| ErrorKind::LogicError("Worker result lock poisoned".to_string()))?
                    .ok_or_else(|| {
                        ErrorKind::RuntimeError("Worker terminated without result".to_string())
                            .into()
                    })
                    .and_then(|r| r)
            })
            .collect()
    }
}
