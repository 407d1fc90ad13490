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

//! Synchronization between the leader and cooperating workers.
//!
//! Two primitives are provided:
//!
//! - `PreloadLatch`: workers block until the leader has published a shared
//!   resource. This is the only blocking wait between workers, thus it
//!   observes query cancellation while waiting.
//! - `ColocationBarrier`: a one-shot, tri-state (pending, merging, done)
//!   barrier. Exactly one participant performs the guarded action, and all
//!   others wait until it is done.

use super::cancel::CancellationToken;
use crate::error::{ErrorKind, Result};
use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Outcome published by the leader.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PreloadStatus {
    /// The leader has not finished yet.
    Pending,
    /// The shared resource is ready.
    Ready,
    /// The leader determined that there is no work, e.g., because an inner
    /// relation is empty.
    NoWork,
    /// The leader failed with the given message.
    Failed(String),
}

/// A latch that wakes all waiting workers once the leader publishes a status
#[derive(Debug)]
pub struct PreloadLatch {
    status: Mutex<PreloadStatus>,
    cond: Condvar,
    poll_interval: Duration,
}

impl PreloadLatch {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(PreloadStatus::Pending),
            cond: Condvar::new(),
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Publishes the final status and wakes all waiters.
    pub fn publish(&self, status: PreloadStatus) -> Result<()> {
        let mut guard = self
            .status
            .lock()
            .map_err(|_| ErrorKind::LogicError("Preload latch poisoned".to_string()))?;
        if *guard != PreloadStatus::Pending {
            Err(ErrorKind::LogicError(
                "Preload status was already published".to_string(),
            ))?;
        }
        *guard = status;
        self.cond.notify_all();
        Ok(())
    }

    /// Returns the current status without blocking.
    pub fn status(&self) -> Result<PreloadStatus> {
        let guard = self
            .status
            .lock()
            .map_err(|_| ErrorKind::LogicError("Preload latch poisoned".to_string()))?;
        Ok(guard.clone())
    }

    /// Blocks until the status is published or the query is cancelled.
    pub fn wait(&self, cancel: &CancellationToken) -> Result<PreloadStatus> {
        let mut guard = self
            .status
            .lock()
            .map_err(|_| ErrorKind::LogicError("Preload latch poisoned".to_string()))?;
        loop {
            if *guard != PreloadStatus::Pending {
                return Ok(guard.clone());
            }
            cancel.check()?;
            let (next, _) = self
                .cond
                .wait_timeout(guard, self.poll_interval)
                .map_err(|_| ErrorKind::LogicError("Preload latch poisoned".to_string()))?;
            guard = next;
        }
    }
}

impl Default for PreloadLatch {
    fn default() -> Self {
        Self::new()
    }
}

const PENDING: u8 = 0;
const MERGING: u8 = 1;
const DONE: u8 = 2;

/// A one-shot barrier guarding an idempotent action
#[derive(Debug, Default)]
pub struct ColocationBarrier {
    state: AtomicU8,
}

impl ColocationBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the guarded action must run before reading.
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::SeqCst) != DONE
    }

    /// Re-arms the barrier, e.g., after the guarded data changed again.
    pub fn rearm(&self) {
        self.state.store(PENDING, Ordering::SeqCst);
    }

    /// Runs `action` exactly once among all concurrent callers.
    ///
    /// Returns `true` for the caller that ran the action. Other callers wait
    /// until the action completed. If the action fails, the barrier returns
    /// to pending and the error is propagated to the caller that ran it.
    pub fn run_once<F>(&self, cancel: &CancellationToken, action: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        let backoff = Backoff::new();
        loop {
            match self
                .state
                .compare_exchange(PENDING, MERGING, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    return match action() {
                        Ok(()) => {
                            self.state.store(DONE, Ordering::SeqCst);
                            Ok(true)
                        }
                        Err(e) => {
                            self.state.store(PENDING, Ordering::SeqCst);
                            Err(e)
                        }
                    };
                }
                Err(DONE) => return Ok(false),
                Err(_) => {
                    cancel.check()?;
                    backoff.snooze();
                }
            }
        }
    }
}
