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

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use xpu_runtime::runtime::cancel::CancellationToken;
use xpu_runtime::runtime::sync::{ColocationBarrier, PreloadLatch, PreloadStatus};

#[test]
fn latch_wakes_waiters() -> Result<(), Box<dyn Error>> {
    let latch = Arc::new(PreloadLatch::new());
    let cancel = CancellationToken::new();

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let latch = latch.clone();
            let cancel = cancel.clone();
            thread::spawn(move || latch.wait(&cancel).map_err(|e| e.to_string()))
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    latch.publish(PreloadStatus::Ready)?;

    for waiter in waiters {
        assert_eq!(waiter.join().unwrap()?, PreloadStatus::Ready);
    }
    assert!(latch.publish(PreloadStatus::NoWork).is_err());
    Ok(())
}

#[test]
fn latch_wait_observes_cancellation() {
    let latch = Arc::new(PreloadLatch::new());
    let cancel = CancellationToken::new();

    let waiter = {
        let latch = latch.clone();
        let cancel = cancel.clone();
        thread::spawn(move || latch.wait(&cancel))
    };

    thread::sleep(Duration::from_millis(20));
    cancel.cancel();

    let err = waiter.join().unwrap().unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn barrier_runs_action_once() -> Result<(), Box<dyn Error>> {
    let barrier = Arc::new(ColocationBarrier::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();
    assert!(barrier.is_pending());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let barrier = barrier.clone();
            let runs = runs.clone();
            let cancel = cancel.clone();
            thread::spawn(move || {
                barrier.run_once(&cancel, || {
                    thread::sleep(Duration::from_millis(5));
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
        })
        .collect();

    let ran: usize = handles
        .into_iter()
        .map(|h| h.join().unwrap().map(|r| r as usize))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .sum();
    assert_eq!(ran, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(!barrier.is_pending());

    barrier.rearm();
    assert!(barrier.run_once(&cancel, || Ok(()))?);
    Ok(())
}
