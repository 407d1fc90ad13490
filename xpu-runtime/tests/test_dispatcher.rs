/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019-2022, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use xpu_runtime::runtime::dispatcher::{MorselDispatcher, WorkerPoolBuilder};

#[test]
fn morsels_cover_data_exactly_once() -> Result<(), Box<dyn Error>> {
    let data_len = 10_007;
    let dispatcher = MorselDispatcher::new(data_len, 100);
    let pool = WorkerPoolBuilder::new()
        .gpu_ids(vec![0, 1])
        .cpu_workers(2)
        .build()?;

    let seen = Mutex::new(vec![0_u32; data_len]);
    pool.run(|_worker| {
        while let Some(range) = dispatcher.dispatch() {
            let mut guard = seen.lock().unwrap();
            for i in range {
                guard[i] += 1;
            }
        }
        Ok(())
    })?;

    assert!(seen.into_inner()?.iter().all(|&count| count == 1));
    Ok(())
}

#[test]
fn last_morsel_is_truncated() {
    let dispatcher = MorselDispatcher::new(25, 10);
    assert_eq!(dispatcher.dispatch(), Some(0..10));
    assert_eq!(dispatcher.dispatch(), Some(10..20));
    assert_eq!(dispatcher.dispatch(), Some(20..25));
    assert_eq!(dispatcher.dispatch(), None);
}

#[test]
fn worker_pool_has_leader_and_device_kinds() -> Result<(), Box<dyn Error>> {
    let pool = WorkerPoolBuilder::new()
        .gpu_ids(vec![3])
        .cpu_workers(1)
        .build()?;

    let workers = pool.workers();
    assert_eq!(workers.len(), 2);
    assert!(workers[0].is_leader());
    assert_eq!(workers[0].device.gpu(), Some(3));
    assert!(workers[1].device.is_cpu());

    let calls = AtomicUsize::new(0);
    let ids = pool.run(|worker| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(worker.id)
    })?;
    assert_eq!(ids, vec![0, 1]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn worker_pool_returns_first_error() -> Result<(), Box<dyn Error>> {
    let pool = WorkerPoolBuilder::new()
        .gpu_ids(vec![0])
        .cpu_workers(2)
        .build()?;

    let result = pool.run(|worker| {
        if worker.id == 1 {
            Err(xpu_runtime::error::ErrorKind::RuntimeError("boom".to_string()).into())
        } else {
            Ok(())
        }
    });
    assert!(result.is_err());
    Ok(())
}
