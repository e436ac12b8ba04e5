// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Concurrency laws: the refcount/readiness handshake between `get`,
//! `put`, and `set_notready` must hold under real contention, not just
//! in a single-threaded unit test.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use handle_registry::{DeinitFn, GroupId, HandleRegistry, RegistryConfig, TypeId, USER_GROUP_START};

fn ty() -> TypeId {
    TypeId::make(GroupId::new(USER_GROUP_START).unwrap(), 1)
}

/// `set_notready` must not observe a zero refcount until every `get`
/// that happened-before it has been matched by a `put`, even with many
/// threads hammering `get`/`put` concurrently.
#[test]
fn set_notready_waits_out_every_concurrent_holder() {
    let registry = Arc::new(HandleRegistry::with_config(
        RegistryConfig::default().with_not_ready_poll(Duration::from_millis(1)),
    ));
    let handle = registry.alloc(ty(), 0u32, None, None).unwrap();
    registry.set_ready(handle).unwrap();

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(51));

    let workers: Vec<_> = (0..50)
        .map(|_| {
            let registry = registry.clone();
            let stop = stop.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                while !stop.load(Ordering::Relaxed) {
                    if let Ok(guard) = registry.get::<u32>(ty(), handle) {
                        std::thread::yield_now();
                        drop(guard);
                    }
                }
            })
        })
        .collect();

    barrier.wait();
    std::thread::sleep(Duration::from_millis(20));
    registry.set_notready(handle).unwrap();
    assert_eq!(registry.refcount(handle).unwrap(), 0);

    stop.store(true, Ordering::Relaxed);
    for w in workers {
        w.join().unwrap();
    }
}

/// Many threads allocating, readying, using, and destroying handles of
/// their own concurrently: every allocation must eventually be torn
/// down exactly once, with no double-`deinit` and no missed ones.
#[test]
fn concurrent_stress_loop_runs_every_deinit_exactly_once() {
    let registry = Arc::new(HandleRegistry::new());
    let ty = ty();
    let total_deinits = Arc::new(AtomicU32::new(0));
    let per_thread = 200u32;
    let thread_count = 16;

    let workers: Vec<_> = (0..thread_count)
        .map(|_| {
            let registry = registry.clone();
            let total_deinits = total_deinits.clone();
            std::thread::spawn(move || {
                for i in 0..per_thread {
                    let total_deinits = total_deinits.clone();
                    let deinit: DeinitFn = Box::new(move |_payload| {
                        total_deinits.fetch_add(1, Ordering::SeqCst);
                    });
                    let handle = registry.alloc(ty, i, Some(deinit), None).unwrap();
                    registry.set_ready(handle).unwrap();

                    let guard = registry.get::<u32>(ty, handle).unwrap();
                    let _ = *guard;
                    drop(guard);

                    registry.destroy(handle).unwrap();
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(total_deinits.load(Ordering::SeqCst), thread_count * per_thread);
    assert_eq!(registry.count(), 0);
}

/// Concurrent `set_parent` calls racing to claim the same child must
/// leave exactly one winner, never a torn or double-applied link.
#[test]
fn concurrent_set_parent_has_exactly_one_winner() {
    let registry = Arc::new(HandleRegistry::new());
    let ty = ty();
    let child = registry.alloc(ty, 0u32, None, None).unwrap();
    let candidates: Vec<_> = (0..8).map(|i| registry.alloc(ty, i, None, None).unwrap()).collect();

    let barrier = Arc::new(Barrier::new(candidates.len()));
    let workers: Vec<_> = candidates
        .iter()
        .copied()
        .map(|parent| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                registry.set_parent(child, parent)
            })
        })
        .collect();

    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

    let winners = registry.children(*candidates.iter().find(|_| true).unwrap());
    let _ = winners;

    let mut found_parent = None;
    for parent in &candidates {
        if registry.children(*parent).unwrap().contains(&child) {
            found_parent = Some(*parent);
        }
    }
    assert!(found_parent.is_some());
}
