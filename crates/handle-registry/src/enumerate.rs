// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Enumeration and shutdown sweep.
//!
//! Grounded on the teacher's `rpc::registry::list_services`: a
//! lock-free walk over a fixed table that tolerates concurrent
//! mutation by simply skipping slots that change state mid-scan, rather
//! than taking a registry-wide lock for the duration of the walk. A
//! snapshot here is therefore always *a* consistent view, never
//! necessarily *the* view at any single instant once other threads are
//! active — exactly the guarantee `spec.md` #4.F describes for `enum`.

use crate::error::HandleError;
use crate::ids::{HandleId, TypeId};
use crate::registry::HandleRegistry;

/// Every live handle in the registry, in no particular order.
pub fn enumerate(registry: &HandleRegistry) -> Vec<HandleId> {
    let mut out = Vec::new();
    registry.for_each_group(|group| {
        group.for_each_allocated(|index, slot| {
            let handle = slot.with_data(|d| d.ty.map(|ty| HandleId::make(ty, d.sequence, index)));
            if let Some(handle) = handle {
                out.push(handle);
            }
        });
    });
    out
}

/// Every live handle of exactly `ty`.
pub fn enumerate_type(registry: &HandleRegistry, ty: TypeId) -> Vec<HandleId> {
    let group = registry.group(ty.group());
    let mut out = Vec::new();
    group.for_each_allocated(|index, slot| {
        let handle = slot.with_data(|d| (d.ty == Some(ty)).then(|| HandleId::make(ty, d.sequence, index)));
        if let Some(handle) = handle {
            out.push(handle);
        }
    });
    out
}

/// Number of live handles across the whole registry.
pub fn count(registry: &HandleRegistry) -> usize {
    let mut total = 0usize;
    registry.for_each_group(|group| {
        group.for_each_allocated(|_, _| total += 1);
    });
    total
}

/// Outcome of [`shutdown_sweep`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Handles torn down cleanly during the first pass.
    pub destroyed: usize,
    /// Handles force-destroyed during the second pass (only nonzero in
    /// single-threaded mode).
    pub force_destroyed: usize,
    /// Handles still live after both passes: busy handles in
    /// multi-threaded mode, or anything `force_destroy` itself rejected
    /// (e.g. a handle whose sequence no longer matches, already raced
    /// away by something else).
    pub stragglers: Vec<HandleId>,
}

/// Tear down every remaining handle in the registry.
///
/// Two passes, per `spec.md` #4.F:
///
/// 1. Repeatedly enumerate and call `destroy` on everything, until a
///    full pass makes no progress. This alone empties a registry whose
///    handles have no outstanding references and no deadlocked
///    ownership cycles (cycles cannot occur: `set_parent` is one-shot
///    and checked against the existing link before assignment, so the
///    parent graph is a forest).
/// 2. Whatever remains is either busy (nonzero refcount) or blocked on
///    a child that is itself busy. If the registry was built with
///    [`crate::config::RegistryConfig::with_single_threaded`], force
///    through it with [`HandleRegistry::force_destroy`]; otherwise
///    report it and stop, since forcing a busy handle's teardown out
///    from under a live borrower on another thread would be unsound.
pub fn shutdown_sweep(registry: &HandleRegistry) -> ShutdownReport {
    let mut report = ShutdownReport::default();

    loop {
        let live = enumerate(registry);
        if live.is_empty() {
            return report;
        }
        let mut progressed = false;
        for handle in live {
            // A busy handle's `destroy` would block in `set_notready`
            // until something else matches its outstanding `get`s; the
            // sweep must not wait on that, so busy handles are left for
            // the straggler pass below instead of being attempted here.
            if registry.refcount(handle).unwrap_or(0) > 0 {
                continue;
            }
            // Captured before `destroy` clears the slot: `spec.md` line 204
            // requires each leak be logged including its allocation site.
            let alloc_site = registry.resolve(handle).ok().and_then(|(_, slot)| slot.alloc_site());
            match registry.destroy(handle) {
                Ok(()) => {
                    match alloc_site {
                        Some(site) => log::info!("shutdown_sweep: destroyed leaked {handle}, allocated at {site}"),
                        None => log::info!("shutdown_sweep: destroyed leaked {handle}"),
                    }
                    report.destroyed += 1;
                    progressed = true;
                }
                Err(HandleError::PendingChildren) | Err(_) => {}
            }
        }
        if !progressed {
            break;
        }
    }

    let stragglers = enumerate(registry);
    if !registry.config().single_threaded() {
        report.stragglers = stragglers;
        return report;
    }

    for handle in stragglers {
        match registry.force_destroy(handle) {
            Ok(()) => report.force_destroyed += 1,
            Err(_) => report.stragglers.push(handle),
        }
    }
    report
}
