// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The registry itself: the fixed array of [`Group`]s and the lifecycle
//! operations (`alloc`, `set_ready`, `get`, `put`, `set_notready`,
//! `destroy`) that drive a slot through its state machine.
//!
//! Grounded on the teacher's `LocalEndpointRegistry` (`rpc/registry.rs`):
//! a `RwLock`-guarded table indexed by a small integer id, with
//! lifecycle methods that validate the caller's key before touching
//! state and log at `debug`/`warn` on the unusual paths. Groups here are
//! lazily materialized (`OnceLock`) rather than eagerly allocated,
//! mirroring `EntityFactory::auto_enable` vs `manual_enable`: a consumer
//! that only ever touches group 10 should not pay for the other 19
//! groups' slot arrays.

use std::any::Any;
use std::sync::OnceLock;
use std::time::Instant;

use crate::callback::{DeinitFn, DescribeFn, Payload};
use crate::config::RegistryConfig;
use crate::error::{HandleError, Result};
use crate::flags;
use crate::graph;
use crate::group::Group;
use crate::ids::{GroupId, HandleId, TypeId, MAX_GROUPS};
use crate::slot::{ArenaTag, Slot, SlotData};

/// The handle registry: one fixed-size table of lazily materialized
/// [`Group`]s plus the policy knobs in [`RegistryConfig`].
pub struct HandleRegistry {
    groups: Box<[OnceLock<Group>]>,
    config: RegistryConfig,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    /// Build a registry with [`RegistryConfig::default`] policy knobs.
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Build a registry with caller-supplied policy knobs.
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            groups: (0..MAX_GROUPS).map(|_| OnceLock::new()).collect(),
            config,
        }
    }

    /// Policy knobs this registry was built with.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub(crate) fn group(&self, id: GroupId) -> &Group {
        self.groups[id.get() as usize].get_or_init(|| Group::new(id))
    }

    pub(crate) fn group_count(&self) -> u16 {
        MAX_GROUPS
    }

    pub(crate) fn resolve(&self, handle: HandleId) -> Result<(&Group, &Slot)> {
        if handle.is_null() {
            return Err(HandleError::Invalid(handle));
        }
        let group_id = handle.group();
        if GroupId::new(group_id.get()).is_none() {
            return Err(HandleError::Invalid(handle));
        }
        let group = self.group(group_id);
        let slot = group.slot(handle.slot_index()).ok_or(HandleError::Invalid(handle))?;
        Ok((group, slot))
    }

    /// Validate that `handle`'s sequence and type still match the slot's
    /// recorded state, i.e. the slot has not been reused since this
    /// handle was issued.
    pub(crate) fn validate(&self, slot: &Slot, handle: HandleId) -> Result<()> {
        if slot.flags().is_empty() {
            return Err(HandleError::Invalid(handle));
        }
        slot.with_data(|data| {
            if data.sequence != handle.sequence() {
                return Err(HandleError::SequenceMismatch { handle });
            }
            match data.ty {
                Some(ty) if ty == handle.ty() => Ok(()),
                _ => Err(HandleError::Invalid(handle)),
            }
        })
    }

    /// Reserve a slot in `ty`'s group, adopt `payload`, and return the
    /// new handle in `ALLOCATED_NOT_READY` state.
    ///
    /// `deinit` runs exactly once, during `destroy`, after the slot is
    /// drained to a zero refcount. `describe` backs [`crate::enumerate`]'s
    /// textual introspection; when absent, [`crate::callback::default_describe`]
    /// is used instead.
    ///
    /// `#[track_caller]` so that, under the `debug-metadata` feature, the
    /// recorded `alloc_site` is the application's call site rather than
    /// a frame inside this crate.
    #[track_caller]
    pub fn alloc<T: Any + Send + Sync>(
        &self,
        ty: TypeId,
        payload: T,
        deinit: Option<DeinitFn>,
        describe: Option<DescribeFn>,
    ) -> Result<HandleId> {
        self.alloc_erased(ty, Box::new(payload), std::mem::size_of::<T>(), deinit, describe, ArenaTag::default())
    }

    /// As [`HandleRegistry::alloc`], but tags the slot with caller-chosen
    /// external arena identity (see `spec.md` #4.F's `pool(handle)`).
    #[track_caller]
    pub fn alloc_tagged<T: Any + Send + Sync>(
        &self,
        ty: TypeId,
        payload: T,
        deinit: Option<DeinitFn>,
        describe: Option<DescribeFn>,
        arena_tag: ArenaTag,
    ) -> Result<HandleId> {
        self.alloc_erased(ty, Box::new(payload), std::mem::size_of::<T>(), deinit, describe, arena_tag)
    }

    #[track_caller]
    fn alloc_erased(
        &self,
        ty: TypeId,
        payload: Payload,
        size: usize,
        deinit: Option<DeinitFn>,
        describe: Option<DescribeFn>,
        arena_tag: ArenaTag,
    ) -> Result<HandleId> {
        let group = self.group(ty.group());
        let (index, slot) = group.reserve_any().ok_or(HandleError::NoMoreSlots)?;
        let sequence = group.next_sequence();
        slot.populate(sequence, ty, size, payload, deinit, describe, arena_tag);
        log::debug!("alloc: {} in {}", ty, group.id());
        Ok(HandleId::make(ty, sequence, index))
    }

    /// `ALLOCATED_NOT_READY -> ALLOCATED_READY`. Fails with
    /// [`HandleError::Ready`] if already ready.
    pub fn set_ready(&self, handle: HandleId) -> Result<()> {
        let (_, slot) = self.resolve(handle)?;
        self.validate(slot, handle)?;
        if slot.set_ready() {
            Ok(())
        } else {
            Err(HandleError::Ready(handle))
        }
    }

    /// Check out a typed reference to `handle`'s payload, incrementing
    /// its refcount. The slot is not locked for the duration the
    /// returned guard is held — only while validating and downcasting —
    /// so the payload may be read concurrently by any number of holders.
    /// Every successful `get` must be matched by exactly one
    /// [`PayloadGuard::put`] (or simply dropping the guard).
    ///
    /// `#[track_caller]` so that, under the `debug-metadata` feature, the
    /// recorded `last_get_site` is the application's call site. The
    /// caller is captured here, in the `#[track_caller]` function body
    /// itself, and passed into the `with_data` closure as a value —
    /// calling `Location::caller()` from inside the closure would
    /// instead report the closure's own location.
    #[track_caller]
    pub fn get<T: Any + Send + Sync>(&self, ty: TypeId, handle: HandleId) -> Result<PayloadGuard<'_, T>> {
        let (_, slot) = self.resolve(handle)?;
        self.validate(slot, handle)?;
        if !slot.flags().contains(flags::READY) {
            return Err(HandleError::NotReady(handle));
        }
        if slot.with_data(|d| d.ty) != Some(ty) {
            return Err(HandleError::TypeMismatch { handle, expected: ty });
        }

        slot.get_ref();
        let is_right_type = slot.with_data(|d| d.payload.as_deref().is_some_and(|p| p.is::<T>()));
        if !is_right_type {
            slot.put_ref();
            return Err(HandleError::TypeMismatch { handle, expected: ty });
        }

        #[cfg(feature = "debug-metadata")]
        {
            let caller = std::panic::Location::caller();
            slot.with_data(|d| d.last_get_site = Some(caller));
        }

        Ok(PayloadGuard { slot, handle, _marker: std::marker::PhantomData })
    }

    /// Match a prior `get`. A no-op on `None`, mirroring the C source's
    /// "`put` on a null payload pointer is a no-op" (`spec.md` #4.D).
    pub fn put<T: Any + Send + Sync>(&self, guard: Option<PayloadGuard<'_, T>>) {
        drop(guard);
    }

    /// Current outstanding-`get` count for `handle`.
    pub fn refcount(&self, handle: HandleId) -> Result<u32> {
        let (_, slot) = self.resolve(handle)?;
        self.validate(slot, handle)?;
        Ok(slot.refcount())
    }

    /// `ALLOCATED_READY -> ALLOCATED_NOT_READY`, blocking until every
    /// outstanding `get` has been matched by a `put`.
    ///
    /// Polls at [`RegistryConfig::not_ready_poll`] intervals; after
    /// [`RegistryConfig::not_ready_escalate_after`] total wait, logs a
    /// warning and widens the poll interval to
    /// [`RegistryConfig::not_ready_escalated_poll`]. Unlike the C
    /// original's hard assert on a 30s timeout, this never gives up —
    /// the caller decides what "stuck" means for their application.
    pub fn set_notready(&self, handle: HandleId) -> Result<()> {
        let (_, slot) = self.resolve(handle)?;
        self.validate(slot, handle)?;
        slot.latch_not_ready();
        self.drain(slot, handle);
        Ok(())
    }

    fn drain(&self, slot: &Slot, handle: HandleId) {
        let start = Instant::now();
        let mut escalated = false;
        loop {
            if slot.refcount() == 0 {
                return;
            }
            let elapsed = start.elapsed();
            if !escalated && elapsed >= self.config.not_ready_escalate_after {
                escalated = true;
                match slot.last_get_site() {
                    Some(site) => log::warn!(
                        "set_notready: {handle} still has {} outstanding reference(s) after {:?}; last get() at {site}; escalating poll interval",
                        slot.refcount(),
                        elapsed,
                    ),
                    None => log::warn!(
                        "set_notready: {handle} still has {} outstanding reference(s) after {:?}; escalating poll interval",
                        slot.refcount(),
                        elapsed,
                    ),
                }
            }
            let poll = if escalated { self.config.not_ready_escalated_poll } else { self.config.not_ready_poll };
            std::thread::sleep(poll);
        }
    }

    /// Tear down `handle`: cascades to children first (see
    /// [`crate::graph`]), drains outstanding references if still ready,
    /// runs the registered `deinit_cb`, and returns the slot to the
    /// group's free pool.
    ///
    /// Idempotent: destroying an already-destroyed or invalid handle is
    /// `Ok(())`. Returns [`HandleError::PendingChildren`] if live
    /// children still name this handle as parent — retry once they have
    /// drained.
    pub fn destroy(&self, handle: HandleId) -> Result<()> {
        if handle.is_null() {
            return Ok(());
        }
        let (group, slot) = self.resolve(handle)?;
        if slot.flags().is_empty() || slot.flags().contains(flags::DESTROY) {
            return Ok(());
        }
        if self.validate(slot, handle).is_err() {
            // Already reused or already gone under us; nothing to do.
            return Ok(());
        }

        // Unlike the C source, which treats destroying a still-ready slot
        // with no deinit_cb as caller error severe enough to abort, a
        // Rust payload's normal `Drop` already reclaims it with no
        // cleanup callback required. So READY is drained unconditionally
        // here rather than only when a deinit_cb is registered — this is
        // always safe (draining an already-idle slot is instant) and
        // strictly more permissive.
        let was_ready = slot.flags().contains(flags::READY);
        if was_ready {
            self.set_notready(handle)?;
        }

        // The children walk only runs when the slot was still READY at
        // entry, exactly as `spec.md` #4.D steps 3/5 and the original's
        // `__handle_destroy` gate it (`__destroy_slot_children` is nested
        // inside the "was not already NOT_READY" branch). A slot already
        // NOT_READY when `destroy` is called is assumed to have had its
        // children torn down already by whatever set it not-ready, so
        // `destroy` does not redo that walk.
        //
        // Children are cascaded before we ever latch DESTROY on this
        // slot: a concurrent destroy of the same handle either loses the
        // `latch_destroy` race below (and returns `Ok`, having done
        // nothing) or also observes pending children and retries. There
        // is no window where DESTROY is set, then cleared, then
        // observable by another thread as "fresh" — see DESIGN.md's
        // resolution of the upstream destroy/children race.
        if was_ready && graph::destroy_children(self, handle) > 0 {
            return Err(HandleError::PendingChildren);
        }

        if !slot.latch_destroy() {
            return Ok(());
        }

        graph::detach_from_parent(self, slot);

        let data = slot.release();
        group.release(handle.slot_index());
        log::debug!("destroy: {handle}");

        if let (Some(deinit), Some(payload)) = (data.deinit, data.payload) {
            deinit(payload);
        }
        Ok(())
    }

    /// One-shot parent assignment: `child` may not already have a
    /// parent. See [`crate::graph::set_parent`] for the lock-ordering
    /// discipline this uses to stay deadlock-free against a concurrent
    /// `set_parent`/`destroy` on the same pair of handles.
    pub fn set_parent(&self, child: HandleId, parent: HandleId) -> Result<()> {
        graph::set_parent(self, child, parent)
    }

    /// Direct children of `parent`, i.e. every live handle whose
    /// `set_parent` target is exactly `parent`.
    pub fn children(&self, parent: HandleId) -> Result<Vec<HandleId>> {
        self.resolve(parent)?;
        Ok(graph::children_of(self, parent))
    }

    /// Tear `handle` down unconditionally, skipping the refcount drain
    /// and the `PENDING_CHILDREN` check `destroy` otherwise enforces.
    ///
    /// Only sound when nothing else can be concurrently holding a
    /// reference into this handle or any of its children, which is why
    /// this is `pub(crate)`: the only caller is
    /// [`crate::enumerate::shutdown_sweep`], and only when the registry
    /// was built with [`RegistryConfig::with_single_threaded`].
    pub(crate) fn force_destroy(&self, handle: HandleId) -> Result<()> {
        if handle.is_null() {
            return Ok(());
        }
        let (group, slot) = self.resolve(handle)?;
        if slot.flags().is_empty() {
            return Ok(());
        }
        self.validate(slot, handle)?;

        graph::detach_from_parent(self, slot);
        let data = slot.release();
        group.release(handle.slot_index());
        log::warn!("force_destroy: {handle} (single-threaded shutdown sweep)");

        if let (Some(deinit), Some(payload)) = (data.deinit, data.payload) {
            deinit(payload);
        }
        Ok(())
    }

    /// Render `handle`'s payload via its registered `describe_cb`, or
    /// [`crate::callback::default_describe`] if none was supplied.
    pub fn describe(&self, handle: HandleId) -> Result<String> {
        let (_, slot) = self.resolve(handle)?;
        self.validate(slot, handle)?;
        slot.with_data(|data| {
            let payload = data.payload.as_ref().ok_or(HandleError::Invalid(handle))?;
            let mut out = String::new();
            match &data.describe {
                Some(describe) => describe(payload, &mut out),
                None => crate::callback::default_describe(payload, &mut out),
            }
            Ok(out)
        })
    }

    /// The external arena tag associated with `handle` at `alloc` time.
    pub fn arena_tag(&self, handle: HandleId) -> Result<ArenaTag> {
        let (_, slot) = self.resolve(handle)?;
        self.validate(slot, handle)?;
        Ok(slot.with_data(|d| d.arena_tag))
    }

    pub(crate) fn for_each_group(&self, mut f: impl FnMut(&Group)) {
        for id in 0..self.group_count() {
            if let Some(group) = self.groups[id as usize].get() {
                f(group);
            }
        }
    }

    pub(crate) fn slot_data<R>(&self, slot: &Slot, f: impl FnOnce(&mut SlotData) -> R) -> R {
        slot.with_data(f)
    }

    /// Every live handle in the registry, in no particular order.
    pub fn enumerate(&self) -> Vec<HandleId> {
        crate::enumerate::enumerate(self)
    }

    /// Every live handle of exactly `ty`.
    pub fn enumerate_type(&self, ty: TypeId) -> Vec<HandleId> {
        crate::enumerate::enumerate_type(self, ty)
    }

    /// Number of live handles across the whole registry.
    pub fn count(&self) -> usize {
        crate::enumerate::count(self)
    }

    /// Tear down every remaining handle. See
    /// [`crate::enumerate::shutdown_sweep`].
    pub fn shutdown_sweep(&self) -> crate::enumerate::ShutdownReport {
        crate::enumerate::shutdown_sweep(self)
    }
}

/// RAII guard returned by [`HandleRegistry::get`]. Dropping it (or
/// calling [`HandleRegistry::put`] on it) decrements the slot's
/// refcount exactly once.
pub struct PayloadGuard<'a, T> {
    slot: &'a Slot,
    handle: HandleId,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T> std::fmt::Debug for PayloadGuard<'a, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadGuard")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl<'a, T: Any + Send + Sync> PayloadGuard<'a, T> {
    /// The handle this guard was checked out for.
    pub fn handle(&self) -> HandleId {
        self.handle
    }
}

impl<'a, T: Any + Send + Sync> std::ops::Deref for PayloadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety argument, not an `unsafe` block: we never hand out this
        // guard unless the slot's payload already downcast to `T` (see
        // `HandleRegistry::get`), the slot array is never reallocated
        // after `Group::new`, and the payload cannot be replaced or
        // freed while any refcount is outstanding (`destroy` requires
        // `set_notready` to drain to zero first). We still go through
        // the mutex on every deref rather than caching a raw pointer, to
        // stay within safe Rust; `parking_lot::Mutex` is cheap enough
        // uncontended that this does not reintroduce the cost the
        // fast-path flag word exists to avoid.
        self.slot.with_data(|d| {
            let payload: &Payload = d.payload.as_ref().expect("payload present while refcount held");
            let reference: &T = payload.downcast_ref().expect("type already validated at get()");
            let reference: *const T = reference;
            // Extend the borrow to the guard's lifetime: sound because the
            // referent cannot move or be dropped until this guard's `put`
            // (refcount decrement) makes that possible again.
            unsafe { &*reference }
        })
    }
}

impl<'a, T> Drop for PayloadGuard<'a, T> {
    fn drop(&mut self) {
        self.slot.put_ref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{GroupId, USER_GROUP_START};

    fn ty() -> TypeId {
        TypeId::make(GroupId::new(USER_GROUP_START).unwrap(), 1)
    }

    #[test]
    fn alloc_set_ready_get_put_roundtrip() {
        let reg = HandleRegistry::new();
        let h = reg.alloc(ty(), 42u32, None, None).unwrap();
        assert!(reg.get::<u32>(ty(), h).is_err(), "not ready yet");
        reg.set_ready(h).unwrap();

        let guard = reg.get::<u32>(ty(), h).unwrap();
        assert_eq!(*guard, 42);
        drop(guard);
        assert_eq!(reg.refcount(h).unwrap(), 0);
    }

    #[test]
    fn refcount_tracks_outstanding_gets() {
        let reg = HandleRegistry::new();
        let h = reg.alloc(ty(), 1u32, None, None).unwrap();
        reg.set_ready(h).unwrap();

        let g1 = reg.get::<u32>(ty(), h).unwrap();
        let g2 = reg.get::<u32>(ty(), h).unwrap();
        let g3 = reg.get::<u32>(ty(), h).unwrap();
        assert_eq!(reg.refcount(h).unwrap(), 3);
        drop(g1);
        drop(g2);
        drop(g3);
        assert_eq!(reg.refcount(h).unwrap(), 0);
    }

    #[test]
    fn destroy_then_get_is_invalid() {
        let reg = HandleRegistry::new();
        let h = reg.alloc(ty(), 1u32, None, None).unwrap();
        reg.set_ready(h).unwrap();
        reg.set_notready(h).unwrap();
        reg.destroy(h).unwrap();

        let result = reg.get::<u32>(ty(), h);
        match result {
            Err(HandleError::Invalid(_)) | Err(HandleError::SequenceMismatch { .. }) => {}
            other => panic!("expected invalid/sequence-mismatch, got {other:?}"),
        }
    }

    #[test]
    fn destroy_runs_deinit_exactly_once() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let reg = HandleRegistry::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = counter.clone();
        let deinit: DeinitFn = Box::new(move |_payload| {
            counter2.fetch_add(1, Ordering::SeqCst);
        });

        let h = reg.alloc(ty(), 1u32, Some(deinit), None).unwrap();
        reg.set_ready(h).unwrap();
        reg.destroy(h).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        reg.destroy(h).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1, "deinit must not run twice");
    }

    #[test]
    fn destroy_is_a_no_op_on_null() {
        let reg = HandleRegistry::new();
        reg.destroy(HandleId::null()).unwrap();
    }

    #[test]
    fn alloc_reuses_released_slots_with_new_sequence() {
        let reg = HandleRegistry::new();
        let h1 = reg.alloc(ty(), 1u32, None, None).unwrap();
        reg.destroy(h1).unwrap();
        let h2 = reg.alloc(ty(), 2u32, None, None).unwrap();
        assert_eq!(h1.slot_index(), h2.slot_index());
        assert_ne!(h1.sequence(), h2.sequence());
    }

    #[test]
    fn describe_falls_back_to_default() {
        let reg = HandleRegistry::new();
        let h = reg.alloc(ty(), 1u32, None, None).unwrap();
        let text = reg.describe(h).unwrap();
        assert!(!text.is_empty());
    }
}
