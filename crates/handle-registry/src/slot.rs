// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-slot state machine.
//!
//! # Memory ordering strategy
//!
//! Grounded on `ShmSlot` in the teacher's shared-memory transport
//! (`transport/shm/slot.rs`): a fast-path atomic word carries the
//! phase flags so readers can check readiness without taking the slot's
//! mutex, while **Release** on every write that changes what `state`
//! means (reservation, ready, not-ready, destroy-latch) pairs with
//! **Acquire** on every read that branches on it. This establishes the
//! happens-before chain `spec.md` #5 requires: a successful `set_ready`
//! happens-before any `get` that observes `READY`, which happens-before
//! the matching `put`, which happens-before `set_notready` returning.
//!
//! The slower path — anything that touches the payload, callbacks,
//! parent link, or debug metadata — goes through `data`, a
//! `parking_lot::Mutex`. `parking_lot` already implements an adaptive
//! spin-then-park strategy for contended locks, which is the "slot lock
//! acquisition may spin with exponential backoff" policy from `spec.md`
//! #5 — so the slot does not hand-roll its own spin loop for this part.
//! The dedicated, spec-mandated backoff loop lives in
//! [`crate::group::Group::reserve`] (the CAS-based reservation scan) and
//! in [`crate::registry::HandleRegistry::set_notready`] (the refcount
//! drain wait), both of which need a bespoke wait policy rather than a
//! generic mutex.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::callback::{DeinitFn, DescribeFn, Payload};
use crate::flags::{self, SlotFlags};
use crate::ids::{HandleId, TypeId};

/// Observable phase of a slot, derived from its flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// `sequence == 0`; slot is unused (invariant 1, `spec.md` #3).
    Free,
    /// Reserved, payload adopted, not yet (or no longer) ready for `get`.
    AllocatedNotReady,
    /// Reserved and ready for `get`.
    AllocatedReady,
    /// `DESTROY` latched; teardown in progress or complete pending release.
    AllocatedDestroying,
}

/// Opaque tag handed back by [`crate::enumerate`]'s `pool()` equivalent:
/// whatever external arena identity the caller associated with a slot at
/// `alloc` time (see SPEC_FULL.md #4.F — this crate does not implement a
/// pool allocator itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaTag(pub u64);

/// Fields mutated under the slot's mutex: everything except the fast-path
/// flag word and the refcount.
pub(crate) struct SlotData {
    pub sequence: u16,
    pub ty: Option<TypeId>,
    pub size: usize,
    pub payload: Option<Payload>,
    pub parent: Option<HandleId>,
    pub deinit: Option<DeinitFn>,
    pub describe: Option<DescribeFn>,
    pub arena_tag: ArenaTag,
    #[cfg(feature = "debug-metadata")]
    pub alloc_site: &'static std::panic::Location<'static>,
    #[cfg(feature = "debug-metadata")]
    pub last_get_site: Option<&'static std::panic::Location<'static>>,
}

impl Default for SlotData {
    fn default() -> Self {
        Self {
            sequence: 0,
            ty: None,
            size: 0,
            payload: None,
            parent: None,
            deinit: None,
            describe: None,
            arena_tag: ArenaTag::default(),
            #[cfg(feature = "debug-metadata")]
            alloc_site: std::panic::Location::caller(),
            #[cfg(feature = "debug-metadata")]
            last_get_site: None,
        }
    }
}

/// One reusable record within a group.
pub(crate) struct Slot {
    /// Fast-path flag word: `SlotFlags` bits, `Acquire`/`Release` only.
    state: AtomicU8,
    /// Outstanding `get`s not yet matched by `put`.
    refcount: AtomicU32,
    /// Number of live slots naming this one as `parent`. A hint only —
    /// mutated without taking `data`'s lock so a child's destroy never
    /// has to lock its parent while the parent's own destroy holds it,
    /// which would otherwise require the ascending-address ordering
    /// `spec.md` #4.E describes for `set_parent` to also cover teardown.
    /// The authoritative check for "any children left" is
    /// [`crate::graph`]'s scan over `parent` links, not this counter.
    child_count: AtomicU32,
    data: Mutex<SlotData>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(0),
            refcount: AtomicU32::new(0),
            child_count: AtomicU32::new(0),
            data: Mutex::new(SlotData::default()),
        }
    }
}

impl Slot {
    /// Current flags, observed with `Acquire`.
    pub fn flags(&self) -> SlotFlags {
        SlotFlags::from_bits(self.state.load(Ordering::Acquire))
    }

    /// Coarse-grained state derived from the current flags.
    pub fn state(&self) -> SlotState {
        let f = self.flags();
        if f.is_empty() {
            SlotState::Free
        } else if f.contains(flags::DESTROY) {
            SlotState::AllocatedDestroying
        } else if f.contains(flags::READY) {
            SlotState::AllocatedReady
        } else {
            SlotState::AllocatedNotReady
        }
    }

    /// Attempt the `FREE -> ALLOCATED_NOT_READY` reservation with a
    /// single CAS on the flag word. Returns `true` on success.
    ///
    /// Grounded on the teacher's `Pool::try_reserve` bitmap CAS
    /// (`core/rt/slabpool.rs`): here the "bit" being claimed is this
    /// whole slot's flag word rather than one bit in a shared bitmap, so
    /// a plain `compare_exchange` from `0` suffices.
    pub fn try_reserve(&self) -> bool {
        self.state
            .compare_exchange(
                0,
                flags::ALLOCATED | flags::NOT_READY,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Populate a freshly reserved slot. Caller must have just succeeded
    /// at [`Slot::try_reserve`].
    ///
    /// `#[track_caller]` so that, under the `debug-metadata` feature,
    /// `alloc_site` records the application's real call site rather than
    /// this function's own. The attribute must be chained all the way up
    /// through `alloc_erased`/`alloc_tagged`/`alloc` for that to hold.
    #[track_caller]
    pub fn populate(
        &self,
        sequence: u16,
        ty: TypeId,
        size: usize,
        payload: Payload,
        deinit: Option<DeinitFn>,
        describe: Option<DescribeFn>,
        arena_tag: ArenaTag,
    ) {
        let mut data = self.data.lock();
        data.sequence = sequence;
        data.ty = Some(ty);
        data.size = size;
        data.payload = Some(payload);
        data.parent = None;
        self.child_count.store(0, Ordering::Release);
        data.deinit = deinit;
        data.describe = describe;
        data.arena_tag = arena_tag;
        #[cfg(feature = "debug-metadata")]
        {
            data.alloc_site = std::panic::Location::caller();
            data.last_get_site = None;
        }
    }

    /// `ALLOCATED_NOT_READY -> ALLOCATED_READY`. One-shot: fails if
    /// `READY` is already set.
    pub fn set_ready(&self) -> bool {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if cur & flags::READY != 0 || cur & flags::ALLOCATED == 0 {
                return false;
            }
            let new = (cur & !flags::NOT_READY) | flags::READY;
            match self
                .state
                .compare_exchange_weak(cur, new, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// `ALLOCATED_READY -> ALLOCATED_NOT_READY`. Idempotent: returns
    /// `true` whether or not `READY` was actually set.
    pub fn latch_not_ready(&self) {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            let new = (cur & !flags::READY) | flags::NOT_READY;
            if new == cur {
                return;
            }
            match self
                .state
                .compare_exchange_weak(cur, new, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Latch `DESTROY`. Returns `false` if it was already latched
    /// (idempotence — repeated `destroy` calls are a no-op).
    pub fn latch_destroy(&self) -> bool {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if cur & flags::DESTROY != 0 {
                return false;
            }
            let new = cur | flags::DESTROY;
            match self
                .state
                .compare_exchange_weak(cur, new, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// `ALLOCATED_DESTROYING -> FREE`: clear every field and the flag
    /// word. Returns the torn-down data for the caller to run
    /// `deinit_cb` on and release the slot index back to the group.
    pub fn release(&self) -> SlotData {
        let mut data = self.data.lock();
        let released = std::mem::take(&mut *data);
        drop(data);
        self.state.store(0, Ordering::Release);
        self.refcount.store(0, Ordering::Release);
        self.child_count.store(0, Ordering::Release);
        released
    }

    /// Current refcount.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// The call site recorded by [`Slot::populate`] when this slot was
    /// allocated, for leak/escalation diagnostics. `None` when the
    /// `debug-metadata` feature is off.
    pub fn alloc_site(&self) -> Option<&'static std::panic::Location<'static>> {
        #[cfg(feature = "debug-metadata")]
        {
            Some(self.with_data(|d| d.alloc_site))
        }
        #[cfg(not(feature = "debug-metadata"))]
        {
            None
        }
    }

    /// The call site recorded by the last successful `get` on this slot,
    /// for `set_notready`'s escalation diagnostic. `None` when the
    /// `debug-metadata` feature is off, or when no `get` has happened
    /// since the slot was last allocated.
    pub fn last_get_site(&self) -> Option<&'static std::panic::Location<'static>> {
        #[cfg(feature = "debug-metadata")]
        {
            self.with_data(|d| d.last_get_site)
        }
        #[cfg(not(feature = "debug-metadata"))]
        {
            None
        }
    }

    /// Current child hint count.
    pub fn child_count(&self) -> u32 {
        self.child_count.load(Ordering::Acquire)
    }

    /// Record that a live slot now names this one as parent.
    pub fn inc_child_count(&self) {
        self.child_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Record that a child naming this slot as parent was destroyed.
    pub fn dec_child_count(&self) {
        let _ = self
            .child_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)));
    }

    /// Increment the refcount (a checked-out `get`).
    pub fn get_ref(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the refcount (a matching `put`). Saturates at zero
    /// rather than panicking on an unmatched `put` — the caller
    /// (`registry::put`) is responsible for not calling this without a
    /// matching `get`.
    pub fn put_ref(&self) -> u32 {
        let prev = self.refcount.fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
            Some(r.saturating_sub(1))
        });
        prev.unwrap_or(0).saturating_sub(1)
    }

    /// Run a closure against the locked data, for operations that need
    /// several fields consistently (sequence/type validation, parent
    /// assignment, `describe`).
    pub fn with_data<R>(&self, f: impl FnOnce(&mut SlotData) -> R) -> R {
        let mut data = self.data.lock();
        f(&mut data)
    }
}
