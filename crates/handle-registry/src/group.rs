// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Group allocator: reservation and release of slots within one
//! statically sized [`crate::ids::GroupId`], plus the two-level
//! occupancy bitmap used to fast-skip empty regions during enumeration.
//!
//! Grounded on `Pool::try_reserve`/`release_slot` in the teacher's
//! lock-free slab allocator (`core/rt/slabpool.rs`): both implement
//! reservation as `loop { load Acquire; compute candidate; CAS
//! Release/Relaxed; retry on failure }` over an atomic bitmap. The slab
//! pool's bitmap fits in one `AtomicU64` because it only ever tracks 64
//! slots; a group here must address up to [`crate::ids::MAX_SLOTS`]
//! slots, so the reservation bit lives in each [`Slot`]'s own flag word
//! (see [`crate::slot::Slot::try_reserve`]) and the bitmaps in this file
//! are demoted to what `spec.md` #3 calls them: "fast-skip hints", one
//! bit per 32-slot chunk and one bit per 32-chunk page, consulted only by
//! [`Group::next_allocated`].

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use crossbeam::utils::Backoff;

use crate::ids::{GroupId, MAX_SLOTS};
use crate::slot::Slot;

const SLOTS_PER_CHUNK: u32 = 32;
const CHUNKS_PER_PAGE: u32 = 32;
const SLOTS_PER_PAGE: u32 = SLOTS_PER_CHUNK * CHUNKS_PER_PAGE;

fn div_ceil(n: u32, d: u32) -> u32 {
    (n + d - 1) / d
}

/// A statically allocated collection of slots sharing one [`GroupId`].
pub(crate) struct Group {
    id: GroupId,
    slots: Box<[Slot]>,
    /// 32-bit internal counter; truncated to `u16` (skipping zero) when
    /// stamped into a handle — see DESIGN.md, Open Question 2.
    sequence: AtomicU32,
    next_free: AtomicU16,
    chunk_bitmap: Box<[AtomicU32]>,
    page_bitmap: Box<[AtomicU32]>,
}

impl Group {
    pub fn new(id: GroupId) -> Self {
        let slot_count = MAX_SLOTS as usize;
        let slots = (0..slot_count).map(|_| Slot::default()).collect::<Vec<_>>().into_boxed_slice();

        let chunk_words = div_ceil(div_ceil(MAX_SLOTS, SLOTS_PER_CHUNK), 32) as usize;
        let page_words = div_ceil(div_ceil(MAX_SLOTS, SLOTS_PER_PAGE), 32) as usize;

        Self {
            id,
            slots,
            sequence: AtomicU32::new(u32::from(random_nonzero_seed())),
            next_free: AtomicU16::new(1),
            chunk_bitmap: (0..chunk_words).map(|_| AtomicU32::new(0)).collect(),
            page_bitmap: (0..page_words).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn slot(&self, index: u16) -> Option<&Slot> {
        if index == 0 {
            return None;
        }
        self.slots.get(index as usize)
    }

    /// Next sequence to stamp into a newly reserved slot. Skips zero on
    /// wraparound (invariant: a handle's sequence is never zero).
    pub fn next_sequence(&self) -> u16 {
        loop {
            let next = self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            let truncated = next as u16;
            if truncated != 0 {
                return truncated;
            }
            // Wrapped exactly onto zero; the next fetch_add will move past it.
        }
    }

    /// Reserve a free slot, starting the scan from this group's current
    /// `next_free` hint (the index most recently released, or `1` if
    /// nothing has been released yet).
    pub fn reserve_any(&self) -> Option<(u16, &Slot)> {
        self.reserve(self.next_free.load(Ordering::Relaxed))
    }

    /// Reserve a free slot, scanning from `max(start_hint, 1)`. Restarts
    /// the scan at 1 if nothing is found past the hint, exactly once,
    /// before giving up with `None` (`HANDLE_NO_MORE_SLOTS`).
    pub fn reserve(&self, start_hint: u16) -> Option<(u16, &Slot)> {
        let total = self.slots.len() as u32;
        let start = u32::from(start_hint).max(1);

        if let Some(found) = self.scan_for_free(start, total) {
            return Some(found);
        }

        if start > 1 {
            // Nothing past the hint; restart from the beginning. A short
            // backoff here avoids every thread thrashing the same
            // doomed hint simultaneously under heavy contention.
            let backoff = Backoff::new();
            backoff.spin();
            if let Some(found) = self.scan_for_free(1, start) {
                return Some(found);
            }
        }

        None
    }

    fn scan_for_free(&self, from: u32, to: u32) -> Option<(u16, &Slot)> {
        for idx in from..to {
            let slot = &self.slots[idx as usize];
            if slot.try_reserve() {
                let index = idx as u16;
                self.mark_allocated(index);
                self.next_free.store(index, Ordering::Relaxed);
                return Some((index, slot));
            }
        }
        None
    }

    /// Return a slot to the free pool: clears its fields (via
    /// [`Slot::release`], called by the registry before this) and
    /// updates the occupancy bitmaps plus the `next_free` hint.
    pub fn release(&self, slot_index: u16) {
        self.mark_free(slot_index);
        self.next_free.store(slot_index, Ordering::Relaxed);
    }

    /// Find the next allocated slot at or after `from`, consulting the
    /// two-level bitmap to skip whole empty pages/chunks. Returns `None`
    /// once the group is exhausted.
    pub fn next_allocated(&self, from: u16) -> Option<u16> {
        let total = self.slots.len() as u32;
        let mut idx = u32::from(from);

        while idx < total {
            let page = idx / SLOTS_PER_PAGE;
            if !self.page_occupied(page) {
                idx = (page + 1) * SLOTS_PER_PAGE;
                continue;
            }

            let chunk = idx / SLOTS_PER_CHUNK;
            if !self.chunk_occupied(chunk) {
                idx = (chunk + 1) * SLOTS_PER_CHUNK;
                continue;
            }

            if idx != 0 && !self.slots[idx as usize].flags().is_empty() {
                return Some(idx as u16);
            }
            idx += 1;
        }
        None
    }

    fn mark_allocated(&self, slot_index: u16) {
        set_bit(&self.chunk_bitmap, (u32::from(slot_index) / SLOTS_PER_CHUNK) as usize);
        let chunk = u32::from(slot_index) / SLOTS_PER_CHUNK;
        set_bit(&self.page_bitmap, (chunk / CHUNKS_PER_PAGE) as usize);
    }

    fn mark_free(&self, slot_index: u16) {
        // A chunk/page bit only clears once every slot inside it is free;
        // re-derive occupancy from the slots themselves rather than
        // tracking a count, keeping the bitmap a pure hint with no
        // separate state that could drift from the slots it describes.
        let chunk = u32::from(slot_index) / SLOTS_PER_CHUNK;
        let chunk_start = chunk * SLOTS_PER_CHUNK;
        let chunk_end = (chunk_start + SLOTS_PER_CHUNK).min(self.slots.len() as u32);
        let chunk_occupied = (chunk_start..chunk_end).any(|i| !self.slots[i as usize].flags().is_empty());
        if !chunk_occupied {
            clear_bit(&self.chunk_bitmap, chunk as usize);

            let page = chunk / CHUNKS_PER_PAGE;
            let page_chunk_start = page * CHUNKS_PER_PAGE;
            let page_chunk_end = (page_chunk_start + CHUNKS_PER_PAGE).min(self.chunk_bitmap.len() as u32);
            let page_occupied = (page_chunk_start..page_chunk_end).any(|c| bit_set(&self.chunk_bitmap, c as usize));
            if !page_occupied {
                clear_bit(&self.page_bitmap, page as usize);
            }
        }
    }

    /// Visit every currently allocated slot in ascending index order,
    /// consulting the occupancy bitmap to skip empty regions. Shared by
    /// [`crate::graph`] and [`crate::enumerate`] so the bitmap-walk
    /// logic lives in exactly one place.
    pub fn for_each_allocated(&self, mut f: impl FnMut(u16, &Slot)) {
        let total = self.slots.len() as u32;
        let mut from: u32 = 1;
        while from < total {
            let Some(found) = self.next_allocated(from as u16) else {
                break;
            };
            f(found, &self.slots[found as usize]);
            from = u32::from(found) + 1;
        }
    }

    fn chunk_occupied(&self, chunk: u32) -> bool {
        bit_set(&self.chunk_bitmap, chunk as usize)
    }

    fn page_occupied(&self, page: u32) -> bool {
        bit_set(&self.page_bitmap, page as usize)
    }
}

fn word_and_bit(index: usize) -> (usize, u32) {
    (index / 32, (index % 32) as u32)
}

fn set_bit(words: &[AtomicU32], index: usize) {
    let (word, bit) = word_and_bit(index);
    if let Some(w) = words.get(word) {
        w.fetch_or(1 << bit, Ordering::Release);
    }
}

fn clear_bit(words: &[AtomicU32], index: usize) {
    let (word, bit) = word_and_bit(index);
    if let Some(w) = words.get(word) {
        w.fetch_and(!(1 << bit), Ordering::Release);
    }
}

fn bit_set(words: &[AtomicU32], index: usize) -> bool {
    let (word, bit) = word_and_bit(index);
    words.get(word).is_some_and(|w| w.load(Ordering::Acquire) & (1 << bit) != 0)
}

/// A non-zero pseudorandom 16-bit seed, per `spec.md` #3 ("initialized at
/// startup to a non-zero pseudorandom 16-bit value"). Uses the per-process
/// random state `std::collections::hash_map::RandomState` already draws
/// from the OS, rather than adding a dedicated RNG dependency the teacher
/// stack doesn't carry at runtime (it only appears as a dev-dependency,
/// for benchmarks).
fn random_nonzero_seed() -> u16 {
    let hash = RandomState::new().build_hasher().finish();
    let seed = hash as u16;
    if seed == 0 {
        1
    } else {
        seed
    }
}
