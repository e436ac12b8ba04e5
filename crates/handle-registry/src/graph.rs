// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Parent/child ownership graph.
//!
//! A slot's `parent` link is one-shot: once set it cannot be
//! reassigned, and it is cleared only by [`crate::slot::Slot::release`]
//! tearing the whole slot down. There is no reverse adjacency list —
//! "who are `p`'s children" is answered by scanning every slot for
//! `parent == Some(p)`, exactly as the teacher's `EntityFactory`
//! resolves `children_of` by walking its flat component table rather
//! than maintaining per-entity child lists (`core/ecs/entity.rs`).
//! `Slot::child_count` is a best-effort hint derived alongside that
//! scan, consulted by nothing on the correctness path.
//!
//! # Lock ordering
//!
//! [`set_parent`] must briefly hold both the child's and the parent's
//! slot lock to check-then-set atomically against a concurrent
//! `set_parent` or `destroy` race. Two slots are always locked in
//! ascending address order (`spec.md` #4.E), which is sufficient to
//! rule out deadlock as long as every other place that might hold two
//! slot locks at once (there is exactly one: this function) agrees on
//! the same order.

use crate::error::{HandleError, Result};
use crate::ids::HandleId;
use crate::registry::HandleRegistry;
use crate::slot::{Slot, SlotData};

/// Assign `parent` as the one-shot owner of `child`. Fails with
/// [`HandleError::ParentAlreadySet`] if `child` already has a parent.
pub(crate) fn set_parent(registry: &HandleRegistry, child: HandleId, parent: HandleId) -> Result<()> {
    if child.is_null() || parent.is_null() {
        return Err(HandleError::InvalidRequest("set_parent requires two non-null handles"));
    }
    if child == parent {
        return Err(HandleError::InvalidRequest("a handle cannot be its own parent"));
    }

    let (_, child_slot) = registry.resolve(child)?;
    registry.validate(child_slot, child)?;
    let (_, parent_slot) = registry.resolve(parent)?;
    registry.validate(parent_slot, parent)?;

    let assign = |data: &mut SlotData| -> Result<()> {
        match data.parent {
            Some(existing) => Err(HandleError::ParentAlreadySet { slot: child, existing_parent: existing }),
            None => {
                data.parent = Some(parent);
                Ok(())
            }
        }
    };

    let child_addr = child_slot as *const Slot as usize;
    let parent_addr = parent_slot as *const Slot as usize;

    let result = if child_addr < parent_addr {
        child_slot.with_data(|child_data| parent_slot.with_data(|_parent_data| assign(child_data)))
    } else {
        parent_slot.with_data(|_parent_data| child_slot.with_data(assign))
    };

    if result.is_ok() {
        parent_slot.inc_child_count();
        log::debug!("set_parent: {child} -> {parent}");
    }
    result
}

/// Destroy every live child of `parent` that currently has a zero
/// refcount, recursively; children with outstanding `get`s are left
/// alone. Returns the number of children still blocking destruction,
/// either because their own refcount is nonzero or because they in
/// turn have pending children of their own.
///
/// Deliberately does not drain a busy child: `set_notready` blocks
/// until a slot's refcount reaches zero, and cascading into that wait
/// here would turn `destroy(parent)` into an unbounded block on
/// whichever unrelated thread is holding the child open. A child is
/// only ever recursively destroyed once its own refcount is already
/// zero, so that recursive call's own drain step resolves instantly.
///
/// Called before `parent`'s own `DESTROY` flag is latched, so a
/// concurrent `destroy(parent)` either loses the `latch_destroy` race
/// afterward or independently observes the same pending count — there
/// is no intermediate state visible to other threads.
pub(crate) fn destroy_children(registry: &HandleRegistry, parent: HandleId) -> usize {
    let mut pending = 0usize;
    registry.for_each_group(|group| {
        group.for_each_allocated(|index, slot| {
            let is_child = slot.with_data(|d| d.parent == Some(parent));
            if !is_child {
                return;
            }
            if slot.refcount() > 0 {
                pending += 1;
                return;
            }
            let Some(child_handle) = slot.with_data(|d| d.ty.map(|ty| HandleId::make(ty, d.sequence, index))) else {
                return;
            };

            match registry.destroy(child_handle) {
                Ok(()) => {}
                Err(HandleError::PendingChildren) => pending += 1,
                Err(_) => {}
            }
        });
    });
    pending
}

/// Direct children of `parent`: every live slot naming it as parent.
pub(crate) fn children_of(registry: &HandleRegistry, parent: HandleId) -> Vec<HandleId> {
    let mut out = Vec::new();
    registry.for_each_group(|group| {
        group.for_each_allocated(|index, slot| {
            let child = slot.with_data(|d| {
                (d.parent == Some(parent)).then(|| HandleId::make(d.ty.expect("allocated slot has a type"), d.sequence, index))
            });
            if let Some(handle) = child {
                out.push(handle);
            }
        });
    });
    out
}

/// Decrement the child-count hint on `slot`'s recorded parent, if any
/// and if that parent has not itself already been reused. Called while
/// tearing a slot down, before its fields are cleared.
pub(crate) fn detach_from_parent(registry: &HandleRegistry, slot: &Slot) {
    let Some(parent) = slot.with_data(|d| d.parent) else {
        return;
    };
    if let Ok((_, parent_slot)) = registry.resolve(parent) {
        let still_live = parent_slot.with_data(|d| d.sequence == parent.sequence());
        if still_live {
            parent_slot.dec_child_count();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{GroupId, TypeId, USER_GROUP_START};

    fn ty() -> TypeId {
        TypeId::make(GroupId::new(USER_GROUP_START).unwrap(), 1)
    }

    #[test]
    fn set_parent_is_one_shot() {
        let reg = HandleRegistry::new();
        let parent = reg.alloc(ty(), 1u32, None, None).unwrap();
        let child = reg.alloc(ty(), 2u32, None, None).unwrap();
        let other = reg.alloc(ty(), 3u32, None, None).unwrap();

        reg.set_parent(child, parent).unwrap();
        let err = reg.set_parent(child, other).unwrap_err();
        assert!(matches!(err, HandleError::ParentAlreadySet { .. }));
    }

    #[test]
    fn rejects_self_parent() {
        let reg = HandleRegistry::new();
        let h = reg.alloc(ty(), 1u32, None, None).unwrap();
        assert!(reg.set_parent(h, h).is_err());
    }

    #[test]
    fn cascade_destroy_removes_children_first() {
        let reg = HandleRegistry::new();
        let parent = reg.alloc(ty(), 1u32, None, None).unwrap();
        let child = reg.alloc(ty(), 2u32, None, None).unwrap();
        reg.set_parent(child, parent).unwrap();
        // The children walk only runs for a parent that is still READY
        // when `destroy` is called (see
        // `registry.rs::HandleRegistry::destroy`).
        reg.set_ready(parent).unwrap();

        reg.destroy(parent).unwrap();
        assert!(reg.enumerate().iter().all(|h| *h != child && *h != parent));
    }

    #[test]
    fn children_lists_direct_children_only() {
        let reg = HandleRegistry::new();
        let parent = reg.alloc(ty(), 1u32, None, None).unwrap();
        let c1 = reg.alloc(ty(), 2u32, None, None).unwrap();
        let c2 = reg.alloc(ty(), 3u32, None, None).unwrap();
        let grandchild = reg.alloc(ty(), 4u32, None, None).unwrap();
        reg.set_parent(c1, parent).unwrap();
        reg.set_parent(c2, parent).unwrap();
        reg.set_parent(grandchild, c1).unwrap();

        let mut kids = reg.children(parent).unwrap();
        kids.sort_by_key(|h| h.raw());
        let mut expected = vec![c1, c2];
        expected.sort_by_key(|h| h.raw());
        assert_eq!(kids, expected);
    }

    #[test]
    fn destroy_pending_while_child_held_open() {
        let reg = HandleRegistry::new();
        let parent = reg.alloc(ty(), 1u32, None, None).unwrap();
        let child = reg.alloc(ty(), 2u32, None, None).unwrap();
        reg.set_parent(child, parent).unwrap();
        // The children walk only runs for a parent that is still READY
        // when `destroy` is called (see
        // `registry.rs::HandleRegistry::destroy`).
        reg.set_ready(parent).unwrap();
        reg.set_ready(child).unwrap();

        let guard = reg.get::<u32>(ty(), child).unwrap();
        let err = reg.destroy(parent).unwrap_err();
        assert!(matches!(err, HandleError::PendingChildren));
        drop(guard);

        reg.destroy(parent).unwrap();
    }
}
