// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Identifier codec: packs `(group_id, type_index, sequence, slot_index)`
//! into a single 64-bit opaque [`HandleId`].
//!
//! Bit layout (ABI, endian-neutral — see module docs on why this is
//! pure bit-field math rather than `#[repr(C)]`):
//!
//! ```text
//! bits 63..48 : group_id       (u16)
//! bits 47..32 : type_index     (u16)
//! bits 31..16 : slot_sequence  (u16)
//! bits 15..0  : slot_index     (u16)
//! ```
//!
//! Grounded on `SlabHandle` in the teacher's lock-free slab allocator
//! (`pool_id << 16 | slot_id`, with `pool_id()`/`slot_id()` accessors):
//! the same shift-and-mask idiom, generalized from one 32-bit pair to
//! four 16-bit fields.

use std::fmt;

/// Number of statically allocated groups. The first [`USER_GROUP_START`]
/// ids are reserved for the library itself.
pub const MAX_GROUPS: u16 = 20;

/// First group id available to user code.
pub const USER_GROUP_START: u16 = 10;

/// Number of slots per group (index 0 is never handed out).
pub const MAX_SLOTS: u32 = 65535;

/// A statically allocated group id, `[0, MAX_GROUPS)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub(crate) u16);

impl GroupId {
    /// Construct a group id, rejecting anything outside `[0, MAX_GROUPS)`.
    pub fn new(id: u16) -> Option<Self> {
        (id < MAX_GROUPS).then_some(Self(id))
    }

    /// Raw numeric value.
    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

/// A full 32-bit type, combining a group id and a type index within that
/// group: `type = (group_id << 16) | type_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(u32);

impl TypeId {
    /// Pack a group id and a type index into a type.
    pub fn make(group: GroupId, type_index: u16) -> Self {
        Self((u32::from(group.0) << 16) | u32::from(type_index))
    }

    /// The group this type was registered in.
    pub fn group(self) -> GroupId {
        GroupId((self.0 >> 16) as u16)
    }

    /// The type index within [`TypeId::group`].
    pub fn type_index(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Raw 32-bit value, for ABI interop.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Reconstruct a type from its raw 32-bit value.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type({}, idx={})", self.group(), self.type_index())
    }
}

/// An opaque 64-bit handle. The null handle (`0`) is reserved and is
/// rejected by every operation that consumes a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

impl HandleId {
    /// The reserved null handle.
    pub const NULL: Self = Self(0);

    /// The null handle.
    pub fn null() -> Self {
        Self::NULL
    }

    /// Whether this is the reserved null handle.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pack a type, sequence, and slot index into a handle.
    ///
    /// `sequence` must be non-zero (zero marks a slot free); `slot_index`
    /// must be non-zero (index 0 is never handed out).
    pub fn make(ty: TypeId, sequence: u16, slot_index: u16) -> Self {
        let group = u64::from(ty.group().0) << 48;
        let type_index = u64::from(ty.type_index()) << 32;
        let sequence = u64::from(sequence) << 16;
        let slot = u64::from(slot_index);
        Self(group | type_index | sequence | slot)
    }

    /// The group id encoded in this handle.
    pub fn group(self) -> GroupId {
        GroupId((self.0 >> 48) as u16)
    }

    /// The full 32-bit type encoded in this handle.
    pub fn ty(self) -> TypeId {
        let group = (self.0 >> 48) as u16;
        let type_index = (self.0 >> 32) as u16;
        TypeId::make(GroupId(group), type_index)
    }

    /// The 16-bit sequence stamped into this handle at allocation time.
    pub fn sequence(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// The slot index within the handle's group.
    pub fn slot_index(self) -> u16 {
        self.0 as u16
    }

    /// Raw 64-bit value, for ABI interop / wire transmission.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Reconstruct a handle from its raw 64-bit value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Handle(null)")
        } else {
            write!(
                f,
                "Handle(group={}, type_idx={}, seq={}, slot={})",
                self.group().0,
                self.ty().type_index(),
                self.sequence(),
                self.slot_index()
            )
        }
    }
}
