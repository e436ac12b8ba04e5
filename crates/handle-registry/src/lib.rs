// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A lock-free handle registry: opaque 64-bit identifiers over a fixed
//! array of reference-counted, type-erased slots.
//!
//! A [`HandleId`] never dereferences directly to memory. It encodes a
//! group, a type, a sequence number, and a slot index; every operation
//! validates all four against the slot's current state before touching
//! the payload, so a stale or forged handle fails cleanly instead of
//! reading freed or reused memory. Slots carry an atomic refcount: a
//! payload is only actually torn down once every [`HandleRegistry::get`]
//! has been matched by a drop of its [`PayloadGuard`], and
//! [`HandleRegistry::set_parent`] builds a one-shot ownership forest so
//! destroying a parent cascades to its children in the right order.
//!
//! ```
//! use handle_registry::{GroupId, HandleRegistry, TypeId, USER_GROUP_START};
//!
//! let registry = HandleRegistry::new();
//! let ty = TypeId::make(GroupId::new(USER_GROUP_START).unwrap(), 0);
//!
//! let handle = registry.alloc(ty, 7u32, None, None).unwrap();
//! registry.set_ready(handle).unwrap();
//!
//! let value = registry.get::<u32>(ty, handle).unwrap();
//! assert_eq!(*value, 7);
//! drop(value);
//!
//! registry.destroy(handle).unwrap();
//! ```

mod callback;
mod config;
mod enumerate;
mod error;
mod flags;
mod global;
mod graph;
mod group;
mod ids;
mod registry;
mod slot;

pub use callback::{default_describe, DeinitFn, DescribeFn, Payload};
pub use config::RegistryConfig;
pub use enumerate::ShutdownReport;
pub use error::{HandleError, Result};
pub use global::{global, init as init_global, is_initialized as is_global_initialized};
pub use ids::{GroupId, HandleId, TypeId, MAX_GROUPS, MAX_SLOTS, USER_GROUP_START};
pub use registry::{HandleRegistry, PayloadGuard};
pub use slot::ArenaTag;
