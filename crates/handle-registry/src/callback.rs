// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Type-erased callbacks attached to a slot at `alloc` time.
//!
//! The C source keys callbacks off raw payload pointers; `spec.md` #9
//! prescribes modeling them "as trait objects or typed closures keyed off
//! the slot's type tag" instead. Because a single [`crate::group::Group`]
//! holds payloads of many different concrete types side by side, the
//! closures here operate on `dyn Any` and the caller's `alloc::<T>` is
//! responsible for capturing `T`-typed logic in a closure before it gets
//! erased.

use std::any::Any;
use std::fmt::Write as _;

/// Boxed, type-erased payload.
pub type Payload = Box<dyn Any + Send + Sync>;

/// Finalizer run exactly once during `destroy`, after the slot is marked
/// not-ready and before the slot is released.
pub type DeinitFn = Box<dyn FnOnce(Payload) + Send>;

/// Textual renderer invoked by `describe`. Writes into the supplied
/// buffer; the C source's `(buf, len) -> written` contract becomes
/// `&mut String`, which is push-only and therefore inherently safe
/// against the overflow the C signature has to guard against manually.
pub type DescribeFn = Box<dyn Fn(&Payload, &mut String) + Send + Sync>;

/// Default `describe_cb` used when the caller does not supply one: emits
/// the Rust type name of the erased payload.
pub fn default_describe(payload: &Payload, out: &mut String) {
    let _ = write!(out, "<{}>", type_name_of(payload));
}

fn type_name_of(payload: &Payload) -> &'static str {
    // `Any::type_id` doesn't give us a name; this is the best a fully
    // erased `dyn Any` can offer without the caller supplying one.
    let _ = payload;
    std::any::type_name::<dyn Any>()
}
