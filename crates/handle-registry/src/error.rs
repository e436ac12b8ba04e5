// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error type returned by every handle registry operation.

use std::fmt;

use crate::ids::HandleId;

/// Result alias for registry operations.
pub type Result<T> = std::result::Result<T, HandleError>;

/// Errors that can occur while working with the handle registry.
///
/// Every fallible operation surfaces one of these; the registry never
/// retries silently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// The handle was null, had a zero sequence, or named a group outside
    /// `[0, MAX_GROUPS)`.
    Invalid(HandleId),

    /// The type encoded in the handle (or passed by the caller) did not
    /// match the slot's recorded type.
    TypeMismatch { handle: HandleId, expected: crate::ids::TypeId },

    /// The slot was reused since this handle was issued: the sequence
    /// encoded in the handle no longer matches the slot's sequence.
    SequenceMismatch { handle: HandleId },

    /// The operation required the slot to be not-ready (or ready) but it
    /// was in the other state, e.g. a second `set_ready` call.
    Ready(HandleId),

    /// The slot was not ready, so `get` could not proceed.
    NotReady(HandleId),

    /// The group has no free slots left to reserve.
    NoMoreSlots,

    /// A slot's parent was already set and cannot be reassigned to a
    /// different handle.
    ParentAlreadySet { slot: HandleId, existing_parent: HandleId },

    /// Destroy was deferred because live children still reference this
    /// slot as their parent; retry once they drain.
    PendingChildren,

    /// An internal API contract was violated by the caller.
    InvalidRequest(&'static str),
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(h) => write!(f, "handle {h} is invalid"),
            Self::TypeMismatch { handle, expected } => {
                write!(f, "handle {handle} does not have expected type {expected}")
            }
            Self::SequenceMismatch { handle } => {
                write!(f, "handle {handle} refers to a slot that has been reused")
            }
            Self::Ready(h) => write!(f, "handle {h} is already ready"),
            Self::NotReady(h) => write!(f, "handle {h} is not ready"),
            Self::NoMoreSlots => write!(f, "group has no free slots remaining"),
            Self::ParentAlreadySet { slot, existing_parent } => write!(
                f,
                "slot {slot} already has parent {existing_parent}; one-shot parent reassignment rejected"
            ),
            Self::PendingChildren => write!(f, "destroy deferred: children still hold references"),
            Self::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
        }
    }
}

impl std::error::Error for HandleError {}
