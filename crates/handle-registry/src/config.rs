// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Policy knobs for [`crate::registry::HandleRegistry`].
//!
//! Grounded on the teacher's `EntityFactory::auto_enable`/`manual_enable`
//! pair (`core/ecs/factory.rs`): a small `Config`-like struct with a
//! `Default` impl matching the documented defaults, plus `with_*`
//! builder methods rather than public mutable fields, so a future added
//! knob doesn't break every call site.

use std::time::Duration;

/// Poll interval for [`crate::registry::HandleRegistry::set_notready`]
/// before the escalation threshold is reached. `spec.md` #5's fixed
/// 500ms default.
const DEFAULT_NOT_READY_POLL: Duration = Duration::from_millis(500);

/// Total wait time after which `set_notready` logs a warning and widens
/// its poll interval. `spec.md` #5's fixed 30s default.
const DEFAULT_NOT_READY_ESCALATE_AFTER: Duration = Duration::from_secs(30);

/// Poll interval used once the escalation threshold is reached.
/// `spec.md` #5's fixed 5s default.
const DEFAULT_NOT_READY_ESCALATED_POLL: Duration = Duration::from_secs(5);

/// Runtime-tunable policy for a [`crate::registry::HandleRegistry`].
///
/// The upstream C library hard-codes these three constants (and treats
/// the 30-second threshold as a fatal assert rather than a log
/// escalation); `spec.md` #9 calls for exposing them as a runtime or
/// compile-time parameter instead.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub(crate) not_ready_poll: Duration,
    pub(crate) not_ready_escalate_after: Duration,
    pub(crate) not_ready_escalated_poll: Duration,
    pub(crate) single_threaded: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            not_ready_poll: DEFAULT_NOT_READY_POLL,
            not_ready_escalate_after: DEFAULT_NOT_READY_ESCALATE_AFTER,
            not_ready_escalated_poll: DEFAULT_NOT_READY_ESCALATED_POLL,
            single_threaded: false,
        }
    }
}

impl RegistryConfig {
    /// Poll interval `set_notready` uses while waiting for a slot's
    /// refcount to drain, before escalation.
    pub fn with_not_ready_poll(mut self, interval: Duration) -> Self {
        self.not_ready_poll = interval;
        self
    }

    /// Total wait time after which `set_notready` logs a warning and
    /// widens its poll interval.
    pub fn with_not_ready_escalate_after(mut self, threshold: Duration) -> Self {
        self.not_ready_escalate_after = threshold;
        self
    }

    /// Poll interval used once the escalation threshold is reached.
    pub fn with_not_ready_escalated_poll(mut self, interval: Duration) -> Self {
        self.not_ready_escalated_poll = interval;
        self
    }

    /// Declare that this registry is only ever touched from one thread.
    ///
    /// Purely advisory: the registry does not relax any atomics based on
    /// this flag (see DESIGN.md, Open Question 3). It is consulted only
    /// by [`crate::enumerate::shutdown_sweep`], which in single-threaded
    /// mode is permitted to force-destroy handles that still have
    /// outstanding references, on the premise that nothing else is
    /// running concurrently to have taken them out.
    pub fn with_single_threaded(mut self, single_threaded: bool) -> Self {
        self.single_threaded = single_threaded;
        self
    }

    /// Whether [`RegistryConfig::with_single_threaded`] was set.
    pub fn single_threaded(&self) -> bool {
        self.single_threaded
    }
}
