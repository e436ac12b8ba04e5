// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Opt-in process-wide singleton.
//!
//! `spec.md` #9 resolves "is there one registry per process?" as "no —
//! the library is a type, not a singleton; callers that want a global
//! instance build one themselves." This module is that thin,
//! explicitly-opt-in convenience, grounded on the teacher's own
//! `OnceLock`-backed global transport handle (`transport/global.rs`):
//! `init` is callable exactly once and reports whether it won the race;
//! `global` lazily falls back to default config on first use rather
//! than panicking, so a caller who never needed custom policy knobs
//! does not have to call `init` at all.

use std::sync::OnceLock;

use crate::config::RegistryConfig;
use crate::registry::HandleRegistry;

static GLOBAL: OnceLock<HandleRegistry> = OnceLock::new();

/// Initialize the process-wide registry. Returns `Err` with the config
/// that was rejected if a global registry already exists.
pub fn init(config: RegistryConfig) -> Result<(), RegistryConfig> {
    match GLOBAL.set(HandleRegistry::with_config(config)) {
        Ok(()) => Ok(()),
        Err(rejected) => Err(*rejected.config()),
    }
}

/// The process-wide registry, initializing it with default config on
/// first use if [`init`] was never called.
pub fn global() -> &'static HandleRegistry {
    GLOBAL.get_or_init(HandleRegistry::new)
}

/// Whether the global registry has been initialized.
pub fn is_initialized() -> bool {
    GLOBAL.get().is_some()
}
