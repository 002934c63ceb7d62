//! Scoped by-value module registration.
//!
//! Some tasks capture code from first-party modules that the remote
//! environment cannot resolve by reference. Callers declare those modules on
//! their resource descriptor, and staging records them in the
//! [`StagedEnvelope`](super::StagedEnvelope) so the remote side can verify
//! its environment before attempting to decode the payload.
//!
//! The registration list is process-wide state. It is only ever manipulated
//! through [`ByValueScope`], which acquires the registry lock for the full
//! duration of the serialization that uses it and clears the registrations
//! when dropped. Two concurrent stagings can therefore never observe each
//! other's module lists.

use std::sync::{Mutex, MutexGuard, PoisonError};

static REGISTRY: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// A held registration of by-value modules.
///
/// Constructing a scope registers the given modules and locks the registry;
/// dropping it unregisters them and releases the lock. Serialization that
/// should observe the registrations must happen while the scope is alive.
pub struct ByValueScope {
    guard: MutexGuard<'static, Vec<String>>,
}

impl ByValueScope {
    /// Registers `modules` and acquires the registry for the lifetime of the
    /// returned scope.
    pub fn register<I: IntoIterator<Item = String>>(modules: I) -> Self {
        let mut guard = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
        guard.clear();
        guard.extend(modules);
        Self { guard }
    }

    /// The modules registered by this scope.
    pub fn modules(&self) -> &[String] {
        &self.guard
    }
}

impl Drop for ByValueScope {
    fn drop(&mut self) {
        self.guard.clear();
    }
}
