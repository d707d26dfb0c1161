//! Scoped suspension of an impersonated identity.
//!
//! An agent may hold an impersonated identity that must not leak into
//! proxy or socket authentication, so the HTTP carrier suspends it for the
//! duration of each network call. The guard is a collaborator trait; the
//! scope wrapper guarantees the suspend/resume pairing stays balanced on
//! every exit path.

use std::sync::Arc;

/// Process-wide identity toggled around network calls.
pub trait IdentityGuard: Send + Sync {
    /// Drop the impersonated identity; subsequent calls run as the process
    /// identity.
    fn suspend(&self);
    /// Restore the impersonated identity.
    fn resume(&self);
}

/// Guard for agents that never impersonate.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoImpersonation;

impl IdentityGuard for NoImpersonation {
    fn suspend(&self) {}
    fn resume(&self) {}
}

/// RAII scope: suspends on entry, resumes on drop.
pub struct IdentityScope {
    guard: Arc<dyn IdentityGuard>,
}

impl IdentityScope {
    /// Suspend the identity until the returned scope is dropped.
    pub fn enter(guard: Arc<dyn IdentityGuard>) -> Self {
        guard.suspend();
        IdentityScope { guard }
    }
}

impl Drop for IdentityScope {
    fn drop(&mut self) {
        self.guard.resume();
    }
}
