//! Sub-flow suspension
//!
//! An operator (or another component in the same process, such as a
//! migration in progress) can pause individual reconcile sub-flows without
//! stopping the poller. The reconciler checks the registry at the top of
//! every sub-flow on every tick.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

/// A reconcile sub-flow that can be paused
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Subsystem {
    /// Dead node purge
    Purge,
    /// Force-deleting stuck pods on dead nodes
    ClearDeadPods,
    /// Storage membership and replication
    Storage,
    /// Certificate rotation
    CertRotation,
    /// Internal load balancer sync
    InternalLoadBalancer,
    /// Kubelet CSR approval
    CsrApproval,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Subsystem::Purge => "purge",
            Subsystem::ClearDeadPods => "clear-dead-pods",
            Subsystem::Storage => "storage",
            Subsystem::CertRotation => "cert-rotation",
            Subsystem::InternalLoadBalancer => "internal-lb",
            Subsystem::CsrApproval => "csr-approval",
        };
        f.write_str(s)
    }
}

/// Shared registry of suspended sub-flows
#[derive(Debug, Default)]
pub struct Suspensions {
    suspended: Mutex<HashMap<Subsystem, bool>>,
}

impl Suspensions {
    /// Create a registry with nothing suspended
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause a sub-flow until [`Suspensions::resume`] is called
    pub fn suspend(&self, subsystem: Subsystem) {
        self.suspended.lock().insert(subsystem, true);
    }

    /// Resume a paused sub-flow
    pub fn resume(&self, subsystem: Subsystem) {
        self.suspended.lock().insert(subsystem, false);
    }

    /// Whether a sub-flow is paused
    pub fn is_suspended(&self, subsystem: Subsystem) -> bool {
        self.suspended
            .lock()
            .get(&subsystem)
            .copied()
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_suspend_and_resume() {
        let registry = Suspensions::new();
        assert!(!registry.is_suspended(Subsystem::Storage));

        registry.suspend(Subsystem::Storage);
        assert!(registry.is_suspended(Subsystem::Storage));
        assert!(!registry.is_suspended(Subsystem::Purge));

        registry.resume(Subsystem::Storage);
        assert!(!registry.is_suspended(Subsystem::Storage));
    }

    #[test]
    fn test_shared_across_threads() {
        let registry = Arc::new(Suspensions::new());
        let writer = registry.clone();
        std::thread::spawn(move || writer.suspend(Subsystem::CertRotation))
            .join()
            .unwrap();
        assert!(registry.is_suspended(Subsystem::CertRotation));
    }
}
