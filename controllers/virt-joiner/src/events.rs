//! Kubernetes Events emitted on VirtualMachine objects.
//!
//! Events are the operator-facing record of enrollment progress and failures
//! (`kubectl describe vm`). Publishing is fire-and-forget, see
//! [`crate::cluster::ClusterOps::publish`].

use kube::runtime::events::EventType;
use std::fmt::Display;

/// Name reported as the event source
pub const CONTROLLER_NAME: &str = "virt-joiner";

/// Event reasons (REASON column of `kubectl get events`)
pub mod reasons {
    /// Host registered in FreeIPA and the VM persisted
    pub const ENROLL_SUCCESS: &str = "IPAEnrollSuccess";
    /// Keytab found, the guest joined the domain
    pub const ENROLLMENT_COMPLETE: &str = "IPAEnrollmentComplete";
    pub const ENROLLMENT_TIMEOUT: &str = "IPAEnrollmentTimeout";
    pub const DELETE_SUCCESS: &str = "IPADeleteSuccess";
    pub const DELETE_FAILED: &str = "IPADeleteFailed";
    /// Guarded VM whose host entry is gone from FreeIPA
    pub const HOST_MISSING: &str = "IPAHostMissing";
}

/// Event actions (ACTION column)
pub mod actions {
    pub const ENROLL: &str = "Enroll";
    pub const VERIFY: &str = "Verify";
    pub const CLEANUP: &str = "Cleanup";
    pub const RECONCILE: &str = "Reconcile";
}

/// An event about one VM
#[derive(Debug, Clone)]
pub struct VmEvent {
    pub type_: EventType,
    pub reason: &'static str,
    pub action: &'static str,
    pub note: String,
}

impl VmEvent {
    fn normal(reason: &'static str, action: &'static str, note: String) -> Self {
        Self {
            type_: EventType::Normal,
            reason,
            action,
            note,
        }
    }

    fn warning(reason: &'static str, action: &'static str, note: String) -> Self {
        Self {
            type_: EventType::Warning,
            reason,
            action,
            note,
        }
    }

    pub fn enroll_success(fqdn: &str) -> Self {
        Self::normal(
            reasons::ENROLL_SUCCESS,
            actions::ENROLL,
            format!("Successfully pre-created host {} in IPA", fqdn),
        )
    }

    pub fn enrollment_complete() -> Self {
        Self::normal(
            reasons::ENROLLMENT_COMPLETE,
            actions::VERIFY,
            "Host Keytab found in IPA - Client installation successful".to_string(),
        )
    }

    pub fn enrollment_timeout() -> Self {
        Self::warning(
            reasons::ENROLLMENT_TIMEOUT,
            actions::VERIFY,
            "Timed out waiting for Keytab. VM may have failed to boot or enroll.".to_string(),
        )
    }

    pub fn delete_success() -> Self {
        Self::normal(reasons::DELETE_SUCCESS, actions::CLEANUP, "Removed host from IPA".to_string())
    }

    pub fn delete_failed(error: &dyn Display) -> Self {
        Self::warning(reasons::DELETE_FAILED, actions::CLEANUP, format!("Failed: {}", error))
    }

    pub fn host_missing(fqdn: &str) -> Self {
        Self::warning(
            reasons::HOST_MISSING,
            actions::RECONCILE,
            format!("Host {} is not registered in IPA; the VM cannot complete enrollment", fqdn),
        )
    }

    /// Whether this is a Warning event
    #[must_use]
    pub fn is_warning(&self) -> bool {
        matches!(self.type_, EventType::Warning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_types() {
        assert!(!VmEvent::enroll_success("vm1.example.com").is_warning());
        assert!(!VmEvent::enrollment_complete().is_warning());
        assert!(VmEvent::enrollment_timeout().is_warning());
        assert!(VmEvent::delete_failed(&"boom").is_warning());
        assert!(VmEvent::host_missing("vm1.example.com").is_warning());
    }

    #[test]
    fn test_delete_failed_note() {
        let event = VmEvent::delete_failed(&"connection refused");
        assert_eq!(event.reason, "IPADeleteFailed");
        assert_eq!(event.note, "Failed: connection refused");
    }
}
