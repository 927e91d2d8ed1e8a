//! Controller-specific error types.
//!
//! `ControllerError` covers the background side (configuration, cluster API,
//! FreeIPA, watcher); `MutationError` is the reason an admission request is
//! denied.

use ipa_client::IpaError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the virt-joiner controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// FreeIPA error
    #[error("FreeIPA error: {0}")]
    Ipa(#[from] IpaError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Object did not have the expected shape
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// HTTP server failed
    #[error("Server error: {0}")]
    Server(String),
}

/// Why an admission request was denied.
#[derive(Debug, Error)]
pub enum MutationError {
    /// No FreeIPA server could be found
    #[error("no FreeIPA servers found: {0}")]
    Discovery(IpaError),

    /// FreeIPA refused the registration
    #[error("FreeIPA rejected host registration: {0}")]
    DirectoryRejected(IpaError),

    /// Every FreeIPA server failed at the transport level
    #[error("FreeIPA unreachable: {0}")]
    DirectoryUnavailable(IpaError),

    /// Boot configuration cannot be merged safely
    #[error("cannot inject enrollment into boot configuration: {0}")]
    PatchConflict(String),

    /// Generated FQDN is not a usable host name
    #[error("{0}")]
    InvalidHostname(String),

    /// A live enrollment for this VM already exists
    #[error("VM {0} is already enrolled")]
    AlreadyEnrolled(String),

    /// Another admission or an orphaned-host removal for the same VM is in flight
    #[error("concurrent admission for VM {0}, retry")]
    ConcurrentAdmission(String),

    /// The admission deadline expired
    #[error("enrollment did not finish within {0}s")]
    Timeout(u64),
}

impl MutationError {
    /// Classify a FreeIPA failure of the registration call.
    #[must_use]
    pub fn from_ipa(error: IpaError) -> Self {
        match error {
            IpaError::NoEndpoints => MutationError::Discovery(error),
            IpaError::Rejected { .. } => MutationError::DirectoryRejected(error),
            other => MutationError::DirectoryUnavailable(other),
        }
    }

    /// Short label used for the admissions metric.
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        match self {
            MutationError::Discovery(_) => "discovery_failure",
            MutationError::DirectoryRejected(_) => "directory_rejected",
            MutationError::DirectoryUnavailable(_) => "directory_unavailable",
            MutationError::PatchConflict(_) => "patch_conflict",
            MutationError::InvalidHostname(_) => "invalid_hostname",
            MutationError::AlreadyEnrolled(_) => "already_enrolled",
            MutationError::ConcurrentAdmission(_) => "concurrent_admission",
            MutationError::Timeout(_) => "timeout",
        }
    }
}
