//! IpaClientTrait for mocking
//!
//! The controller and the admission path only see this trait, so unit tests
//! can swap in the in-memory mock instead of a live FreeIPA deployment.

use crate::error::IpaError;
use crate::models::{DeleteOutcome, HostEnrollment, HostStatus};

/// Trait for FreeIPA host operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait IpaClientTrait: Send + Sync {
    /// Check that at least one server accepts our credentials
    async fn validate_connectivity(&self) -> Result<(), IpaError>;

    /// Register `fqdn` and issue a one-time enrollment password.
    ///
    /// Safe to repeat: an existing host gets a freshly rotated password.
    async fn add_host(&self, fqdn: &str, description: &str) -> Result<HostEnrollment, IpaError>;

    /// Remove `fqdn`. A host that does not exist is reported, not an error.
    async fn delete_host(&self, fqdn: &str) -> Result<DeleteOutcome, IpaError>;

    /// Whether `fqdn` holds a keytab (completed the domain join)
    async fn has_keytab(&self, fqdn: &str) -> Result<bool, IpaError>;

    /// Existence and keytab state of `fqdn`
    async fn host_status(&self, fqdn: &str) -> Result<HostStatus, IpaError>;
}
