//! Mock IpaClient for unit testing
//!
//! This module provides a mock implementation of IpaClientTrait that can be used
//! in unit tests without requiring a running FreeIPA server.

use crate::error::IpaError;
use crate::ipa_trait::IpaClientTrait;
use crate::models::*;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Failure the mock should produce for the next calls of an operation.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// Every server unreachable
    Unreachable,
    /// FreeIPA rejected the command with the given code
    Rejected(i64),
}

impl MockFailure {
    fn to_error(&self, method: &str) -> IpaError {
        match self {
            MockFailure::Unreachable => IpaError::AllEndpointsFailed(vec!["mock: connection refused".to_string()]),
            MockFailure::Rejected(code) => IpaError::Rejected {
                method: method.to_string(),
                code: *code,
                name: "MockError".to_string(),
                message: format!("mock rejection of {}", method),
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MockHost {
    description: String,
    password: Option<String>,
    has_keytab: bool,
}

/// Mock IpaClient for testing
///
/// Hosts live in memory. Keytab answers can be scripted per host, failures
/// injected per operation, and calls are counted.
#[derive(Clone)]
pub struct MockIpaClient {
    server: String,
    hosts: Arc<Mutex<HashMap<String, MockHost>>>,
    // Scripted has_keytab answers, consumed front to back
    keytab_script: Arc<Mutex<HashMap<String, VecDeque<bool>>>>,
    // Fixed passwords handed out instead of random ones, consumed front to back
    otp_script: Arc<Mutex<VecDeque<String>>>,
    failures: Arc<Mutex<HashMap<&'static str, MockFailure>>>,
    calls: Arc<Mutex<Vec<(&'static str, String)>>>,
}

impl MockIpaClient {
    /// Create a new mock client answering as `server`
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            hosts: Arc::new(Mutex::new(HashMap::new())),
            keytab_script: Arc::new(Mutex::new(HashMap::new())),
            otp_script: Arc::new(Mutex::new(VecDeque::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add an existing host to the mock store (for test setup)
    pub fn add_existing_host(&self, fqdn: &str, has_keytab: bool) {
        self.hosts.lock().unwrap().insert(
            fqdn.to_string(),
            MockHost {
                has_keytab,
                ..MockHost::default()
            },
        );
    }

    /// Hand out `otp` on the next `add_host` instead of a random password
    pub fn push_otp(&self, otp: &str) {
        self.otp_script.lock().unwrap().push_back(otp.to_string());
    }

    /// Script the next `has_keytab` answers for `fqdn`; the last one sticks
    pub fn script_keytab(&self, fqdn: &str, answers: &[bool]) {
        self.keytab_script
            .lock()
            .unwrap()
            .insert(fqdn.to_string(), answers.iter().copied().collect());
    }

    /// Make every call of `method` fail until cleared
    pub fn fail(&self, method: &'static str, failure: MockFailure) {
        self.failures.lock().unwrap().insert(method, failure);
    }

    /// Stop failing `method`
    pub fn clear_failure(&self, method: &'static str) {
        self.failures.lock().unwrap().remove(method);
    }

    /// Whether `fqdn` is registered
    pub fn host_exists(&self, fqdn: &str) -> bool {
        self.hosts.lock().unwrap().contains_key(fqdn)
    }

    /// Current enrollment password of `fqdn`
    pub fn password_of(&self, fqdn: &str) -> Option<String> {
        self.hosts.lock().unwrap().get(fqdn).and_then(|h| h.password.clone())
    }

    /// Description stored for `fqdn`
    pub fn description_of(&self, fqdn: &str) -> Option<String> {
        self.hosts.lock().unwrap().get(fqdn).map(|h| h.description.clone())
    }

    /// Number of recorded calls of `method`
    pub fn call_count(&self, method: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(m, _)| *m == method).count()
    }

    /// Recorded calls as `(method, fqdn)` pairs in order
    pub fn calls(&self) -> Vec<(&'static str, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, method: &'static str, fqdn: &str) -> Result<(), IpaError> {
        self.calls.lock().unwrap().push((method, fqdn.to_string()));
        match self.failures.lock().unwrap().get(method) {
            Some(failure) => Err(failure.to_error(method)),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl IpaClientTrait for MockIpaClient {
    async fn validate_connectivity(&self) -> Result<(), IpaError> {
        self.record("validate_connectivity", "")
    }

    async fn add_host(&self, fqdn: &str, description: &str) -> Result<HostEnrollment, IpaError> {
        self.record("add_host", fqdn)?;
        let otp = match self.otp_script.lock().unwrap().pop_front() {
            Some(value) => Otp::new(value),
            None => Otp::generate(),
        };

        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts.entry(fqdn.to_string()).or_default();
        host.description = description.to_string();
        host.password = Some(otp.expose().to_string());

        Ok(HostEnrollment {
            otp,
            server: self.server.clone(),
        })
    }

    async fn delete_host(&self, fqdn: &str) -> Result<DeleteOutcome, IpaError> {
        self.record("delete_host", fqdn)?;
        self.keytab_script.lock().unwrap().remove(fqdn);
        match self.hosts.lock().unwrap().remove(fqdn) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn has_keytab(&self, fqdn: &str) -> Result<bool, IpaError> {
        self.record("has_keytab", fqdn)?;
        if let Some(script) = self.keytab_script.lock().unwrap().get_mut(fqdn) {
            let answer = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().copied()
            };
            if let Some(answer) = answer {
                if let Some(host) = self.hosts.lock().unwrap().get_mut(fqdn) {
                    host.has_keytab = answer;
                }
                return Ok(answer);
            }
        }
        Ok(self.hosts.lock().unwrap().get(fqdn).is_some_and(|h| h.has_keytab))
    }

    async fn host_status(&self, fqdn: &str) -> Result<HostStatus, IpaError> {
        self.record("host_status", fqdn)?;
        Ok(match self.hosts.lock().unwrap().get(fqdn) {
            Some(host) => HostStatus {
                exists: true,
                has_keytab: host.has_keytab,
            },
            None => HostStatus::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_host_twice_yields_usable_credentials() {
        let client = MockIpaClient::new("ipa1.example.com");
        let first = client.add_host("vm1.example.com", "first").await.unwrap();
        let second = client.add_host("vm1.example.com", "second").await.unwrap();

        assert_ne!(first.otp, second.otp);
        assert_eq!(client.password_of("vm1.example.com").as_deref(), Some(second.otp.expose()));
        assert_eq!(second.server, "ipa1.example.com");
    }

    #[tokio::test]
    async fn test_delete_missing_host_is_not_an_error() {
        let client = MockIpaClient::new("ipa1");
        assert_eq!(client.delete_host("ghost.example.com").await.unwrap(), DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_keytab_script_last_answer_sticks() {
        let client = MockIpaClient::new("ipa1");
        client.add_existing_host("vm1", false);
        client.script_keytab("vm1", &[false, true]);
        assert!(!client.has_keytab("vm1").await.unwrap());
        assert!(client.has_keytab("vm1").await.unwrap());
        assert!(client.has_keytab("vm1").await.unwrap());
        assert!(client.host_status("vm1").await.unwrap().has_keytab);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let client = MockIpaClient::new("ipa1");
        client.fail("add_host", MockFailure::Unreachable);
        assert!(client.add_host("vm1", "").await.is_err());
        client.clear_failure("add_host");
        assert!(client.add_host("vm1", "").await.is_ok());
        assert_eq!(client.call_count("add_host"), 2);
    }
}
