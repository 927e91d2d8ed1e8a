//! In-memory enrollment state
//!
//! One `EnrollmentRecord` per VM, shared between the admission path and the
//! lifecycle loop through an `Arc<EnrollmentTracker>`. Every state change goes
//! through a compare-and-set so a poll cycle and an admission retry racing on
//! the same VM cannot overwrite each other. Nothing is persisted; the
//! lifecycle controller rebuilds the map from cluster state at startup.

use chrono::{DateTime, Utc};
use ipa_client::Otp;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Namespace and name of a VM
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmIdentity {
    pub namespace: String,
    pub name: String,
}

impl VmIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Lifecycle state of an enrollment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnrollmentState {
    /// Admission in flight, host being registered
    Registering,
    /// Patch returned to the API server, VM not yet seen
    Injected,
    /// VM never persisted; its host entry is being removed
    Orphaning,
    AwaitingVerification,
    Verified,
    VerificationFailed,
    /// VM is being deleted, host removal outstanding
    CleanupPending,
    Cleaned,
}

impl EnrollmentState {
    /// States the mutator may overwrite on an admission retry
    #[must_use]
    pub fn is_admission_owned(self) -> bool {
        matches!(self, EnrollmentState::Registering | EnrollmentState::Injected)
    }
}

impl fmt::Display for EnrollmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of the verification phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verified,
    TimedOut,
    /// Host did not exist in the directory at startup
    HostMissing,
}

/// Tracked enrollment of one VM
#[derive(Debug, Clone)]
pub struct EnrollmentRecord {
    pub identity: VmIdentity,
    pub fqdn: String,
    otp: Option<Otp>,
    pub state: EnrollmentState,
    pub created_at: DateTime<Utc>,
    pub last_poll_at: Option<DateTime<Utc>>,
    /// Keytab polls so far
    pub attempts: u32,
    pub cleanup_attempts: u32,
    /// Earliest time of the next host deletion attempt
    pub next_cleanup_at: Option<DateTime<Utc>>,
    pub vm_uid: Option<String>,
    pub verification: Option<VerificationOutcome>,
    /// Poll cycles an `Injected` record spent without its VM in the cluster
    pub unpersisted_cycles: u32,
    pub delete_failure_reported: bool,
}

impl EnrollmentRecord {
    pub fn new(identity: VmIdentity, fqdn: impl Into<String>, state: EnrollmentState) -> Self {
        Self {
            identity,
            fqdn: fqdn.into(),
            otp: None,
            state,
            created_at: Utc::now(),
            last_poll_at: None,
            attempts: 0,
            cleanup_attempts: 0,
            next_cleanup_at: None,
            vm_uid: None,
            verification: None,
            unpersisted_cycles: 0,
            delete_failure_reported: false,
        }
    }

    /// One-time password issued at registration, if this process issued it
    #[must_use]
    pub fn otp(&self) -> Option<&Otp> {
        self.otp.as_ref()
    }
}

/// Shared map of enrollment records
#[derive(Debug, Default)]
pub struct EnrollmentTracker {
    records: Mutex<HashMap<VmIdentity, EnrollmentRecord>>,
}

impl EnrollmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<VmIdentity, EnrollmentRecord>> {
        // A panic while holding the lock leaves the map itself consistent
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace a record, returning the previous one.
    pub fn put(&self, record: EnrollmentRecord) -> Option<EnrollmentRecord> {
        self.lock().insert(record.identity.clone(), record)
    }

    /// Start an admission: insert `record` unless a record past the admission
    /// phase exists, in which case its state is returned.
    pub fn begin_registration(&self, record: EnrollmentRecord) -> Result<(), EnrollmentState> {
        let mut records = self.lock();
        if let Some(existing) = records.get(&record.identity) {
            if !existing.state.is_admission_owned() {
                return Err(existing.state);
            }
        }
        records.insert(record.identity.clone(), record);
        Ok(())
    }

    /// Insert `record` unless its VM already has one.
    pub fn insert_if_absent(&self, record: EnrollmentRecord) -> bool {
        let mut records = self.lock();
        if records.contains_key(&record.identity) {
            return false;
        }
        records.insert(record.identity.clone(), record);
        true
    }

    pub fn get(&self, identity: &VmIdentity) -> Option<EnrollmentRecord> {
        self.lock().get(identity).cloned()
    }

    /// Move `identity` from `from` to `to`. Fails when the current state is not `from`.
    pub fn transition(&self, identity: &VmIdentity, from: EnrollmentState, to: EnrollmentState) -> bool {
        let mut records = self.lock();
        match records.get_mut(identity) {
            Some(record) if record.state == from => {
                record.state = to;
                match to {
                    EnrollmentState::Verified => record.verification = Some(VerificationOutcome::Verified),
                    EnrollmentState::VerificationFailed if record.verification.is_none() => {
                        record.verification = Some(VerificationOutcome::TimedOut)
                    }
                    _ => {}
                }
                true
            }
            _ => false,
        }
    }

    /// Move a record to `CleanupPending` from any earlier state, inserting
    /// `if_missing` when the VM has no record. Returns whether anything changed.
    pub fn request_cleanup(&self, identity: &VmIdentity, if_missing: impl FnOnce() -> EnrollmentRecord) -> bool {
        let mut records = self.lock();
        match records.get_mut(identity) {
            Some(record) => match record.state {
                EnrollmentState::CleanupPending | EnrollmentState::Cleaned => false,
                _ => {
                    record.state = EnrollmentState::CleanupPending;
                    true
                }
            },
            None => {
                let mut record = if_missing();
                record.state = EnrollmentState::CleanupPending;
                records.insert(identity.clone(), record);
                true
            }
        }
    }

    /// Like [`request_cleanup`](Self::request_cleanup) for VMs that already
    /// have a record; untracked VMs are left alone.
    pub fn cleanup_if_tracked(&self, identity: &VmIdentity) -> bool {
        match self.lock().get_mut(identity) {
            Some(record) if !matches!(record.state, EnrollmentState::CleanupPending | EnrollmentState::Cleaned) => {
                record.state = EnrollmentState::CleanupPending;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, identity: &VmIdentity) -> Option<EnrollmentRecord> {
        self.lock().remove(identity)
    }

    /// Claim an unpersisted `Injected` record for host removal.
    ///
    /// Succeeds only for the admission that created the record at
    /// `admitted_at`; a retry that re-registered the VM in the meantime keeps
    /// its record. While `Orphaning`, new admissions of the VM are refused.
    pub fn claim_orphan(&self, identity: &VmIdentity, admitted_at: DateTime<Utc>) -> bool {
        match self.lock().get_mut(identity) {
            Some(record) if record.state == EnrollmentState::Injected && record.created_at == admitted_at => {
                record.state = EnrollmentState::Orphaning;
                true
            }
            _ => false,
        }
    }

    /// Remove `identity` only while it is still in `state`.
    pub fn remove_if(&self, identity: &VmIdentity, state: EnrollmentState) -> Option<EnrollmentRecord> {
        let mut records = self.lock();
        if records.get(identity).is_some_and(|r| r.state == state) {
            records.remove(identity)
        } else {
            None
        }
    }

    /// Copy of every record, ordered by identity
    pub fn snapshot(&self) -> Vec<EnrollmentRecord> {
        let mut records: Vec<EnrollmentRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        records
    }

    /// Count a keytab poll; returns the new attempt count.
    pub fn record_poll(&self, identity: &VmIdentity, at: DateTime<Utc>) -> Option<u32> {
        self.lock().get_mut(identity).map(|record| {
            record.attempts = record.attempts.saturating_add(1);
            record.last_poll_at = Some(at);
            record.attempts
        })
    }

    /// Count a failed host deletion and schedule the next one.
    pub fn record_cleanup_attempt(&self, identity: &VmIdentity, next_at: DateTime<Utc>) -> Option<u32> {
        self.lock().get_mut(identity).map(|record| {
            record.cleanup_attempts = record.cleanup_attempts.saturating_add(1);
            record.next_cleanup_at = Some(next_at);
            record.cleanup_attempts
        })
    }

    /// Count a cycle in which an `Injected` record's VM was not found.
    pub fn record_unpersisted(&self, identity: &VmIdentity) -> Option<u32> {
        self.lock().get_mut(identity).map(|record| {
            record.unpersisted_cycles = record.unpersisted_cycles.saturating_add(1);
            record.unpersisted_cycles
        })
    }

    /// Returns true only the first time it is called for a record.
    pub fn mark_delete_failure_reported(&self, identity: &VmIdentity) -> bool {
        match self.lock().get_mut(identity) {
            Some(record) if !record.delete_failure_reported => {
                record.delete_failure_reported = true;
                true
            }
            _ => false,
        }
    }

    /// Store the OTP of a record that has none yet.
    pub fn attach_otp(&self, identity: &VmIdentity, otp: Otp) -> bool {
        match self.lock().get_mut(identity) {
            Some(record) if record.otp.is_none() => {
                record.otp = Some(otp);
                true
            }
            _ => false,
        }
    }

    pub fn set_vm_uid(&self, identity: &VmIdentity, uid: &str) {
        if let Some(record) = self.lock().get_mut(identity) {
            record.vm_uid = Some(uid.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm1() -> VmIdentity {
        VmIdentity::new("default", "vm1")
    }

    fn record(state: EnrollmentState) -> EnrollmentRecord {
        EnrollmentRecord::new(vm1(), "vm1.example.com", state)
    }

    #[test]
    fn test_transition_is_compare_and_set() {
        let tracker = EnrollmentTracker::new();
        tracker.put(record(EnrollmentState::Injected));

        assert!(!tracker.transition(&vm1(), EnrollmentState::AwaitingVerification, EnrollmentState::Verified));
        assert!(tracker.transition(&vm1(), EnrollmentState::Injected, EnrollmentState::AwaitingVerification));
        assert!(!tracker.transition(&vm1(), EnrollmentState::Injected, EnrollmentState::AwaitingVerification));
        assert!(!tracker.transition(
            &VmIdentity::new("default", "ghost"),
            EnrollmentState::Injected,
            EnrollmentState::Verified
        ));
        assert_eq!(tracker.get(&vm1()).unwrap().state, EnrollmentState::AwaitingVerification);
    }

    #[test]
    fn test_verification_outcome_follows_state() {
        let tracker = EnrollmentTracker::new();
        tracker.put(record(EnrollmentState::AwaitingVerification));
        tracker.transition(&vm1(), EnrollmentState::AwaitingVerification, EnrollmentState::VerificationFailed);
        assert_eq!(tracker.get(&vm1()).unwrap().verification, Some(VerificationOutcome::TimedOut));
    }

    #[test]
    fn test_begin_registration_replaces_only_admission_states() {
        let tracker = EnrollmentTracker::new();
        assert!(tracker.begin_registration(record(EnrollmentState::Registering)).is_ok());
        tracker.transition(&vm1(), EnrollmentState::Registering, EnrollmentState::Injected);
        assert!(tracker.begin_registration(record(EnrollmentState::Registering)).is_ok());
        assert_eq!(tracker.get(&vm1()).unwrap().state, EnrollmentState::Registering);

        tracker.put(record(EnrollmentState::Verified));
        assert_eq!(
            tracker.begin_registration(record(EnrollmentState::Registering)),
            Err(EnrollmentState::Verified)
        );
    }

    #[test]
    fn test_cleanup_reachable_from_every_live_state() {
        for state in [
            EnrollmentState::Registering,
            EnrollmentState::Injected,
            EnrollmentState::Orphaning,
            EnrollmentState::AwaitingVerification,
            EnrollmentState::Verified,
            EnrollmentState::VerificationFailed,
        ] {
            let tracker = EnrollmentTracker::new();
            tracker.put(record(state));
            assert!(tracker.request_cleanup(&vm1(), || unreachable!()), "from {state}");
            assert_eq!(tracker.get(&vm1()).unwrap().state, EnrollmentState::CleanupPending);
            assert!(!tracker.request_cleanup(&vm1(), || unreachable!()));
        }
    }

    #[test]
    fn test_orphan_claim_blocks_new_admissions() {
        let tracker = EnrollmentTracker::new();
        let first = record(EnrollmentState::Injected);
        let admitted_at = first.created_at;
        tracker.put(first);

        assert!(tracker.claim_orphan(&vm1(), admitted_at));
        assert!(!tracker.claim_orphan(&vm1(), admitted_at));
        assert_eq!(
            tracker.begin_registration(record(EnrollmentState::Registering)),
            Err(EnrollmentState::Orphaning)
        );
    }

    #[test]
    fn test_orphan_claim_ignores_a_newer_admission() {
        let tracker = EnrollmentTracker::new();
        let stale_at = Utc::now() - chrono::Duration::seconds(30);
        tracker.put(record(EnrollmentState::Injected));

        assert!(!tracker.claim_orphan(&vm1(), stale_at));
        assert_eq!(tracker.get(&vm1()).unwrap().state, EnrollmentState::Injected);
    }

    #[test]
    fn test_cleanup_creates_missing_record() {
        let tracker = EnrollmentTracker::new();
        assert!(tracker.request_cleanup(&vm1(), || record(EnrollmentState::Verified)));
        assert_eq!(tracker.get(&vm1()).unwrap().state, EnrollmentState::CleanupPending);
    }

    #[test]
    fn test_cleanup_if_tracked_never_inserts() {
        let tracker = EnrollmentTracker::new();
        assert!(!tracker.cleanup_if_tracked(&vm1()));
        assert!(tracker.is_empty());

        tracker.put(record(EnrollmentState::Verified));
        assert!(tracker.cleanup_if_tracked(&vm1()));
        assert!(!tracker.cleanup_if_tracked(&vm1()));
        assert_eq!(tracker.get(&vm1()).unwrap().state, EnrollmentState::CleanupPending);
    }

    #[test]
    fn test_otp_is_write_once() {
        let tracker = EnrollmentTracker::new();
        tracker.put(record(EnrollmentState::Registering));
        assert!(tracker.attach_otp(&vm1(), Otp::new("first")));
        assert!(!tracker.attach_otp(&vm1(), Otp::new("second")));
        assert_eq!(tracker.get(&vm1()).unwrap().otp().unwrap().expose(), "first");
    }

    #[test]
    fn test_counters_and_failure_flag() {
        let tracker = EnrollmentTracker::new();
        tracker.put(record(EnrollmentState::CleanupPending));
        let now = Utc::now();
        assert_eq!(tracker.record_poll(&vm1(), now), Some(1));
        assert_eq!(tracker.record_cleanup_attempt(&vm1(), now), Some(1));
        assert_eq!(tracker.record_cleanup_attempt(&vm1(), now), Some(2));
        assert!(tracker.mark_delete_failure_reported(&vm1()));
        assert!(!tracker.mark_delete_failure_reported(&vm1()));
        assert_eq!(tracker.get(&vm1()).unwrap().next_cleanup_at, Some(now));
    }

    #[test]
    fn test_snapshot_is_sorted_and_detached() {
        let tracker = EnrollmentTracker::new();
        tracker.put(EnrollmentRecord::new(VmIdentity::new("b", "vm"), "vm.b", EnrollmentState::Injected));
        tracker.put(EnrollmentRecord::new(VmIdentity::new("a", "vm"), "vm.a", EnrollmentState::Injected));
        let snapshot = tracker.snapshot();
        tracker.remove(&VmIdentity::new("a", "vm"));

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].identity.namespace, "a");
        assert_eq!(tracker.len(), 1);
        assert!(tracker.remove_if(&VmIdentity::new("b", "vm"), EnrollmentState::Verified).is_none());
        assert!(tracker.remove_if(&VmIdentity::new("b", "vm"), EnrollmentState::Injected).is_some());
        assert!(tracker.is_empty());
    }
}
