//! # Lifecycle Controller
//!
//! Background half of virt-joiner. A single recurring task walks a snapshot of
//! the tracker every poll interval:
//!
//! - `Injected`: wait for the VM to be persisted, then announce the
//!   enrollment and start verification. A VM that never shows up means the
//!   admission was not committed; the record moves to `Orphaning` while its
//!   host entry is removed, so an admission retry cannot be caught in between.
//! - `AwaitingVerification`: poll FreeIPA for the host keytab until it
//!   appears or the attempt budget runs out. Verification failure is only
//!   reported; the finalizer stays. A VM that disappeared is cleaned up.
//! - `CleanupPending`: delete the host, then release the finalizer. Failed
//!   deletions are retried with a Fibonacci backoff and escalated once with a
//!   Warning event; the finalizer is never released while the host remains.
//!
//! The VM watcher feeds deletions in through [`LifecycleController::observe_vm`].
//! Because the tracker lives in memory, [`LifecycleController::reconcile_until_ready`]
//! rebuilds it from the finalizers found in the cluster before polling starts.

#[cfg(test)]
#[path = "lifecycle_test.rs"]
mod lifecycle_test;

use crate::backoff::FibonacciBackoff;
use crate::cluster::{ClusterOps, FinalizerRemoval, VmSummary, vm_object_ref};
use crate::config::Config;
use crate::error::ControllerError;
use crate::events::VmEvent;
use crate::metrics::Metrics;
use crate::template::target_fqdn;
use crate::tracker::{EnrollmentRecord, EnrollmentState, EnrollmentTracker, VerificationOutcome, VmIdentity};
use chrono::{DateTime, Utc};
use ipa_client::{DeleteOutcome, IpaClientTrait};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Upper bound of the delay between host deletion retries
const MAX_CLEANUP_DELAY_SECS: u64 = 300;

/// Verification and cleanup driver
pub struct LifecycleController {
    config: Arc<Config>,
    ipa: Arc<dyn IpaClientTrait>,
    cluster: Arc<dyn ClusterOps>,
    tracker: Arc<EnrollmentTracker>,
    metrics: Metrics,
    backoff: FibonacciBackoff,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("tracked", &self.tracker.len())
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    pub fn new(
        config: Arc<Config>,
        ipa: Arc<dyn IpaClientTrait>,
        cluster: Arc<dyn ClusterOps>,
        tracker: Arc<EnrollmentTracker>,
        metrics: Metrics,
    ) -> Self {
        let backoff = FibonacciBackoff::new(config.poll_interval_secs, MAX_CLEANUP_DELAY_SECS);
        Self {
            config,
            ipa,
            cluster,
            tracker,
            metrics,
            backoff,
        }
    }

    /// Rebuild tracker records for every VM carrying the finalizer.
    ///
    /// Returns the number of records created. VMs that already have a record
    /// (admitted while reconciliation was running) are left alone.
    pub async fn startup_reconciliation(&self) -> Result<usize, ControllerError> {
        let finalizer = &self.config.finalizer_name;
        let vms = self.cluster.list_guarded_vms(finalizer).await?;
        info!(count = vms.len(), finalizer = %finalizer, "Reconciling VMs carrying the finalizer");

        let mut rebuilt = 0;
        for vm in vms {
            if self.tracker.get(&vm.identity).is_some() {
                continue;
            }
            let Some(fqdn) = self.fqdn_of(&vm) else {
                continue;
            };

            if vm.deleting {
                if self.tracker.request_cleanup(&vm.identity, || self.rebuilt_record(&vm, &fqdn)) {
                    info!(vm = %vm.identity, fqdn = %fqdn, "VM is being deleted, host cleanup pending");
                    rebuilt += 1;
                }
                continue;
            }

            let mut record = self.rebuilt_record(&vm, &fqdn);
            match self.ipa.host_status(&fqdn).await {
                Ok(status) if status.has_keytab => {
                    record.state = EnrollmentState::Verified;
                    record.verification = Some(VerificationOutcome::Verified);
                }
                Ok(status) if status.exists => {
                    record.state = EnrollmentState::AwaitingVerification;
                }
                Ok(_) => {
                    warn!(vm = %vm.identity, fqdn = %fqdn, "Guarded VM has no host entry in FreeIPA");
                    record.state = EnrollmentState::VerificationFailed;
                    record.verification = Some(VerificationOutcome::HostMissing);
                    self.cluster
                        .publish(&vm.object_ref(), VmEvent::host_missing(&fqdn))
                        .await;
                }
                Err(e) => {
                    warn!(vm = %vm.identity, fqdn = %fqdn, error = %e, "FreeIPA unavailable, will verify later");
                    record.state = EnrollmentState::AwaitingVerification;
                }
            }
            debug!(vm = %vm.identity, state = %record.state, "Rebuilt enrollment record");
            if self.tracker.insert_if_absent(record) {
                rebuilt += 1;
            }
        }

        self.metrics.tracked_records.set(gauge(self.tracker.len()));
        Ok(rebuilt)
    }

    /// Run [`startup_reconciliation`](Self::startup_reconciliation) until the
    /// cluster answers, waiting the cleanup backoff between attempts.
    pub async fn reconcile_until_ready(&self) -> usize {
        let mut failures = 0u32;
        loop {
            match self.startup_reconciliation().await {
                Ok(rebuilt) => return rebuilt,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.backoff.delay_after(failures);
                    warn!(failures, retry_in_secs = delay.as_secs(), error = %e, "Startup reconciliation failed");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn fqdn_of(&self, vm: &VmSummary) -> Option<String> {
        if let Some(fqdn) = &vm.enrolled_fqdn {
            return Some(fqdn.clone());
        }
        match target_fqdn(
            &self.config.hostname_template,
            &vm.identity.name,
            &vm.identity.namespace,
            &self.config.domain,
        ) {
            Ok(fqdn) => Some(fqdn),
            Err(e) => {
                error!(vm = %vm.identity, error = %e, "Cannot derive host name for guarded VM");
                None
            }
        }
    }

    fn rebuilt_record(&self, vm: &VmSummary, fqdn: &str) -> EnrollmentRecord {
        let mut record = EnrollmentRecord::new(vm.identity.clone(), fqdn, EnrollmentState::CleanupPending);
        record.vm_uid = vm.uid.clone();
        record
    }

    /// React to a VM change reported by the watcher.
    pub fn observe_vm(&self, vm: &VmSummary) {
        if !vm.has_finalizer(&self.config.finalizer_name) {
            // Guard stripped by someone else; the host still has to go
            if vm.deleting && self.tracker.cleanup_if_tracked(&vm.identity) {
                info!(vm = %vm.identity, "Unguarded VM deletion observed, host cleanup pending");
            }
            return;
        }
        if let Some(uid) = &vm.uid {
            self.tracker.set_vm_uid(&vm.identity, uid);
        }
        if !vm.deleting {
            return;
        }

        let Some(fqdn) = self
            .tracker
            .get(&vm.identity)
            .map(|record| record.fqdn)
            .or_else(|| self.fqdn_of(vm))
        else {
            return;
        };
        if self
            .tracker
            .request_cleanup(&vm.identity, || self.rebuilt_record(vm, &fqdn))
        {
            info!(vm = %vm.identity, fqdn = %fqdn, "VM deletion observed, host cleanup pending");
        }
    }

    /// One pass over the tracker.
    pub async fn poll_cycle(&self, now: DateTime<Utc>) {
        for record in self.tracker.snapshot() {
            match record.state {
                EnrollmentState::Registering
                | EnrollmentState::Orphaning
                | EnrollmentState::Verified
                | EnrollmentState::VerificationFailed => {}
                EnrollmentState::Injected => self.confirm_persisted(&record, now).await,
                EnrollmentState::AwaitingVerification => self.verify_if_present(&record, now).await,
                EnrollmentState::CleanupPending => self.cleanup(&record, now).await,
                EnrollmentState::Cleaned => {
                    self.tracker.remove_if(&record.identity, EnrollmentState::Cleaned);
                }
            }
        }
        self.metrics.tracked_records.set(gauge(self.tracker.len()));
    }

    async fn confirm_persisted(&self, record: &EnrollmentRecord, now: DateTime<Utc>) {
        let identity = &record.identity;
        match self.cluster.get_vm(identity).await {
            Ok(Some(vm)) => {
                if let Some(uid) = &vm.uid {
                    self.tracker.set_vm_uid(identity, uid);
                }
                if !self
                    .tracker
                    .transition(identity, EnrollmentState::Injected, EnrollmentState::AwaitingVerification)
                {
                    return;
                }
                info!(vm = %identity, fqdn = %record.fqdn, "VM persisted, waiting for keytab");
                self.cluster
                    .publish(&vm.object_ref(), VmEvent::enroll_success(&record.fqdn))
                    .await;
                self.verify(identity, &record.fqdn, vm.uid.as_deref(), now).await;
            }
            Ok(None) => {
                let cycles = self.tracker.record_unpersisted(identity).unwrap_or_default();
                if cycles < self.config.persist_grace_cycles {
                    debug!(vm = %identity, cycles, "VM not persisted yet");
                    return;
                }
                // The admission never committed: the host entry is an orphan
                if !self.tracker.claim_orphan(identity, record.created_at) {
                    debug!(vm = %identity, "Record re-admitted, keeping host");
                    return;
                }
                match self.ipa.delete_host(&record.fqdn).await {
                    Ok(_) => {
                        warn!(vm = %identity, fqdn = %record.fqdn, "VM never persisted, removed orphaned host");
                        self.tracker.remove_if(identity, EnrollmentState::Orphaning);
                        self.metrics.cleanups.with_label_values(&["orphan"]).inc();
                    }
                    Err(e) => {
                        warn!(vm = %identity, fqdn = %record.fqdn, error = %e, "Failed to remove orphaned host");
                        self.tracker
                            .transition(identity, EnrollmentState::Orphaning, EnrollmentState::Injected);
                        self.metrics.cleanups.with_label_values(&["failed"]).inc();
                    }
                }
            }
            Err(e) => warn!(vm = %identity, error = %e, "Failed to look up VM"),
        }
    }

    async fn verify_if_present(&self, record: &EnrollmentRecord, now: DateTime<Utc>) {
        let identity = &record.identity;
        match self.cluster.get_vm(identity).await {
            Ok(None) => {
                // Deleted without the guard, the watcher never saw it go
                if self.tracker.cleanup_if_tracked(identity) {
                    info!(vm = %identity, fqdn = %record.fqdn, "VM vanished before verification, host cleanup pending");
                }
                return;
            }
            Ok(Some(_)) => {}
            Err(e) => debug!(vm = %identity, error = %e, "VM lookup failed, verifying anyway"),
        }
        self.verify(identity, &record.fqdn, record.vm_uid.as_deref(), now).await;
    }

    async fn verify(&self, identity: &VmIdentity, fqdn: &str, uid: Option<&str>, now: DateTime<Utc>) {
        let attempts = self.tracker.record_poll(identity, now).unwrap_or_default();
        let object = vm_object_ref(identity, uid);

        match self.ipa.has_keytab(fqdn).await {
            Ok(true) => {
                if self
                    .tracker
                    .transition(identity, EnrollmentState::AwaitingVerification, EnrollmentState::Verified)
                {
                    info!(vm = %identity, fqdn = %fqdn, attempts, "Keytab found, enrollment complete");
                    self.metrics.enrollments_verified.inc();
                    self.cluster.publish(&object, VmEvent::enrollment_complete()).await;
                }
                return;
            }
            Ok(false) => debug!(vm = %identity, fqdn = %fqdn, attempts, "No keytab yet"),
            Err(e) => warn!(vm = %identity, fqdn = %fqdn, attempts, error = %e, "Keytab check failed"),
        }

        if attempts >= self.config.verification_max_attempts
            && self.tracker.transition(
                identity,
                EnrollmentState::AwaitingVerification,
                EnrollmentState::VerificationFailed,
            )
        {
            warn!(vm = %identity, fqdn = %fqdn, attempts, "Timed out waiting for keytab");
            self.metrics.verification_failures.inc();
            self.cluster.publish(&object, VmEvent::enrollment_timeout()).await;
        }
    }

    async fn cleanup(&self, record: &EnrollmentRecord, now: DateTime<Utc>) {
        if record.next_cleanup_at.is_some_and(|at| at > now) {
            return;
        }
        let identity = &record.identity;
        let object = vm_object_ref(identity, record.vm_uid.as_deref());

        let result = match self.ipa.delete_host(&record.fqdn).await {
            Ok(outcome) => match self
                .cluster
                .remove_finalizer(identity, &self.config.finalizer_name)
                .await
            {
                Ok(removal) => Ok((outcome, removal)),
                Err(e) => Err(e),
            },
            Err(e) => Err(ControllerError::Ipa(e)),
        };

        match result {
            Ok((outcome, removal)) => {
                let label = match outcome {
                    DeleteOutcome::Deleted => "deleted",
                    DeleteOutcome::NotFound => "not_found",
                };
                self.metrics.cleanups.with_label_values(&[label]).inc();
                if removal != FinalizerRemoval::VmGone {
                    self.cluster.publish(&object, VmEvent::delete_success()).await;
                }
                if self
                    .tracker
                    .transition(identity, EnrollmentState::CleanupPending, EnrollmentState::Cleaned)
                {
                    info!(vm = %identity, fqdn = %record.fqdn, ?outcome, ?removal, "Host removed, finalizer released");
                    self.tracker.remove_if(identity, EnrollmentState::Cleaned);
                }
            }
            Err(e) => {
                self.metrics.cleanups.with_label_values(&["failed"]).inc();
                let failures = record.cleanup_attempts.saturating_add(1);
                let delay = self.backoff.delay_after(failures);
                let next_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(MAX_CLEANUP_DELAY_SECS as i64));
                self.tracker.record_cleanup_attempt(identity, next_at);
                warn!(
                    vm = %identity,
                    fqdn = %record.fqdn,
                    failures,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "Host cleanup failed"
                );
                if failures >= self.config.cleanup_max_attempts && self.tracker.mark_delete_failure_reported(identity) {
                    error!(vm = %identity, fqdn = %record.fqdn, failures, "Host cleanup keeps failing, finalizer kept");
                    self.cluster.publish(&object, VmEvent::delete_failed(&e)).await;
                }
            }
        }
    }

    /// Poll forever at the configured interval.
    pub async fn run(self: Arc<Self>) -> Result<(), ControllerError> {
        let period = self.config.poll_interval().max(Duration::from_secs(1));
        info!(interval_secs = period.as_secs(), "Starting lifecycle poller");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.poll_cycle(Utc::now()).await;
        }
    }
}

fn gauge(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}
