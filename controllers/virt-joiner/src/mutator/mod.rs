//! # Enrollment Mutator
//!
//! Turns a VirtualMachine CREATE admission into a FreeIPA host registration
//! plus a JSON patch that makes the guest join the domain on first boot.
//!
//! ## Flow
//!
//! 1. Derive and validate the host FQDN from the hostname template.
//! 2. Merge labels and annotations inherited from the VM's instance type and
//!    preference under the VM's own metadata; apply the optional label gate.
//! 3. Pick the OS profile (`vm.kubevirt.io/os`, preference, instance type).
//! 4. Plan the cloud-init injection. Unmergeable boot configuration is denied
//!    here, before FreeIPA is touched.
//! 5. Register the host (`Registering`) and receive its one-time password.
//! 6. Build the patch: boot script, lifecycle finalizer, status annotation.
//! 7. Move the record to `Injected`.
//!
//! Every failure after step 1 denies the admission: a VM without a host entry
//! and a finalizer would never be cleaned up.

pub mod cloud_init;

#[cfg(test)]
mod mutator_test;


use crate::cluster::{ClusterOps, STATUS_ANNOTATION, STATUS_PREFIX, TemplateKind, TemplateRef};
use crate::config::Config;
use crate::error::MutationError;
use crate::os_profile::{JoinContext, OsProfileResolver};
use crate::template::target_fqdn;
use crate::tracker::{EnrollmentRecord, EnrollmentState, EnrollmentTracker, VmIdentity};
use cloud_init::BootScript;
use ipa_client::IpaClientTrait;
use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, Operation};
use kubevirt_crds::{InstancetypeMatcher, PreferenceMatcher};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Annotation KubeVirt common templates use to name the guest OS
pub const OS_ANNOTATION: &str = "vm.kubevirt.io/os";

/// Decision for one admission request
#[derive(Debug)]
pub enum MutationOutcome {
    /// Allow unchanged
    Skip,
    /// Allow with this patch
    Patch(json_patch::Patch),
    Deny(MutationError),
}

/// Labels and annotations after inheritance
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InheritedMetadata {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl InheritedMetadata {
    fn overlay(&mut self, labels: Option<&BTreeMap<String, String>>, annotations: Option<&BTreeMap<String, String>>) {
        if let Some(labels) = labels {
            self.labels.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(annotations) = annotations {
            self.annotations
                .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
}

/// Admission-time enrollment
pub struct EnrollmentMutator {
    config: Arc<Config>,
    profiles: OsProfileResolver,
    ipa: Arc<dyn IpaClientTrait>,
    cluster: Arc<dyn ClusterOps>,
    tracker: Arc<EnrollmentTracker>,
}

impl std::fmt::Debug for EnrollmentMutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrollmentMutator")
            .field("domain", &self.config.domain)
            .field("tracked", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

impl EnrollmentMutator {
    pub fn new(
        config: Arc<Config>,
        ipa: Arc<dyn IpaClientTrait>,
        cluster: Arc<dyn ClusterOps>,
        tracker: Arc<EnrollmentTracker>,
    ) -> Self {
        Self {
            profiles: config.os_profile_resolver(),
            config,
            ipa,
            cluster,
            tracker,
        }
    }

    /// Handle one admission request.
    pub async fn on_create(&self, request: &AdmissionRequest<DynamicObject>) -> MutationOutcome {
        if !matches!(request.operation, Operation::Create) {
            return MutationOutcome::Skip;
        }
        let Some(object) = request.object.as_ref() else {
            return MutationOutcome::Skip;
        };
        let name = object
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| Some(request.name.clone()).filter(|n| !n.is_empty()));
        let Some(name) = name else {
            debug!(uid = %request.uid, "VM without a name, allowing unchanged");
            return MutationOutcome::Skip;
        };
        let namespace = request
            .namespace
            .clone()
            .or_else(|| object.metadata.namespace.clone())
            .unwrap_or_else(|| "default".to_string());

        let vm = match serde_json::to_value(object) {
            Ok(vm) => vm,
            Err(e) => return MutationOutcome::Deny(MutationError::PatchConflict(format!("unreadable object: {}", e))),
        };
        if !vm.get("spec").is_some_and(Value::is_object) {
            debug!(uid = %request.uid, vm = %name, "VM without spec, allowing unchanged");
            return MutationOutcome::Skip;
        }

        let identity = VmIdentity::new(namespace, name);
        match self.enroll(&request.uid, &identity, &vm).await {
            Ok(Some(patch)) => MutationOutcome::Patch(patch),
            Ok(None) => MutationOutcome::Skip,
            Err(e) => {
                warn!(uid = %request.uid, vm = %identity, error = %e, "Denying VM creation");
                MutationOutcome::Deny(e)
            }
        }
    }

    async fn enroll(
        &self,
        admission_uid: &str,
        identity: &VmIdentity,
        vm: &Value,
    ) -> Result<Option<json_patch::Patch>, MutationError> {
        let config = &self.config;
        let fqdn = target_fqdn(&config.hostname_template, &identity.name, &identity.namespace, &config.domain)?;

        let instancetype = vm
            .pointer("/spec/instancetype")
            .and_then(|v| serde_json::from_value::<InstancetypeMatcher>(v.clone()).ok())
            .filter(|m| !m.name.is_empty());
        let preference = vm
            .pointer("/spec/preference")
            .and_then(|v| serde_json::from_value::<PreferenceMatcher>(v.clone()).ok())
            .filter(|m| !m.name.is_empty());

        let inherited = self
            .inherited_metadata(identity, vm, instancetype.as_ref(), preference.as_ref())
            .await;
        if config.enroll_label_required
            && inherited.labels.get(&config.enroll_label).map(String::as_str) != Some("true")
        {
            debug!(vm = %identity, label = %config.enroll_label, "Enrollment label not set, skipping");
            return Ok(None);
        }

        let candidates = [
            inherited.annotations.get(OS_ANNOTATION).map(String::as_str),
            preference.as_ref().map(|p| p.name.as_str()),
            instancetype.as_ref().map(|i| i.name.as_str()),
        ];
        let profile = self.profiles.resolve_first(candidates.into_iter().flatten());
        debug!(vm = %identity, family = ?profile.family, "Resolved OS profile");

        let plan = cloud_init::plan(vm)?;

        self.tracker
            .begin_registration(EnrollmentRecord::new(identity.clone(), fqdn.clone(), EnrollmentState::Registering))
            .map_err(|state| match state {
                EnrollmentState::Orphaning => {
                    debug!(vm = %identity, "Host of an earlier admission is being removed");
                    MutationError::ConcurrentAdmission(identity.to_string())
                }
                _ => {
                    debug!(vm = %identity, %state, "Record already past admission");
                    MutationError::AlreadyEnrolled(identity.to_string())
                }
            })?;

        let description = format!(
            "Created by virt-joiner at {} | K8s UID: {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
            admission_uid
        );
        let enrollment = match self.ipa.add_host(&fqdn, &description).await {
            Ok(enrollment) => enrollment,
            Err(e) => {
                self.tracker.remove_if(identity, EnrollmentState::Registering);
                return Err(MutationError::from_ipa(e));
            }
        };

        let domain = config.domain.trim_end_matches('.');
        let realm = config.realm();
        let join = profile.render_join(&JoinContext {
            server: &enrollment.server,
            fqdn: &fqdn,
            hostname: &identity.name,
            domain,
            realm: &realm,
            otp: &enrollment.otp,
        });
        let script = BootScript {
            hostname: identity.name.clone(),
            fqdn: fqdn.clone(),
            commands: vec![profile.install_command.clone(), join],
        };

        let mut ops = match plan.patch_operations(&script) {
            Ok(ops) => ops,
            Err(e) => {
                self.tracker.remove_if(identity, EnrollmentState::Registering);
                return Err(e);
            }
        };
        ops.extend(self.metadata_operations(vm, &fqdn));

        self.tracker.attach_otp(identity, enrollment.otp);
        if !self
            .tracker
            .transition(identity, EnrollmentState::Registering, EnrollmentState::Injected)
        {
            return Err(MutationError::ConcurrentAdmission(identity.to_string()));
        }

        info!(
            vm = %identity,
            fqdn = %fqdn,
            server = %enrollment.server,
            merged = plan.merges_existing(),
            "Injected FreeIPA enrollment"
        );
        Ok(Some(json_patch::Patch(ops)))
    }

    async fn inherited_metadata(
        &self,
        identity: &VmIdentity,
        vm: &Value,
        instancetype: Option<&InstancetypeMatcher>,
        preference: Option<&PreferenceMatcher>,
    ) -> InheritedMetadata {
        let mut merged = InheritedMetadata::default();

        let templates = [
            instancetype.map(|m| TemplateRef {
                kind: TemplateKind::Instancetype,
                name: m.name.clone(),
                namespace: (!m.is_cluster_scoped()).then(|| identity.namespace.clone()),
            }),
            preference.map(|m| TemplateRef {
                kind: TemplateKind::Preference,
                name: m.name.clone(),
                namespace: (!m.is_cluster_scoped()).then(|| identity.namespace.clone()),
            }),
        ];
        for template in templates.into_iter().flatten() {
            match self.cluster.template_metadata(&template).await {
                Ok(Some(meta)) => merged.overlay(meta.labels.as_ref(), meta.annotations.as_ref()),
                Ok(None) => warn!(vm = %identity, template = %template.name, "Referenced {:?} not found", template.kind),
                Err(e) => warn!(vm = %identity, template = %template.name, error = %e, "Failed to read {:?}", template.kind),
            }
        }

        let own_labels = vm
            .pointer("/metadata/labels")
            .and_then(|v| serde_json::from_value::<BTreeMap<String, String>>(v.clone()).ok());
        let own_annotations = vm
            .pointer("/metadata/annotations")
            .and_then(|v| serde_json::from_value::<BTreeMap<String, String>>(v.clone()).ok());
        merged.overlay(own_labels.as_ref(), own_annotations.as_ref());
        merged
    }

    fn metadata_operations(&self, vm: &Value, fqdn: &str) -> Vec<PatchOperation> {
        let finalizer = self.config.finalizer_name.as_str();
        let mut ops = Vec::with_capacity(2);

        match vm.pointer("/metadata/finalizers").and_then(Value::as_array) {
            Some(finalizers) if finalizers.iter().any(|f| f.as_str() == Some(finalizer)) => {}
            Some(_) => ops.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["metadata", "finalizers", "-"]),
                value: json!(finalizer),
            })),
            None => ops.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["metadata", "finalizers"]),
                value: json!([finalizer]),
            })),
        }

        let status = format!("{}{}", STATUS_PREFIX, fqdn);
        if vm.pointer("/metadata/annotations").is_some_and(Value::is_object) {
            ops.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["metadata", "annotations", STATUS_ANNOTATION]),
                value: json!(status),
            }));
        } else {
            ops.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["metadata", "annotations"]),
                value: json!({ STATUS_ANNOTATION: status }),
            }));
        }
        ops
    }
}
