//! Test utilities for unit testing the mutator and the lifecycle controller
//!
//! This module provides an in-memory cluster, admission request builders and
//! configuration helpers.

use crate::cluster::{ClusterOps, FinalizerRemoval, TemplateKind, TemplateRef, VmSummary};
use crate::config::Config;
use crate::error::ControllerError;
use crate::events::VmEvent;
use crate::tracker::VmIdentity;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionReview};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Finalizer used throughout the tests
pub const FINALIZER: &str = "ipa.enroll/cleanup";

/// Configuration with test-friendly defaults
pub fn test_config() -> Config {
    Config {
        domain: "example.com".to_string(),
        ipa_host: "ipa1.example.com".to_string(),
        poll_interval_secs: 10,
        verification_max_attempts: 5,
        cleanup_max_attempts: 3,
        persist_grace_cycles: 2,
        ..Config::default()
    }
}

/// In-memory cluster
#[derive(Default)]
pub struct FakeClusterOps {
    vms: Mutex<BTreeMap<VmIdentity, VmSummary>>,
    templates: Mutex<Vec<(TemplateRef, ObjectMeta)>>,
    events: Mutex<Vec<(VmIdentity, VmEvent)>>,
    fail_lookups: Mutex<bool>,
    fail_finalizer_removal: Mutex<bool>,
}

impl FakeClusterOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a VM; `finalizers` replaces its finalizer list
    pub fn add_vm(&self, namespace: &str, name: &str, finalizers: &[&str]) -> VmIdentity {
        let identity = VmIdentity::new(namespace, name);
        self.vms.lock().unwrap().insert(
            identity.clone(),
            VmSummary {
                identity: identity.clone(),
                uid: Some(format!("uid-{}", name)),
                finalizers: finalizers.iter().map(|f| f.to_string()).collect(),
                deleting: false,
                enrolled_fqdn: None,
            },
        );
        identity
    }

    pub fn set_enrolled_fqdn(&self, identity: &VmIdentity, fqdn: &str) {
        if let Some(vm) = self.vms.lock().unwrap().get_mut(identity) {
            vm.enrolled_fqdn = Some(fqdn.to_string());
        }
    }

    /// Set the deletion timestamp; returns the updated summary
    pub fn mark_deleting(&self, identity: &VmIdentity) -> Option<VmSummary> {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms.get_mut(identity)?;
        vm.deleting = true;
        Some(vm.clone())
    }

    pub fn vm(&self, identity: &VmIdentity) -> Option<VmSummary> {
        self.vms.lock().unwrap().get(identity).cloned()
    }

    pub fn add_template(&self, kind: TemplateKind, name: &str, namespace: Option<&str>, labels: &[(&str, &str)], annotations: &[(&str, &str)]) {
        let to_map = |pairs: &[(&str, &str)]| -> Option<BTreeMap<String, String>> {
            Some(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
        };
        self.templates.lock().unwrap().push((
            TemplateRef {
                kind,
                name: name.to_string(),
                namespace: namespace.map(str::to_string),
            },
            ObjectMeta {
                name: Some(name.to_string()),
                labels: to_map(labels),
                annotations: to_map(annotations),
                ..Default::default()
            },
        ));
    }

    pub fn fail_lookups(&self, fail: bool) {
        *self.fail_lookups.lock().unwrap() = fail;
    }

    pub fn fail_finalizer_removal(&self, fail: bool) {
        *self.fail_finalizer_removal.lock().unwrap() = fail;
    }

    pub fn events(&self) -> Vec<(VmIdentity, VmEvent)> {
        self.events.lock().unwrap().clone()
    }

    /// Reasons of the events published for `identity`, in order
    pub fn reasons_for(&self, identity: &VmIdentity) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == identity)
            .map(|(_, e)| e.reason)
            .collect()
    }

    fn lookup_error() -> ControllerError {
        ControllerError::Watch("fake cluster unavailable".to_string())
    }
}

#[async_trait]
impl ClusterOps for FakeClusterOps {
    async fn get_vm(&self, identity: &VmIdentity) -> Result<Option<VmSummary>, ControllerError> {
        if *self.fail_lookups.lock().unwrap() {
            return Err(Self::lookup_error());
        }
        Ok(self.vm(identity))
    }

    async fn list_guarded_vms(&self, finalizer: &str) -> Result<Vec<VmSummary>, ControllerError> {
        if *self.fail_lookups.lock().unwrap() {
            return Err(Self::lookup_error());
        }
        Ok(self
            .vms
            .lock()
            .unwrap()
            .values()
            .filter(|vm| vm.has_finalizer(finalizer))
            .cloned()
            .collect())
    }

    async fn template_metadata(&self, template: &TemplateRef) -> Result<Option<ObjectMeta>, ControllerError> {
        if *self.fail_lookups.lock().unwrap() {
            return Err(Self::lookup_error());
        }
        Ok(self
            .templates
            .lock()
            .unwrap()
            .iter()
            .find(|(r, _)| r == template)
            .map(|(_, meta)| meta.clone()))
    }

    async fn remove_finalizer(&self, identity: &VmIdentity, finalizer: &str) -> Result<FinalizerRemoval, ControllerError> {
        if *self.fail_finalizer_removal.lock().unwrap() {
            return Err(ControllerError::Watch("finalizer patch rejected".to_string()));
        }
        let mut vms = self.vms.lock().unwrap();
        let Some(vm) = vms.get_mut(identity) else {
            return Ok(FinalizerRemoval::VmGone);
        };
        if !vm.has_finalizer(finalizer) {
            return Ok(FinalizerRemoval::NotPresent);
        }
        vm.finalizers.retain(|f| f != finalizer);
        // Garbage collection completes once the last finalizer is gone
        if vm.deleting && vm.finalizers.is_empty() {
            vms.remove(identity);
        }
        Ok(FinalizerRemoval::Removed)
    }

    async fn publish(&self, object: &ObjectReference, event: VmEvent) {
        let identity = VmIdentity::new(
            object.namespace.clone().unwrap_or_default(),
            object.name.clone().unwrap_or_default(),
        );
        self.events.lock().unwrap().push((identity, event));
    }
}

/// Minimal VirtualMachine object with a container disk
pub fn vm_object(name: &str) -> Value {
    json!({
        "apiVersion": "kubevirt.io/v1",
        "kind": "VirtualMachine",
        "metadata": {"name": name, "namespace": "default"},
        "spec": {
            "runStrategy": "Always",
            "template": {
                "spec": {
                    "domain": {"devices": {"disks": [{"name": "rootdisk", "disk": {"bus": "virtio"}}]}},
                    "volumes": [{"name": "rootdisk", "containerDisk": {"image": "quay.io/containerdisks/fedora:40"}}]
                }
            }
        }
    })
}

/// Admission request for `object`
pub fn admission_request(operation: &str, object: Value) -> AdmissionRequest<DynamicObject> {
    let name = object.pointer("/metadata/name").cloned().unwrap_or(Value::Null);
    let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": {"group": "kubevirt.io", "version": "v1", "kind": "VirtualMachine"},
            "resource": {"group": "kubevirt.io", "version": "v1", "resource": "virtualmachines"},
            "requestKind": {"group": "kubevirt.io", "version": "v1", "kind": "VirtualMachine"},
            "requestResource": {"group": "kubevirt.io", "version": "v1", "resource": "virtualmachines"},
            "name": name,
            "namespace": "default",
            "operation": operation,
            "userInfo": {"username": "system:admin"},
            "object": object,
            "oldObject": null,
            "dryRun": false
        }
    }))
    .unwrap();
    review.try_into().unwrap()
}

/// Apply a patch to a copy of `object`
pub fn apply_patch(object: &Value, patch: &json_patch::Patch) -> Value {
    let mut doc = object.clone();
    json_patch::patch(&mut doc, patch).unwrap();
    doc
}

/// Decode the cloud-init user data of the `cloudinitdisk` volume
pub fn cloud_init_user_data(vm: &Value) -> String {
    let volumes = vm.pointer("/spec/template/spec/volumes").and_then(Value::as_array).unwrap();
    let volume = volumes
        .iter()
        .find(|v| v.get("cloudInitNoCloud").is_some() || v.get("cloudInitConfigDrive").is_some())
        .unwrap();
    let source = volume
        .get("cloudInitNoCloud")
        .or_else(|| volume.get("cloudInitConfigDrive"))
        .unwrap();
    if let Some(text) = source.get("userData").and_then(Value::as_str) {
        return text.to_string();
    }
    use base64::Engine;
    let encoded = source.get("userDataBase64").and_then(Value::as_str).unwrap();
    String::from_utf8(base64::engine::general_purpose::STANDARD.decode(encoded).unwrap()).unwrap()
}
