//! Cluster access for the mutator and the lifecycle controller.
//!
//! Everything that talks to the Kubernetes API goes through [`ClusterOps`] so
//! the enrollment logic can be exercised against an in-memory fake.

use crate::error::ControllerError;
use crate::events::{CONTROLLER_NAME, VmEvent};
use crate::tracker::VmIdentity;
use async_trait::async_trait;
use json_patch::{PatchOperation, ReplaceOperation, TestOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::events::{Event, Recorder, Reporter};
use kube::{Api, Client, Resource, ResourceExt};
use kubevirt_crds::{
    VirtualMachine, VirtualMachineClusterInstancetype, VirtualMachineClusterPreference, VirtualMachineInstancetype,
    VirtualMachinePreference,
};
use tracing::{debug, warn};

/// Annotation the mutator leaves on enrolled VMs
pub const STATUS_ANNOTATION: &str = "ipa-enroll/status";

/// Prefix of the status annotation value, followed by the FQDN
pub const STATUS_PREFIX: &str = "Enrolled as ";

/// What the controller needs to know about a VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSummary {
    pub identity: VmIdentity,
    pub uid: Option<String>,
    pub finalizers: Vec<String>,
    /// Deletion timestamp is set
    pub deleting: bool,
    /// FQDN from the status annotation
    pub enrolled_fqdn: Option<String>,
}

impl VmSummary {
    /// Summarize a VM; `None` when it has no name or namespace.
    pub fn from_vm(vm: &VirtualMachine) -> Option<Self> {
        let name = vm.metadata.name.clone()?;
        let namespace = vm.metadata.namespace.clone()?;
        let enrolled_fqdn = vm
            .annotations()
            .get(STATUS_ANNOTATION)
            .and_then(|value| value.strip_prefix(STATUS_PREFIX))
            .map(|fqdn| fqdn.trim().to_string())
            .filter(|fqdn| !fqdn.is_empty());
        Some(Self {
            identity: VmIdentity::new(namespace, name),
            uid: vm.metadata.uid.clone(),
            finalizers: vm.finalizers().to_vec(),
            deleting: vm.metadata.deletion_timestamp.is_some(),
            enrolled_fqdn,
        })
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn object_ref(&self) -> ObjectReference {
        vm_object_ref(&self.identity, self.uid.as_deref())
    }
}

/// Reference used as the involved object of VM events
pub fn vm_object_ref(identity: &VmIdentity, uid: Option<&str>) -> ObjectReference {
    ObjectReference {
        api_version: Some(VirtualMachine::api_version(&()).to_string()),
        kind: Some(VirtualMachine::kind(&()).to_string()),
        name: Some(identity.name.clone()),
        namespace: Some(identity.namespace.clone()),
        uid: uid.map(str::to_string),
        ..Default::default()
    }
}

/// Instance type or preference a VM inherits metadata from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Instancetype,
    Preference,
}

/// Reference to an instance type or preference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRef {
    pub kind: TemplateKind,
    pub name: String,
    /// `None` for the cluster-scoped kinds
    pub namespace: Option<String>,
}

/// Result of removing the lifecycle guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerRemoval {
    Removed,
    /// The VM no longer carries the guard
    NotPresent,
    /// The VM no longer exists
    VmGone,
}

/// Kubernetes API operations used by virt-joiner
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Current state of a VM, `None` when it does not exist
    async fn get_vm(&self, identity: &VmIdentity) -> Result<Option<VmSummary>, ControllerError>;

    /// Every VM carrying `finalizer`
    async fn list_guarded_vms(&self, finalizer: &str) -> Result<Vec<VmSummary>, ControllerError>;

    /// Metadata of an instance type or preference, `None` when it does not exist
    async fn template_metadata(&self, template: &TemplateRef) -> Result<Option<ObjectMeta>, ControllerError>;

    /// Remove `finalizer` from a VM
    async fn remove_finalizer(&self, identity: &VmIdentity, finalizer: &str)
    -> Result<FinalizerRemoval, ControllerError>;

    /// Publish an event; failures are logged, never returned
    async fn publish(&self, object: &ObjectReference, event: VmEvent);
}

/// Test and replace patch taking `finalizer` out of `current`.
///
/// The `test` operation makes the API server reject the patch when another
/// writer changed the list in between.
pub fn finalizer_removal_patch(current: &[String], finalizer: &str) -> json_patch::Patch {
    let path = PointerBuf::from_tokens(["metadata", "finalizers"]);
    let remaining: Vec<&String> = current.iter().filter(|f| *f != finalizer).collect();
    json_patch::Patch(vec![
        PatchOperation::Test(TestOperation {
            path: path.clone(),
            value: serde_json::json!(current),
        }),
        PatchOperation::Replace(ReplaceOperation {
            path,
            value: serde_json::json!(remaining),
        }),
    ])
}

/// [`ClusterOps`] backed by the Kubernetes API
pub struct KubeClusterOps {
    client: Client,
    recorder: Recorder,
    watch_namespace: Option<String>,
}

impl std::fmt::Debug for KubeClusterOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterOps")
            .field("watch_namespace", &self.watch_namespace)
            .finish_non_exhaustive()
    }
}

impl KubeClusterOps {
    pub fn new(client: Client, watch_namespace: Option<String>) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            watch_namespace,
        }
    }

    fn vms(&self, namespace: &str) -> Api<VirtualMachine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// VirtualMachine API over the watched scope
    pub fn vm_api(&self) -> Api<VirtualMachine> {
        match &self.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl ClusterOps for KubeClusterOps {
    async fn get_vm(&self, identity: &VmIdentity) -> Result<Option<VmSummary>, ControllerError> {
        let vm = self.vms(&identity.namespace).get_opt(&identity.name).await?;
        Ok(vm.as_ref().and_then(VmSummary::from_vm))
    }

    async fn list_guarded_vms(&self, finalizer: &str) -> Result<Vec<VmSummary>, ControllerError> {
        let vms = self.vm_api().list(&ListParams::default()).await?;
        Ok(vms
            .items
            .iter()
            .filter_map(VmSummary::from_vm)
            .filter(|vm| vm.has_finalizer(finalizer))
            .collect())
    }

    async fn template_metadata(&self, template: &TemplateRef) -> Result<Option<ObjectMeta>, ControllerError> {
        let client = self.client.clone();
        let name = template.name.as_str();
        let meta = match (template.kind, template.namespace.as_deref()) {
            (TemplateKind::Instancetype, None) => Api::<VirtualMachineClusterInstancetype>::all(client)
                .get_opt(name)
                .await?
                .map(|t| t.metadata),
            (TemplateKind::Instancetype, Some(ns)) => Api::<VirtualMachineInstancetype>::namespaced(client, ns)
                .get_opt(name)
                .await?
                .map(|t| t.metadata),
            (TemplateKind::Preference, None) => Api::<VirtualMachineClusterPreference>::all(client)
                .get_opt(name)
                .await?
                .map(|t| t.metadata),
            (TemplateKind::Preference, Some(ns)) => Api::<VirtualMachinePreference>::namespaced(client, ns)
                .get_opt(name)
                .await?
                .map(|t| t.metadata),
        };
        Ok(meta)
    }

    async fn remove_finalizer(
        &self,
        identity: &VmIdentity,
        finalizer: &str,
    ) -> Result<FinalizerRemoval, ControllerError> {
        let api = self.vms(&identity.namespace);
        let Some(vm) = api.get_opt(&identity.name).await? else {
            return Ok(FinalizerRemoval::VmGone);
        };
        let current = vm.finalizers().to_vec();
        if !current.iter().any(|f| f == finalizer) {
            return Ok(FinalizerRemoval::NotPresent);
        }

        let patch = finalizer_removal_patch(&current, finalizer);
        match api
            .patch(&identity.name, &PatchParams::default(), &Patch::<()>::Json(patch))
            .await
        {
            Ok(_) => {
                debug!(vm = %identity, finalizer, "Removed finalizer");
                Ok(FinalizerRemoval::Removed)
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(FinalizerRemoval::VmGone),
            Err(e) => Err(e.into()),
        }
    }

    async fn publish(&self, object: &ObjectReference, event: VmEvent) {
        let reason = event.reason;
        let ev = Event {
            type_: event.type_,
            reason: event.reason.to_string(),
            note: Some(event.note),
            action: event.action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&ev, object).await {
            warn!(reason, vm = ?object.name, error = %e, "Failed to publish Kubernetes event");
        }
    }
}
