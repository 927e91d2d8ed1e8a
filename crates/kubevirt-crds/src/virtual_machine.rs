//! VirtualMachine CRD (kubevirt.io/v1)
//!
//! Only the parts of `spec` that drive enrollment are typed. The VMI
//! template stays raw JSON: the mutator patches it by JSON pointer and never
//! round-trips it through these types.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kind name of the cluster-scoped instance type.
pub const CLUSTER_INSTANCETYPE_KIND: &str = "VirtualMachineClusterInstancetype";

/// Kind name of the namespaced instance type.
pub const INSTANCETYPE_KIND: &str = "VirtualMachineInstancetype";

/// Kind name of the cluster-scoped preference.
pub const CLUSTER_PREFERENCE_KIND: &str = "VirtualMachineClusterPreference";

/// Kind name of the namespaced preference.
pub const PREFERENCE_KIND: &str = "VirtualMachinePreference";

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachine",
    namespaced,
    status = "VirtualMachineStatus",
    shortname = "vm"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Legacy run flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,

    /// Run strategy (Always, Halted, Manual, RerunOnFailure, Once)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_strategy: Option<String>,

    /// Instance type the VM inherits resources (and metadata) from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instancetype: Option<InstancetypeMatcher>,

    /// Preference the VM inherits defaults (and metadata) from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference: Option<PreferenceMatcher>,

    /// VirtualMachineInstance template, untyped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<serde_json::Value>,
}

/// Reference from a VM to an instance type
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstancetypeMatcher {
    /// Name of the instance type
    #[serde(default)]
    pub name: String,

    /// Kind; cluster-scoped when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infer_from_volume: Option<String>,
}

impl InstancetypeMatcher {
    /// Whether the reference points at `VirtualMachineClusterInstancetype`.
    ///
    /// KubeVirt defaults the kind to the cluster-scoped type and compares
    /// kind names case-insensitively.
    #[must_use]
    pub fn is_cluster_scoped(&self) -> bool {
        !self
            .kind
            .as_deref()
            .is_some_and(|kind| kind.eq_ignore_ascii_case(INSTANCETYPE_KIND))
    }
}

/// Reference from a VM to a preference
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceMatcher {
    /// Name of the preference
    #[serde(default)]
    pub name: String,

    /// Kind; cluster-scoped when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infer_from_volume: Option<String>,
}

impl PreferenceMatcher {
    /// Whether the reference points at `VirtualMachineClusterPreference`.
    #[must_use]
    pub fn is_cluster_scoped(&self) -> bool {
        !self
            .kind
            .as_deref()
            .is_some_and(|kind| kind.eq_ignore_ascii_case(PREFERENCE_KIND))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Human readable status (Running, Stopped, Terminating, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub printable_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parses_kubevirt_manifest() {
        let vm: VirtualMachine = serde_json::from_value(json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachine",
            "metadata": {"name": "vm1", "namespace": "default", "finalizers": ["ipa.enroll/cleanup"]},
            "spec": {
                "runStrategy": "Always",
                "instancetype": {"name": "u1.medium"},
                "preference": {"kind": "virtualmachinepreference", "name": "ubuntu"},
                "template": {"spec": {"domain": {"devices": {}}}}
            },
            "status": {"printableStatus": "Running", "ready": true}
        }))
        .unwrap();

        let instancetype = vm.spec.instancetype.as_ref().unwrap();
        assert_eq!(instancetype.name, "u1.medium");
        assert!(instancetype.is_cluster_scoped());
        assert!(!vm.spec.preference.as_ref().unwrap().is_cluster_scoped());
        assert_eq!(vm.status.unwrap().printable_status.as_deref(), Some("Running"));
    }

    #[test]
    fn test_explicit_cluster_kind() {
        let matcher = InstancetypeMatcher {
            name: "u1".to_string(),
            kind: Some(CLUSTER_INSTANCETYPE_KIND.to_string()),
            ..Default::default()
        };
        assert!(matcher.is_cluster_scoped());
    }
}
