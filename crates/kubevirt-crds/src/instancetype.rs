//! Instance type and preference CRDs (instancetype.kubevirt.io/v1beta1)
//!
//! The controller only reads the metadata of these objects (labels and
//! annotations are inherited by VMs referencing them); their `spec` is kept
//! minimal.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Guest CPU topology of an instance type
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CpuInstancetype {
    #[serde(default)]
    pub guest: u32,
}

/// Guest memory of an instance type
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInstancetype {
    /// Quantity string, e.g. "4Gi"
    #[serde(default)]
    pub guest: String,
}

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "instancetype.kubevirt.io",
    version = "v1beta1",
    kind = "VirtualMachineClusterInstancetype"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineClusterInstancetypeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuInstancetype>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryInstancetype>,
}

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "instancetype.kubevirt.io",
    version = "v1beta1",
    kind = "VirtualMachineInstancetype",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstancetypeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuInstancetype>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryInstancetype>,
}

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "instancetype.kubevirt.io",
    version = "v1beta1",
    kind = "VirtualMachineClusterPreference"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineClusterPreferenceSpec {
    /// Untyped preference body (devices, firmware, cpu, ...)
    #[serde(flatten)]
    pub preferences: serde_json::Map<String, serde_json::Value>,
}

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "instancetype.kubevirt.io",
    version = "v1beta1",
    kind = "VirtualMachinePreference",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachinePreferenceSpec {
    #[serde(flatten)]
    pub preferences: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;
    use serde_json::json;

    #[test]
    fn test_api_coordinates() {
        assert_eq!(VirtualMachineClusterInstancetype::group(&()), "instancetype.kubevirt.io");
        assert_eq!(VirtualMachineClusterInstancetype::version(&()), "v1beta1");
        assert_eq!(VirtualMachinePreference::kind(&()), "VirtualMachinePreference");
    }

    #[test]
    fn test_preference_keeps_unknown_fields() {
        let pref: VirtualMachineClusterPreference = serde_json::from_value(json!({
            "apiVersion": "instancetype.kubevirt.io/v1beta1",
            "kind": "VirtualMachineClusterPreference",
            "metadata": {"name": "rhel.9", "labels": {"os": "rhel"}},
            "spec": {"devices": {"preferredDiskBus": "virtio"}}
        }))
        .unwrap();
        assert!(pref.spec.preferences.contains_key("devices"));
        assert_eq!(pref.metadata.labels.unwrap()["os"], "rhel");
    }
}
