use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::DeploymentOptions;

/// Image used for ControlPlane controllers that don't set one
pub const DEFAULT_CONTROLPLANE_IMAGE: &str = "kong/kubernetes-ingress-controller:2.12";

/// Removing this finalizer lets a ControlPlane go once its cluster-scoped RBAC is cleaned up
pub static CONTROLPLANE_FINALIZER: &str = "gateway-operator.dev/cluster-resources";

/// ControlPlane is a request for a controller workload which configures a DataPlane.
/// While no DataPlane is referenced its Deployment is kept at zero replicas.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "ControlPlane",
    group = "gateway-operator.dev",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Provisioned\")].status"}"#,
    printcolumn = r#"{"name":"DataPlane", "type":"string", "jsonPath":".spec.dataPlane"}"#,
    printcolumn = r#"{"name":"Reason", "priority": 1, "type":"string", "jsonPath":".status.conditions[?(@.type==\"Provisioned\")].reason"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ControlPlaneStatus", shortname = "cp")]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    #[serde(flatten)]
    pub deployment: DeploymentOptions,

    /// Name of the DataPlane, in the same namespace, this ControlPlane configures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_plane: Option<String>,

    /// Name of the GatewayClass this ControlPlane was provisioned for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_class: Option<String>,
}

impl ControlPlaneSpec {
    /// Returns the referenced DataPlane name, treating an empty string as unset
    pub fn data_plane_name(&self) -> Option<&str> {
        self.data_plane.as_deref().filter(|name| !name.is_empty())
    }
}

/// Status of the ControlPlane
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ControlPlane {
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}
