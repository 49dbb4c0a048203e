use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::DeploymentOptions;

/// GatewayConfiguration carries the provisioning options applied to the
/// DataPlanes and ControlPlanes of every Gateway whose GatewayClass references it.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "GatewayConfiguration",
    group = "gateway-operator.dev",
    version = "v1alpha1",
    namespaced,
    shortname = "gwc"
)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfigurationSpec {
    /// Options for the DataPlane provisioned for each Gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_plane_deployment_options: Option<DeploymentOptions>,

    /// Options for the ControlPlane provisioned for each Gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_deployment_options: Option<DeploymentOptions>,
}
