use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::DeploymentOptions;

/// Image used for DataPlane proxies that don't set one
pub const DEFAULT_DATAPLANE_IMAGE: &str = "kong:3.4";

pub const DATAPLANE_PROXY_PORT: i32 = 8000;
pub const DATAPLANE_PROXY_SSL_PORT: i32 = 8443;
/// Port of the proxy's TLS admin API, which the ControlPlane connects to
pub const DATAPLANE_ADMIN_PORT: i32 = 8444;
pub const DATAPLANE_STATUS_PORT: i32 = 8100;

/// DataPlane is a request for a proxy workload. The operator converges it into
/// a Service, a TLS Secret carrying the proxy's cluster certificate and a Deployment.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "DataPlane",
    group = "gateway-operator.dev",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Provisioned\")].status"}"#,
    printcolumn = r#"{"name":"Reason", "priority": 1, "type":"string", "jsonPath":".status.conditions[?(@.type==\"Provisioned\")].reason"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "DataPlaneStatus", shortname = "dp")]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneSpec {
    #[serde(flatten)]
    pub deployment: DeploymentOptions,
}

/// Status of the DataPlane
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Name of the Service exposing the proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl DataPlane {
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}
