use k8s_openapi::api::core::v1::{EnvFromSource, EnvVar};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod controlplanes;
pub mod dataplanes;
pub mod gatewayconfigurations;
pub mod gateways;

/// API group of the custom resources owned by this operator
pub const OPERATOR_GROUP: &str = "gateway-operator.dev";

/// Options shared by every workload the operator provisions.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentOptions {
    /// Container image to run. Defaults to the operator's image for the workload kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,

    /// Environment variables passed to the workload container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Sources to populate environment variables in the workload container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvFromSource>,

    /// Number of desired pods. When unset the workload keeps its default (or autoscaled) count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 0))]
    pub replicas: Option<i32>,
}

impl DeploymentOptions {
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    /// Set `name` to `value`, returning true if the env list changed
    pub fn set_env(&mut self, name: &str, value: impl Into<String>) -> bool {
        let value = value.into();
        match self.env.iter_mut().find(|e| e.name == name) {
            Some(existing) if existing.value.as_deref() == Some(value.as_str()) => false,
            Some(existing) => {
                existing.value = Some(value);
                existing.value_from = None;
                true
            }
            None => {
                self.env.push(EnvVar {
                    name: name.to_owned(),
                    value: Some(value),
                    value_from: None,
                });
                true
            }
        }
    }
}
