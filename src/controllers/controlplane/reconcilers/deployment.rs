use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec, Probe};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{app_labels, NAME_PREFIX};
use crate::client::ClusterClient;
use crate::reconcilers::ensure::{ensure_owned, Ensured};
use crate::reconcilers::{owned_object_meta, ManagedBy};
use crate::resources::controlplanes::{ControlPlane, DEFAULT_CONTROLPLANE_IMAGE};
use crate::Result;

const CONTAINER_NAME: &str = "controller";
const HEALTH_PORT: i32 = 10254;

/// The controller Deployment. Without a DataPlane to configure it is scaled to zero.
pub fn generate_deployment(cp: &ControlPlane, service_account: &str) -> Result<Deployment> {
    let options = &cp.spec.deployment;
    let labels = app_labels(cp);
    let replicas = match cp.spec.data_plane_name() {
        Some(_) => options.replicas,
        None => Some(0),
    };

    let container = Container {
        name: CONTAINER_NAME.into(),
        image: Some(
            options
                .container_image
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTROLPLANE_IMAGE.to_owned()),
        ),
        env: (!options.env.is_empty()).then(|| options.env.clone()),
        env_from: (!options.env_from.is_empty()).then(|| options.env_from.clone()),
        ports: Some(vec![ContainerPort {
            name: Some("health".into()),
            container_port: HEALTH_PORT,
            protocol: Some("TCP".into()),
            ..Default::default()
        }]),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/readyz".into()),
                port: IntOrString::Int(HEALTH_PORT),
                scheme: Some("HTTP".into()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: owned_object_meta::<Deployment, _>(cp, ManagedBy::ControlPlane, NAME_PREFIX)?,
        spec: Some(DeploymentSpec {
            replicas,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    service_account_name: Some(service_account.into()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

pub async fn ensure_deployment<C: ClusterClient>(
    client: &C,
    cp: &ControlPlane,
    service_account: &str,
) -> Result<Ensured<Deployment>> {
    let generated = generate_deployment(cp, service_account)?;
    ensure_owned(client, cp, ManagedBy::ControlPlane, generated).await
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    use super::*;
    use crate::resources::controlplanes::ControlPlaneSpec;

    fn controlplane(data_plane: Option<&str>) -> ControlPlane {
        let mut cp = ControlPlane::new(
            "edge-ctrl",
            ControlPlaneSpec {
                data_plane: data_plane.map(Into::into),
                ..Default::default()
            },
        );
        cp.metadata.namespace = Some("infra".into());
        cp.metadata.uid = Some("cp-uid".into());
        cp.spec.deployment.replicas = Some(2);
        cp
    }

    #[test]
    fn dormant_controller_has_no_replicas() {
        let deployment = generate_deployment(&controlplane(None), "controlplane-edge-ctrl-x").unwrap();
        assert_eq!(deployment.spec.unwrap().replicas, Some(0));
    }

    #[test]
    fn active_controller_runs_as_its_service_account() {
        let deployment = generate_deployment(&controlplane(Some("edge")), "controlplane-edge-ctrl-x").unwrap();
        assert_json_include!(
            actual: serde_json::to_value(&deployment).unwrap(),
            expected: json!({
                "metadata": {"generateName": "controlplane-edge-ctrl-", "namespace": "infra"},
                "spec": {
                    "replicas": 2,
                    "template": {
                        "spec": {
                            "serviceAccountName": "controlplane-edge-ctrl-x",
                            "containers": [{"name": "controller", "image": DEFAULT_CONTROLPLANE_IMAGE}],
                        },
                    },
                },
            })
        );
    }
}
