use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, SecretVolumeSource,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{app_labels, NAME_PREFIX};
use crate::client::ClusterClient;
use crate::controllers::dataplane::defaults::CLUSTER_CERTIFICATE_PATH;
use crate::reconcilers::ensure::{ensure_owned, Ensured};
use crate::reconcilers::{owned_object_meta, ManagedBy};
use crate::resources::dataplanes::{
    DataPlane, DATAPLANE_ADMIN_PORT, DATAPLANE_PROXY_PORT, DATAPLANE_PROXY_SSL_PORT,
    DATAPLANE_STATUS_PORT, DEFAULT_DATAPLANE_IMAGE,
};
use crate::Result;

const CONTAINER_NAME: &str = "proxy";
const CERTIFICATE_VOLUME: &str = "cluster-certificate";

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.into()),
        container_port: port,
        protocol: Some("TCP".into()),
        ..Default::default()
    }
}

pub fn generate_deployment(dataplane: &DataPlane, certificate_secret: &str) -> Result<Deployment> {
    let options = &dataplane.spec.deployment;
    let labels = app_labels(dataplane);

    let container = Container {
        name: CONTAINER_NAME.into(),
        image: Some(
            options
                .container_image
                .clone()
                .unwrap_or_else(|| DEFAULT_DATAPLANE_IMAGE.to_owned()),
        ),
        env: (!options.env.is_empty()).then(|| options.env.clone()),
        env_from: (!options.env_from.is_empty()).then(|| options.env_from.clone()),
        ports: Some(vec![
            container_port("proxy", DATAPLANE_PROXY_PORT),
            container_port("proxy-ssl", DATAPLANE_PROXY_SSL_PORT),
            container_port("admin-ssl", DATAPLANE_ADMIN_PORT),
            container_port("metrics", DATAPLANE_STATUS_PORT),
        ]),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/status".into()),
                port: IntOrString::Int(DATAPLANE_STATUS_PORT),
                scheme: Some("HTTP".into()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: CERTIFICATE_VOLUME.into(),
            mount_path: CLUSTER_CERTIFICATE_PATH.into(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: owned_object_meta::<Deployment, _>(dataplane, ManagedBy::DataPlane, NAME_PREFIX)?,
        spec: Some(DeploymentSpec {
            replicas: options.replicas,
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
                    volumes: Some(vec![Volume {
                        name: CERTIFICATE_VOLUME.into(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(certificate_secret.into()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
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
    dataplane: &DataPlane,
    certificate_secret: &str,
) -> Result<Ensured<Deployment>> {
    let generated = generate_deployment(dataplane, certificate_secret)?;
    ensure_owned(client, dataplane, ManagedBy::DataPlane, generated).await
}
