use kube::ResourceExt;

use crate::client::ClusterClient;
use crate::controllers::controlplane::env::set_dataplane_env;
use crate::reconcilers::ensure::{ensure_owned_with, Ensured};
use crate::reconcilers::{owned_object_meta, ManagedBy};
use crate::resources::controlplanes::{ControlPlane, ControlPlaneSpec};
use crate::resources::dataplanes::DataPlane;
use crate::resources::gatewayconfigurations::GatewayConfigurationSpec;
use crate::resources::gateways::Gateway;
use crate::Result;

/// The ControlPlane of `gateway`, wired to `dataplane` through its Service `service`
pub fn generate_controlplane(
    gateway: &Gateway,
    class_name: &str,
    config: &GatewayConfigurationSpec,
    dataplane: &DataPlane,
    service: &str,
) -> Result<ControlPlane> {
    let metadata = owned_object_meta::<ControlPlane, _>(gateway, ManagedBy::Gateway, "")?;
    let mut deployment = config.control_plane_deployment_options.clone().unwrap_or_default();
    set_dataplane_env(
        &mut deployment,
        metadata.namespace.as_deref().unwrap_or_default(),
        service,
    );
    Ok(ControlPlane {
        metadata,
        spec: ControlPlaneSpec {
            deployment,
            data_plane: Some(dataplane.name_any()),
            gateway_class: Some(class_name.to_owned()),
        },
        status: None,
    })
}

pub async fn ensure_controlplane<C: ClusterClient>(
    client: &C,
    gateway: &Gateway,
    class_name: &str,
    config: &GatewayConfigurationSpec,
    dataplane: &DataPlane,
    service: &str,
) -> Result<Ensured<ControlPlane>> {
    let generated = generate_controlplane(gateway, class_name, config, dataplane, service)?;
    let configured = config.control_plane_deployment_options.is_some();
    ensure_owned_with(client, gateway, ManagedBy::Gateway, generated, move |existing, generated| {
        let mut changed = false;
        if existing.spec.data_plane != generated.spec.data_plane {
            existing.spec.data_plane = generated.spec.data_plane.clone();
            changed = true;
        }
        if existing.spec.gateway_class != generated.spec.gateway_class {
            existing.spec.gateway_class = generated.spec.gateway_class.clone();
            changed = true;
        }
        if configured && existing.spec.deployment != generated.spec.deployment {
            existing.spec.deployment = generated.spec.deployment.clone();
            changed = true;
        }
        changed
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeCluster;
    use crate::controllers::controlplane::env::PUBLISH_SERVICE_ENV;
    use crate::resources::dataplanes::DataPlaneSpec;
    use crate::resources::gateways::GatewaySpec;
    use crate::resources::DeploymentOptions;

    fn fixtures(fake: &FakeCluster) -> (Gateway, DataPlane) {
        let mut gateway = Gateway::new(
            "edge",
            GatewaySpec {
                gateway_class_name: "kong".into(),
                ..Default::default()
            },
        );
        gateway.metadata.namespace = Some("infra".into());
        let mut dataplane = DataPlane::new("edge-00001", DataPlaneSpec::default());
        dataplane.metadata.namespace = Some("infra".into());
        (fake.insert(gateway), fake.insert(dataplane))
    }

    #[test]
    fn generated_controlplane_points_at_the_dataplane() {
        let fake = FakeCluster::new();
        let (gateway, dataplane) = fixtures(&fake);
        let config = GatewayConfigurationSpec {
            control_plane_deployment_options: Some(DeploymentOptions {
                replicas: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };
        let cp = generate_controlplane(&gateway, "kong", &config, &dataplane, "dataplane-edge-00001-svc").unwrap();
        assert_eq!(cp.metadata.generate_name.as_deref(), Some("edge-"));
        assert_eq!(cp.spec.data_plane.as_deref(), Some("edge-00001"));
        assert_eq!(cp.spec.gateway_class.as_deref(), Some("kong"));
        assert_eq!(cp.spec.deployment.replicas, Some(2));
        assert_eq!(
            cp.spec.deployment.env_value(PUBLISH_SERVICE_ENV),
            Some("infra/dataplane-edge-00001-svc")
        );
    }

    #[tokio::test]
    async fn dataplane_reference_is_restored() {
        let fake = FakeCluster::new();
        let (gateway, dataplane) = fixtures(&fake);
        let config = GatewayConfigurationSpec::default();

        let created = ensure_controlplane(&fake, &gateway, "kong", &config, &dataplane, "svc")
            .await
            .unwrap();
        assert!(created.changed());
        let name = created.get().name_any();

        fake.modify::<ControlPlane>(Some("infra"), &name, |cp| {
            cp.spec.data_plane = None;
            cp.spec.deployment.replicas = Some(5);
        });
        let restored = ensure_controlplane(&fake, &gateway, "kong", &config, &dataplane, "svc")
            .await
            .unwrap();
        assert!(restored.changed());
        assert_eq!(restored.get().spec.data_plane.as_deref(), Some("edge-00001"));
        assert_eq!(restored.get().spec.deployment.replicas, Some(5));
        assert!(!ensure_controlplane(&fake, &gateway, "kong", &config, &dataplane, "svc")
            .await
            .unwrap()
            .changed());
    }
}
