use crate::client::ClusterClient;
use crate::controllers::dataplane::defaults;
use crate::reconcilers::ensure::{ensure_owned_with, Ensured};
use crate::reconcilers::{owned_object_meta, ManagedBy};
use crate::resources::dataplanes::{DataPlane, DataPlaneSpec};
use crate::resources::gatewayconfigurations::GatewayConfigurationSpec;
use crate::resources::gateways::Gateway;
use crate::Result;

pub fn generate_dataplane(gateway: &Gateway, config: &GatewayConfigurationSpec) -> Result<DataPlane> {
    let mut deployment = config.data_plane_deployment_options.clone().unwrap_or_default();
    if defaults::needs_defaults(&deployment) {
        defaults::set_defaults(&mut deployment);
    }
    Ok(DataPlane {
        metadata: owned_object_meta::<DataPlane, _>(gateway, ManagedBy::Gateway, "")?,
        spec: DataPlaneSpec { deployment },
        status: None,
    })
}

/// Ensure the Gateway's DataPlane.
///
/// Its options only follow the GatewayConfiguration when one sets them, so the
/// DataPlane's own defaulting is left alone otherwise.
pub async fn ensure_dataplane<C: ClusterClient>(
    client: &C,
    gateway: &Gateway,
    config: &GatewayConfigurationSpec,
) -> Result<Ensured<DataPlane>> {
    let generated = generate_dataplane(gateway, config)?;
    let configured = config.data_plane_deployment_options.is_some();
    ensure_owned_with(client, gateway, ManagedBy::Gateway, generated, move |existing, generated| {
        if configured && existing.spec.deployment != generated.spec.deployment {
            existing.spec.deployment = generated.spec.deployment.clone();
            return true;
        }
        false
    })
    .await
}
