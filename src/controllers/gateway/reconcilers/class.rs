use kube::ResourceExt;
use tracing::*;

use crate::client::ClusterClient;
use crate::resources::gatewayconfigurations::{GatewayConfiguration, GatewayConfigurationSpec};
use crate::resources::gateways::{Gateway, GatewayClass};
use crate::resources::OPERATOR_GROUP;
use crate::{Error, Result};

const CONFIGURATION_KIND: &str = "GatewayConfiguration";

/// The GatewayClass of `gateway`, if it exists and is handled by `controller_name`
pub async fn supported_class<C: ClusterClient>(
    client: &C,
    gateway: &Gateway,
    controller_name: &str,
) -> Result<Option<GatewayClass>> {
    let class_name = &gateway.spec.gateway_class_name;
    if class_name.is_empty() {
        return Ok(None);
    }
    let class: Option<GatewayClass> = client.get(None, class_name).await?;
    Ok(class.filter(|c| c.spec.controller_name == controller_name))
}

/// Namespace and name of the GatewayConfiguration referenced by `class`.
///
/// `None` when the class has no parametersRef; an error when it points at
/// anything other than a fully qualified GatewayConfiguration.
pub fn configuration_ref(class: &GatewayClass) -> Result<Option<(String, String)>> {
    let Some(parameters) = class.spec.parameters_ref.as_ref() else {
        return Ok(None);
    };
    if parameters.group != OPERATOR_GROUP || parameters.kind != CONFIGURATION_KIND {
        return Err(Error::InvalidGatewayConfigurationRef(format!(
            "GatewayClass {} references {}/{}, only {OPERATOR_GROUP} {CONFIGURATION_KIND} is supported",
            class.name_any(),
            parameters.group,
            parameters.kind
        )));
    }
    let namespace = parameters.namespace.as_deref().unwrap_or_default();
    if namespace.is_empty() || parameters.name.is_empty() {
        return Err(Error::InvalidGatewayConfigurationRef(format!(
            "GatewayClass {} has an invalid parametersRef: both namespace and name must be provided",
            class.name_any()
        )));
    }
    Ok(Some((namespace.to_owned(), parameters.name.clone())))
}

/// Effective configuration for the Gateways of `class`, the default when it has none
pub async fn gateway_configuration<C: ClusterClient>(
    client: &C,
    class: &GatewayClass,
) -> Result<GatewayConfigurationSpec> {
    let Some((namespace, name)) = configuration_ref(class)? else {
        debug!("GatewayClass {} has no parametersRef, using defaults", class.name_any());
        return Ok(GatewayConfigurationSpec::default());
    };
    let configuration: Option<GatewayConfiguration> = client.get(Some(&namespace), &name).await?;
    configuration.map(|c| c.spec).ok_or_else(|| {
        Error::InvalidGatewayConfigurationRef(format!(
            "GatewayConfiguration {namespace}/{name} referenced by GatewayClass {} does not exist",
            class.name_any()
        ))
    })
}
