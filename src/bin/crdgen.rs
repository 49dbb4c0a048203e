use kube::CustomResourceExt;

use gateway_operator::resources::controlplanes::ControlPlane;
use gateway_operator::resources::dataplanes::DataPlane;
use gateway_operator::resources::gatewayconfigurations::GatewayConfiguration;

fn main() -> anyhow::Result<()> {
    for crd in [DataPlane::crd(), ControlPlane::crd(), GatewayConfiguration::crd()] {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
