use crate::resources::dataplanes::DATAPLANE_ADMIN_PORT;
use crate::resources::DeploymentOptions;

pub const PUBLISH_SERVICE_ENV: &str = "CONTROLLER_PUBLISH_SERVICE";
pub const KONG_ADMIN_URL_ENV: &str = "CONTROLLER_KONG_ADMIN_URL";

/// Point the controller at the DataPlane exposed by `service` in `namespace`.
///
/// Only the two wiring entries are touched. Returns true if either changed.
pub fn set_dataplane_env(options: &mut DeploymentOptions, namespace: &str, service: &str) -> bool {
    let publish = options.set_env(PUBLISH_SERVICE_ENV, format!("{namespace}/{service}"));
    let admin = options.set_env(
        KONG_ADMIN_URL_ENV,
        format!("https://{service}.{namespace}.svc:{DATAPLANE_ADMIN_PORT}"),
    );
    publish || admin
}
