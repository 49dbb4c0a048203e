use crate::resources::dataplanes::DEFAULT_DATAPLANE_IMAGE;
use crate::resources::DeploymentOptions;

/// Mount point of the DataPlane's cluster certificate secret
pub const CLUSTER_CERTIFICATE_PATH: &str = "/var/cluster-certificate";

/// Environment of a DB-less proxy listening on the ports exposed by the DataPlane Service
const DEFAULT_ENV: &[(&str, &str)] = &[
    ("KONG_ADMIN_ACCESS_LOG", "/dev/stdout"),
    ("KONG_ADMIN_ERROR_LOG", "/dev/stderr"),
    ("KONG_ADMIN_GUI_ACCESS_LOG", "/dev/stdout"),
    ("KONG_ADMIN_GUI_ERROR_LOG", "/dev/stderr"),
    ("KONG_ADMIN_LISTEN", "0.0.0.0:8444 http2 ssl"),
    ("KONG_ADMIN_SSL_CERT", "/var/cluster-certificate/tls.crt"),
    ("KONG_ADMIN_SSL_CERT_KEY", "/var/cluster-certificate/tls.key"),
    ("KONG_CLUSTER_CERT", "/var/cluster-certificate/tls.crt"),
    ("KONG_CLUSTER_CERT_KEY", "/var/cluster-certificate/tls.key"),
    ("KONG_CLUSTER_LISTEN", "off"),
    ("KONG_DATABASE", "off"),
    ("KONG_NGINX_WORKER_PROCESSES", "2"),
    ("KONG_PLUGINS", "bundled"),
    ("KONG_PORT_MAPS", "80:8000, 443:8443"),
    ("KONG_PROXY_ACCESS_LOG", "/dev/stdout"),
    ("KONG_PROXY_ERROR_LOG", "/dev/stderr"),
    ("KONG_PROXY_LISTEN", "0.0.0.0:8000, 0.0.0.0:8443 http2 ssl"),
    ("KONG_STATUS_LISTEN", "0.0.0.0:8100"),
];

/// Whether the options carry no environment configuration at all
pub fn needs_defaults(options: &DeploymentOptions) -> bool {
    options.env.is_empty() && options.env_from.is_empty()
}

/// Fill in the default image and environment of a DataPlane proxy.
///
/// Explicitly set values are kept. Returns true if anything changed.
pub fn set_defaults(options: &mut DeploymentOptions) -> bool {
    let mut changed = false;
    if options.container_image.is_none() {
        options.container_image = Some(DEFAULT_DATAPLANE_IMAGE.to_owned());
        changed = true;
    }
    for (name, value) in DEFAULT_ENV {
        if options.env.iter().all(|e| e.name != *name) {
            changed |= options.set_env(name, *value);
        }
    }
    changed
}
