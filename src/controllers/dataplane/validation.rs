//! Checks a DataPlane spec must pass before any workload is provisioned for it.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::{ConfigMap, EnvVar, Secret};
use thiserror::Error;

use crate::client::ClusterClient;
use crate::resources::dataplanes::DataPlane;

const DATABASE_ENV: &str = "KONG_DATABASE";

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("database backend {0} of DataPlane not supported currently")]
    UnsupportedDatabase(String),

    #[error("environment variables must have a name")]
    EmptyEnvName,

    #[error("environment variable {0} is set more than once")]
    DuplicateEnv(String),

    /// Looking up a referenced ConfigMap or Secret failed; not a verdict on the spec
    #[error(transparent)]
    Lookup(#[from] crate::Error),
}

/// Validate the DataPlane spec, reading referenced ConfigMaps and Secrets through `client`
pub async fn validate<C: ClusterClient>(client: &C, dataplane: &DataPlane) -> Result<(), ValidationError> {
    let options = &dataplane.spec.deployment;

    let mut names = HashSet::new();
    for env in &options.env {
        if env.name.is_empty() {
            return Err(ValidationError::EmptyEnvName);
        }
        if !names.insert(env.name.as_str()) {
            return Err(ValidationError::DuplicateEnv(env.name.clone()));
        }
    }

    let namespace = dataplane.metadata.namespace.as_deref();
    if let Some(database) = database_setting(client, namespace, dataplane).await? {
        if !(database.is_empty() || database == "off") {
            return Err(ValidationError::UnsupportedDatabase(database));
        }
    }
    Ok(())
}

/// The effective value of the database env var: `env` wins over `envFrom`, later sources win
async fn database_setting<C: ClusterClient>(
    client: &C,
    namespace: Option<&str>,
    dataplane: &DataPlane,
) -> crate::Result<Option<String>> {
    let options = &dataplane.spec.deployment;
    if let Some(env) = options.env.iter().find(|e| e.name == DATABASE_ENV) {
        return env_var_value(client, namespace, env).await;
    }

    let mut value = None;
    for source in &options.env_from {
        let Some(key) = DATABASE_ENV.strip_prefix(source.prefix.as_deref().unwrap_or_default()) else {
            continue;
        };
        if let Some(cm_ref) = &source.config_map_ref {
            if let Some(found) = config_map_value(client, namespace, &cm_ref.name, key).await? {
                value = Some(found);
            }
        }
        if let Some(secret_ref) = &source.secret_ref {
            if let Some(found) = secret_value(client, namespace, &secret_ref.name, key).await? {
                value = Some(found);
            }
        }
    }
    Ok(value)
}

async fn env_var_value<C: ClusterClient>(
    client: &C,
    namespace: Option<&str>,
    env: &EnvVar,
) -> crate::Result<Option<String>> {
    if let Some(value) = &env.value {
        return Ok(Some(value.clone()));
    }
    let Some(source) = &env.value_from else {
        return Ok(None);
    };
    if let Some(selector) = &source.config_map_key_ref {
        return config_map_value(client, namespace, &selector.name, &selector.key).await;
    }
    if let Some(selector) = &source.secret_key_ref {
        return secret_value(client, namespace, &selector.name, &selector.key).await;
    }
    Ok(None)
}

async fn config_map_value<C: ClusterClient>(
    client: &C,
    namespace: Option<&str>,
    name: &str,
    key: &str,
) -> crate::Result<Option<String>> {
    let cm: Option<ConfigMap> = client.get(namespace, name).await?;
    Ok(cm
        .and_then(|cm| cm.data)
        .and_then(|mut data| data.remove(key)))
}

async fn secret_value<C: ClusterClient>(
    client: &C,
    namespace: Option<&str>,
    name: &str,
    key: &str,
) -> crate::Result<Option<String>> {
    let secret: Option<Secret> = client.get(namespace, name).await?;
    Ok(secret
        .and_then(|s| s.data)
        .and_then(|mut data| data.remove(key))
        .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned()))
}
