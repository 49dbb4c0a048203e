//! Access to cluster state for the reconcilers.
//!
//! Reconcilers talk to the API server only through [`ClusterClient`], which
//! keeps the reconciliation passes testable against an in-memory cluster.
//! Reads always hit the API server: a child created in one pass must be
//! visible to the list performed by the next pass.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::{Api, DeleteParams, ListParams, PostParams, Preconditions, PropagationPolicy};
use kube::runtime::events::{Event, Recorder};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::*;

use crate::resources::controlplanes::ControlPlane;
use crate::resources::dataplanes::DataPlane;
use crate::resources::gatewayconfigurations::GatewayConfiguration;
use crate::resources::gateways::{Gateway, GatewayClass};
use crate::{Error, Result};

#[cfg(test)]
pub mod fake;

/// A kind the reconcilers can read and write.
///
/// Implementations resolve the right [`Api`] for the kind's scope; cluster
/// scoped kinds ignore the namespace.
pub trait ClusterResource:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const NAMESPACED: bool;

    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced {
    ($($kind:ty),* $(,)?) => {$(
        impl ClusterResource for $kind {
            const NAMESPACED: bool = true;

            fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                match namespace {
                    Some(namespace) => Api::namespaced(client, namespace),
                    None => Api::all(client),
                }
            }
        }
    )*};
}

macro_rules! cluster_scoped {
    ($($kind:ty),* $(,)?) => {$(
        impl ClusterResource for $kind {
            const NAMESPACED: bool = false;

            fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                Api::all(client)
            }
        }
    )*};
}

namespaced!(
    ConfigMap,
    ControlPlane,
    DataPlane,
    Deployment,
    Gateway,
    GatewayConfiguration,
    Lease,
    Secret,
    Service,
    ServiceAccount,
);

cluster_scoped!(ClusterRole, ClusterRoleBinding, GatewayClass);

/// CRUD access to cluster state with optimistic concurrency.
///
/// `replace` and `replace_status` send the resourceVersion carried by the
/// object, so writing an object that changed since it was read fails with a
/// 409 conflict (see [`Error::is_conflict`]).
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Get an object, `None` if it does not exist
    async fn get<K: ClusterResource>(&self, namespace: Option<&str>, name: &str)
        -> Result<Option<K>>;

    /// List objects matching a label selector
    async fn list<K: ClusterResource>(
        &self,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<K>>;

    /// Create an object; `metadata.generateName` is honoured
    async fn create<K: ClusterResource>(&self, obj: &K) -> Result<K>;

    /// Replace an object (excluding its status)
    async fn replace<K: ClusterResource>(&self, obj: &K) -> Result<K>;

    /// Replace the status of an object
    async fn replace_status<K: ClusterResource>(&self, obj: &K) -> Result<K>;

    /// Delete exactly this object (by uid). Deleting something already gone succeeds.
    async fn delete<K: ClusterResource>(&self, obj: &K) -> Result<()>;

    async fn publish_event<K: ClusterResource>(&self, obj: &K, event: Event) -> Result<()>;
}

/// [`ClusterClient`] backed by the API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    recorder: Recorder,
}

impl KubeClusterClient {
    pub fn new(client: Client, reporter: &str) -> Self {
        Self {
            recorder: Recorder::new(client.clone(), reporter.to_owned().into()),
            client,
        }
    }
}

fn required_name<K: Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey("metadata.name"))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get<K: ClusterResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>> {
        Ok(K::api(self.client.clone(), namespace).get_opt(name).await?)
    }

    async fn list<K: ClusterResource>(
        &self,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<K>> {
        let lp = ListParams::default().labels(label_selector);
        Ok(K::api(self.client.clone(), namespace).list(&lp).await?.items)
    }

    async fn create<K: ClusterResource>(&self, obj: &K) -> Result<K> {
        let api = K::api(self.client.clone(), obj.meta().namespace.as_deref());
        let created = api.create(&PostParams::default(), obj).await?;
        debug!(
            "Created {} {} in namespace {}",
            K::kind(&()),
            created.name_any(),
            created.namespace().unwrap_or_default()
        );
        Ok(created)
    }

    async fn replace<K: ClusterResource>(&self, obj: &K) -> Result<K> {
        let name = required_name(obj)?;
        let api = K::api(self.client.clone(), obj.meta().namespace.as_deref());
        Ok(api.replace(&name, &PostParams::default(), obj).await?)
    }

    async fn replace_status<K: ClusterResource>(&self, obj: &K) -> Result<K> {
        let name = required_name(obj)?;
        let api = K::api(self.client.clone(), obj.meta().namespace.as_deref());
        Ok(api
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(obj)?)
            .await?)
    }

    async fn delete<K: ClusterResource>(&self, obj: &K) -> Result<()> {
        let name = required_name(obj)?;
        let api = K::api(self.client.clone(), obj.meta().namespace.as_deref());
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: obj.meta().uid.clone(),
                resource_version: None,
            }),
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match api.delete(&name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn publish_event<K: ClusterResource>(&self, obj: &K, event: Event) -> Result<()> {
        self.recorder.publish(&event, &obj.object_ref(&())).await?;
        Ok(())
    }
}
