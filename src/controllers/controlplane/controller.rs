use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta};
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{metadata_watcher, reflector, watcher, Predicate, WatchStreamExt};
use kube::{Client, ResourceExt};
use tracing::*;

use super::env::set_dataplane_env;
use super::reconcilers::deployment::ensure_deployment;
use super::reconcilers::rbac::{
    delete_cluster_resources, ensure_cluster_role, ensure_cluster_role_binding, ensure_service_account,
};
use crate::client::{ClusterClient, KubeClusterClient};
use crate::controllers::{
    changed_predicate, controller_config, ensure_deletion_change, error_policy, run_pass,
    status_predicate_serde, Context,
};
use crate::reconcilers::conditions::{
    self, CONDITION_PROVISIONED, REASON_NO_DATAPLANE, REASON_PODS_NOT_READY, REASON_PODS_READY,
};
use crate::reconcilers::{deployment_ready, is_owned_by, ManagedBy};
use crate::resources::controlplanes::{ControlPlane, CONTROLPLANE_FINALIZER};
use crate::resources::dataplanes::DataPlane;
use crate::{telemetry, Error, Result};

const SCHEDULED_MESSAGE: &str = "ControlPlane resource is scheduled for provisioning";
const NO_DATAPLANE_MESSAGE: &str = "DataPlane is not set";
const DATAPLANE_SET_MESSAGE: &str = "DataPlane was set, ControlPlane resource is scheduled for provisioning";
const WAITING_MESSAGE: &str = "waiting for the ControlPlane Deployment to become available";
const READY_MESSAGE: &str = "pods for all Deployments are ready";

#[instrument(skip(ctx, cp), fields(trace_id))]
pub async fn reconcile<C: ClusterClient>(cp: Arc<ControlPlane>, ctx: Arc<Context<C>>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    run_pass(cp.as_ref(), &ctx, reconcile_controlplane(&cp, &ctx)).await
}

fn provisioned(cp: &ControlPlane, status: bool, reason: &str, message: &str) -> Condition {
    conditions::new_condition(CONDITION_PROVISIONED, status, reason, message, cp.metadata.generation)
}

async fn set_provisioned<C: ClusterClient>(client: &C, cp: &mut ControlPlane, condition: Condition) -> Result<bool> {
    let status = cp.status.get_or_insert_with(Default::default);
    if !conditions::set(&mut status.conditions, condition) {
        return Ok(false);
    }
    *cp = client.replace_status(cp).await?;
    Ok(true)
}

fn has_finalizer(cp: &ControlPlane) -> bool {
    cp.finalizers().iter().any(|f| f == CONTROLPLANE_FINALIZER)
}

/// The Provisioned condition that should follow from whether a DataPlane is referenced,
/// if it differs from the current one
fn dataplane_transition(cp: &ControlPlane) -> Option<Condition> {
    let current = conditions::find(cp.conditions(), CONDITION_PROVISIONED);
    let dormant = current.is_some_and(|c| c.reason == REASON_NO_DATAPLANE);
    match (cp.spec.data_plane_name(), dormant) {
        (None, false) => Some(provisioned(cp, false, REASON_NO_DATAPLANE, NO_DATAPLANE_MESSAGE)),
        (Some(_), true) => Some(provisioned(cp, false, REASON_PODS_NOT_READY, DATAPLANE_SET_MESSAGE)),
        _ => None,
    }
}

async fn reconcile_controlplane<C: ClusterClient>(cp: &ControlPlane, ctx: &Context<C>) -> Result<Action> {
    let client = &ctx.client;
    let name = cp.name_any();
    let namespace = cp
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;

    let current: Option<ControlPlane> = client.get(Some(&namespace), &name).await?;
    let Some(mut cp) = current else {
        debug!("ControlPlane {namespace}/{name} no longer exists");
        return Ok(Action::await_change());
    };

    if cp.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&cp) {
            info!("Cleaning up cluster resources of ControlPlane {namespace}/{name}");
            delete_cluster_resources(client, &cp).await?;
            cp.finalizers_mut().retain(|f| f != CONTROLPLANE_FINALIZER);
            client.replace(&cp).await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&cp) {
        cp.finalizers_mut().push(CONTROLPLANE_FINALIZER.to_owned());
        client.replace(&cp).await?;
        return Ok(Action::await_change());
    }

    info!("Reconciling ControlPlane \"{name}\" in {namespace}");

    if conditions::find(cp.conditions(), CONDITION_PROVISIONED).is_none() {
        let scheduled = provisioned(&cp, false, REASON_PODS_NOT_READY, SCHEDULED_MESSAGE);
        set_provisioned(client, &mut cp, scheduled).await?;
        return Ok(Action::await_change());
    }

    if let Some(condition) = dataplane_transition(&cp) {
        info!("ControlPlane {name}: {}", condition.message);
        set_provisioned(client, &mut cp, condition).await?;
        return Ok(Action::await_change());
    }

    if let Some(dataplane_name) = cp.spec.data_plane_name().map(str::to_owned) {
        let dataplane: Option<DataPlane> = client.get(Some(&namespace), &dataplane_name).await?;
        let service = dataplane
            .as_ref()
            .and_then(|dp| dp.status.as_ref())
            .and_then(|s| s.service.clone());
        let Some(service) = service else {
            debug!("DataPlane {dataplane_name} has no service yet");
            return Ok(Action::await_change());
        };
        if set_dataplane_env(&mut cp.spec.deployment, &namespace, &service) {
            debug!("Pointing ControlPlane {name} at Service {service}");
            client.replace(&cp).await?;
            return Ok(Action::await_change());
        }
    }

    let service_account = ensure_service_account(client, &cp).await?;
    if service_account.changed() {
        return Ok(Action::await_change());
    }
    let cluster_role = ensure_cluster_role(client, &cp).await?;
    if cluster_role.changed() {
        return Ok(Action::await_change());
    }
    let binding = ensure_cluster_role_binding(client, &cp, service_account.get(), cluster_role.get()).await?;
    if binding.changed() {
        return Ok(Action::await_change());
    }

    let deployment = ensure_deployment(client, &cp, &service_account.get().name_any()).await?;
    if deployment.changed() {
        return Ok(Action::await_change());
    }

    if !deployment_ready(deployment.get()) {
        debug!("Deployment for ControlPlane {name} is not ready");
        let was_ready = conditions::find(cp.conditions(), CONDITION_PROVISIONED)
            .is_some_and(|c| c.status == "True");
        if was_ready {
            let waiting = provisioned(&cp, false, REASON_PODS_NOT_READY, WAITING_MESSAGE);
            set_provisioned(client, &mut cp, waiting).await?;
        }
        return Ok(Action::await_change());
    }

    let ready = provisioned(&cp, true, REASON_PODS_READY, READY_MESSAGE);
    if set_provisioned(client, &mut cp, ready).await? {
        info!("ControlPlane {name} is provisioned");
    }
    Ok(Action::await_change())
}

/// ControlPlanes owning the object described by `meta`
fn owners(store: &Store<ControlPlane>, meta: &ObjectMeta) -> Vec<ObjectRef<ControlPlane>> {
    store
        .state()
        .iter()
        .filter(|cp| cp.uid().is_some_and(|uid| is_owned_by(meta, &uid)))
        .map(|cp| ObjectRef::from_obj(cp.as_ref()))
        .collect()
}

/// Initialize the ControlPlane controller and run it until shutdown
pub async fn run(client: Client, ctx: Arc<Context<KubeClusterClient>>) {
    let cp_api = Api::<ControlPlane>::all(client.clone());
    let deploy_api = Api::<Deployment>::all(client.clone());
    let sa_api = Api::<ServiceAccount>::all(client.clone());
    let role_api = Api::<ClusterRole>::all(client.clone());
    let binding_api = Api::<ClusterRoleBinding>::all(client.clone());
    let dp_api = Api::<DataPlane>::all(client.clone());

    let cfg = watcher::Config::default().labels(&ManagedBy::ControlPlane.selector());

    let (cp_store, cp_writer) = reflector::store();
    let cp_reflector = reflector(cp_writer, watcher(cp_api, watcher::Config::default()))
        .touched_objects()
        .default_backoff();

    let deploy_watcher = watcher(deploy_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate.combine(status_predicate_serde));

    let sa_watcher = metadata_watcher(sa_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    // ownerReferences carry no namespace, so owners are looked up by uid
    let role_watcher = metadata_watcher(role_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);
    let binding_watcher = metadata_watcher(binding_api, cfg)
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    // a DataPlane's status carries the service its ControlPlanes point at
    let dp_watcher = watcher(dp_api, watcher::Config::default())
        .touched_objects()
        .default_backoff();

    let role_store = cp_store.clone();
    let binding_store = cp_store.clone();
    let dp_store = cp_store.clone();

    info!("Starting ControlPlane controller");
    Controller::for_stream(cp_reflector, cp_store)
        .with_config(controller_config(&ctx.config))
        .shutdown_on_signal()
        .owns_stream(deploy_watcher)
        .owns_stream(sa_watcher)
        .watches_stream(role_watcher, move |role| owners(&role_store, &role.metadata))
        .watches_stream(binding_watcher, move |binding| owners(&binding_store, &binding.metadata))
        .watches_stream(dp_watcher, move |dp| {
            let namespace = dp.namespace();
            let name = dp.name_any();
            dp_store
                .state()
                .iter()
                .filter(|cp| cp.namespace() == namespace && cp.spec.data_plane_name() == Some(name.as_str()))
                .map(|cp| ObjectRef::from_obj(cp.as_ref()))
                .collect::<Vec<_>>()
        })
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
