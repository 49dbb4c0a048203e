use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType};
use kube::runtime::{metadata_watcher, watcher, Predicate, WatchStreamExt};
use kube::{Client, ResourceExt};
use tracing::*;

use super::defaults;
use super::reconcilers::certificate::ensure_certificate;
use super::reconcilers::deployment::ensure_deployment;
use super::reconcilers::service::ensure_service;
use super::validation::{validate, ValidationError};
use crate::client::{ClusterClient, KubeClusterClient};
use crate::controllers::{
    changed_predicate, controller_config, ensure_deletion_change, error_policy, run_pass,
    spec_predicate_serde, status_predicate_serde, Context,
};
use crate::reconcilers::conditions::{
    self, CONDITION_PROVISIONED, REASON_PODS_NOT_READY, REASON_PODS_READY, REASON_VALIDATION_FAILED,
};
use crate::reconcilers::{deployment_ready, ManagedBy};
use crate::resources::dataplanes::DataPlane;
use crate::{telemetry, Error, Result};

const SCHEDULED_MESSAGE: &str = "DataPlane resource is scheduled for provisioning";
const WAITING_MESSAGE: &str = "waiting for the DataPlane Deployment to become available";
const READY_MESSAGE: &str = "pods for all Deployments are ready";

#[instrument(skip(ctx, dp), fields(trace_id))]
pub async fn reconcile<C: ClusterClient>(dp: Arc<DataPlane>, ctx: Arc<Context<C>>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    run_pass(dp.as_ref(), &ctx, reconcile_dataplane(&dp, &ctx)).await
}

fn provisioned(dp: &DataPlane, status: bool, reason: &str, message: impl Into<String>) -> Condition {
    conditions::new_condition(
        CONDITION_PROVISIONED,
        status,
        reason,
        message,
        dp.metadata.generation,
    )
}

/// Set the Provisioned condition, writing the status only if it changed
async fn set_provisioned<C: ClusterClient>(client: &C, dp: &mut DataPlane, condition: Condition) -> Result<bool> {
    let status = dp.status.get_or_insert_with(Default::default);
    if !conditions::set(&mut status.conditions, condition) {
        return Ok(false);
    }
    *dp = client.replace_status(dp).await?;
    Ok(true)
}

async fn reconcile_dataplane<C: ClusterClient>(dp: &DataPlane, ctx: &Context<C>) -> Result<Action> {
    let client = &ctx.client;
    let name = dp.name_any();
    let namespace = dp
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;

    let current: Option<DataPlane> = client.get(Some(&namespace), &name).await?;
    let Some(mut dp) = current else {
        debug!("DataPlane {namespace}/{name} no longer exists");
        return Ok(Action::await_change());
    };
    info!("Reconciling DataPlane \"{name}\" in {namespace}");

    if conditions::find(dp.conditions(), CONDITION_PROVISIONED).is_none() {
        let scheduled = provisioned(&dp, false, REASON_PODS_NOT_READY, SCHEDULED_MESSAGE);
        set_provisioned(client, &mut dp, scheduled).await?;
        return Ok(Action::await_change());
    }

    let service = ensure_service(client, &dp).await?;
    let service_name = service.get().name_any();
    let recorded = dp.status.as_ref().and_then(|s| s.service.as_deref());
    let record_stale = recorded != Some(service_name.as_str());
    if record_stale {
        dp.status.get_or_insert_with(Default::default).service = Some(service_name.clone());
        client.replace_status(&dp).await?;
    }
    if service.changed() || record_stale {
        return Ok(Action::await_change());
    }

    let cluster_ip = service
        .get()
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.as_deref())
        .unwrap_or_default();
    if cluster_ip.is_empty() {
        debug!("Service {service_name} has no cluster IP yet");
        return Ok(Action::await_change());
    }

    if defaults::needs_defaults(&dp.spec.deployment) {
        debug!("No environment configured for DataPlane {name}, applying defaults");
        defaults::set_defaults(&mut dp.spec.deployment);
        client.replace(&dp).await?;
        return Ok(Action::await_change());
    }

    match validate(client, &dp).await {
        Ok(()) => {
            let failed = conditions::find(dp.conditions(), CONDITION_PROVISIONED)
                .is_some_and(|c| c.reason == REASON_VALIDATION_FAILED);
            if failed {
                info!("DataPlane {name} passes validation again");
                let rescheduled = provisioned(&dp, false, REASON_PODS_NOT_READY, SCHEDULED_MESSAGE);
                set_provisioned(client, &mut dp, rescheduled).await?;
                return Ok(Action::await_change());
            }
        }
        Err(ValidationError::Lookup(err)) => return Err(err),
        Err(err) => {
            let message = err.to_string();
            info!("DataPlane {name} failed validation: {message}");
            let failed = provisioned(&dp, false, REASON_VALIDATION_FAILED, message.clone());
            if set_provisioned(client, &mut dp, failed).await? {
                let event = Event {
                    type_: EventType::Warning,
                    reason: REASON_VALIDATION_FAILED.into(),
                    note: Some(message),
                    action: "Validate".into(),
                    secondary: None,
                };
                client.publish_event(&dp, event).await?;
            }
            return Ok(Action::await_change());
        }
    }

    let certificate = ensure_certificate(client, &ctx.config, &dp, &service_name).await?;
    if certificate.changed() {
        return Ok(Action::await_change());
    }

    let deployment = ensure_deployment(client, &dp, &certificate.get().name_any()).await?;
    if deployment.changed() {
        return Ok(Action::await_change());
    }

    if !deployment_ready(deployment.get()) {
        debug!("Deployment for DataPlane {name} is not ready yet");
        let was_ready = conditions::find(dp.conditions(), CONDITION_PROVISIONED)
            .is_some_and(|c| c.status == "True");
        if was_ready {
            let waiting = provisioned(&dp, false, REASON_PODS_NOT_READY, WAITING_MESSAGE);
            set_provisioned(client, &mut dp, waiting).await?;
        }
        return Ok(Action::await_change());
    }

    let ready = provisioned(&dp, true, REASON_PODS_READY, READY_MESSAGE);
    if set_provisioned(client, &mut dp, ready).await? {
        info!("DataPlane {name} is provisioned");
    }
    Ok(Action::await_change())
}

/// Initialize the DataPlane controller and run it until shutdown
pub async fn run(client: Client, ctx: Arc<Context<KubeClusterClient>>) {
    let dp_api = Api::<DataPlane>::all(client.clone());
    let svc_api = Api::<Service>::all(client.clone());
    let deploy_api = Api::<Deployment>::all(client.clone());
    let secret_api = Api::<Secret>::all(client.clone());

    // everything a DataPlane owns carries this label
    let cfg = watcher::Config::default().labels(&ManagedBy::DataPlane.selector());

    let svc_watcher = watcher(svc_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        // svc has no generation so we hash the spec to check for changes
        .predicate_filter(changed_predicate.combine(spec_predicate_serde));

    let deploy_watcher = watcher(deploy_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate.combine(status_predicate_serde));

    let secret_watcher = metadata_watcher(secret_api, cfg)
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    info!("Starting DataPlane controller");
    Controller::new(dp_api, watcher::Config::default())
        .with_config(controller_config(&ctx.config))
        .shutdown_on_signal()
        .owns_stream(svc_watcher)
        .owns_stream(deploy_watcher)
        .owns_stream(secret_watcher)
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
