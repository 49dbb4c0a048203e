use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{reflector, watcher, Predicate, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use tracing::*;

use super::reconcilers::class::{configuration_ref, gateway_configuration, supported_class};
use super::reconcilers::controlplane::ensure_controlplane;
use super::reconcilers::dataplane::ensure_dataplane;
use super::reconcilers::status::gateway_addresses;
use crate::client::{ClusterClient, KubeClusterClient};
use crate::controllers::{
    changed_predicate, controller_config, ensure_deletion_change, error_policy, run_pass,
    status_predicate_serde, Context,
};
use crate::reconcilers::conditions::{
    self, CONDITION_PROVISIONED, CONDITION_READY, CONDITION_SCHEDULED, MAX_GATEWAY_CONDITIONS,
    REASON_PENDING, REASON_READY, REASON_SCHEDULED,
};
use crate::reconcilers::ensure::list_owned;
use crate::reconcilers::ManagedBy;
use crate::resources::controlplanes::ControlPlane;
use crate::resources::dataplanes::DataPlane;
use crate::resources::gatewayconfigurations::GatewayConfiguration;
use crate::resources::gateways::{Gateway, GatewayClass};
use crate::{telemetry, Error, Result};

const READY_MESSAGE: &str = "DataPlane and ControlPlane are provisioned";

#[instrument(skip(ctx, gw), fields(trace_id))]
pub async fn reconcile<C: ClusterClient>(gw: Arc<Gateway>, ctx: Arc<Context<C>>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    run_pass(gw.as_ref(), &ctx, reconcile_gateway(&gw, &ctx)).await
}

/// Write the Gateway status after pruning its conditions
async fn write_status<C: ClusterClient>(client: &C, gw: &mut Gateway) -> Result<()> {
    let status = gw.status.get_or_insert_with(Default::default);
    conditions::prune(&mut status.conditions, MAX_GATEWAY_CONDITIONS);
    *gw = client.replace_status(gw).await?;
    Ok(())
}

/// Flip a Ready Gateway back to not ready while one of its children is provisioning.
/// A Gateway that never was Ready is left alone.
async fn mark_pending<C: ClusterClient>(client: &C, gw: &mut Gateway, message: String) -> Result<()> {
    let ready = conditions::find(gw.conditions(), CONDITION_READY).is_some_and(|c| c.status == "True");
    if !ready {
        return Ok(());
    }
    let pending = conditions::new_condition(CONDITION_READY, false, REASON_PENDING, message, gw.metadata.generation);
    let status = gw.status.get_or_insert_with(Default::default);
    conditions::set(&mut status.conditions, pending);
    write_status(client, gw).await
}

async fn reconcile_gateway<C: ClusterClient>(gw: &Gateway, ctx: &Context<C>) -> Result<Action> {
    let client = &ctx.client;
    let controller_name = &ctx.config.controller_name;
    let name = gw.name_any();
    let namespace = gw
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;

    let current: Option<Gateway> = client.get(Some(&namespace), &name).await?;
    let Some(mut gw) = current else {
        debug!("Gateway {namespace}/{name} no longer exists");
        return Ok(Action::await_change());
    };

    let Some(class) = supported_class(client, &gw, controller_name).await? else {
        debug!(
            "Gateway {namespace}/{name} of class \"{}\" is not handled by {controller_name}, ignoring",
            gw.spec.gateway_class_name
        );
        return Ok(Action::await_change());
    };

    if conditions::find(gw.conditions(), CONDITION_SCHEDULED).is_none() {
        info!("Scheduling Gateway {namespace}/{name}");
        let scheduled = conditions::new_condition(
            CONDITION_SCHEDULED,
            true,
            REASON_SCHEDULED,
            format!("this gateway has been picked up by the {controller_name} and will be processed"),
            gw.metadata.generation,
        );
        let status = gw.status.get_or_insert_with(Default::default);
        conditions::set(&mut status.conditions, scheduled);
        write_status(client, &mut gw).await?;
        return Ok(Action::await_change());
    }

    info!("Reconciling Gateway \"{name}\" in {namespace}");
    let config = gateway_configuration(client, &class).await?;

    let dataplane = ensure_dataplane(client, &gw, &config).await?;
    if dataplane.changed() {
        return Ok(Action::await_change());
    }
    let dataplane = dataplane.into_inner();
    let dataplane_name = dataplane.name_any();
    if !conditions::is_true_for(dataplane.conditions(), CONDITION_PROVISIONED, dataplane.metadata.generation) {
        debug!("DataPlane {dataplane_name} is not provisioned yet");
        let message = format!("waiting for DataPlane {dataplane_name} to be provisioned");
        mark_pending(client, &mut gw, message).await?;
        return Ok(Action::await_change());
    }

    let services: Vec<Service> = list_owned(client, &dataplane, ManagedBy::DataPlane).await?;
    let [service] = services.as_slice() else {
        return Err(Error::ServiceCardinality {
            dataplane: dataplane_name,
            count: services.len(),
        });
    };

    let controlplane = ensure_controlplane(
        client,
        &gw,
        &class.name_any(),
        &config,
        &dataplane,
        &service.name_any(),
    )
    .await?;
    if controlplane.changed() {
        return Ok(Action::await_change());
    }
    let controlplane = controlplane.get();
    if !conditions::is_true_for(
        controlplane.conditions(),
        CONDITION_PROVISIONED,
        controlplane.metadata.generation,
    ) {
        let controlplane_name = controlplane.name_any();
        debug!("ControlPlane {controlplane_name} is not provisioned yet");
        let message = format!("waiting for ControlPlane {controlplane_name} to be provisioned");
        mark_pending(client, &mut gw, message).await?;
        return Ok(Action::await_change());
    }

    let addresses = gateway_addresses(service);
    let ready = conditions::new_condition(CONDITION_READY, true, REASON_READY, READY_MESSAGE, gw.metadata.generation);
    let status = gw.status.get_or_insert_with(Default::default);
    let mut changed = conditions::set(&mut status.conditions, ready);
    changed |= conditions::prune(&mut status.conditions, MAX_GATEWAY_CONDITIONS);
    if status.addresses != addresses {
        status.addresses = addresses;
        changed = true;
    }
    if changed {
        write_status(client, &mut gw).await?;
        info!("Gateway {namespace}/{name} is ready");
    }
    Ok(Action::await_change())
}

fn gateways_of_classes(store: &Store<Gateway>, classes: &[String]) -> Vec<ObjectRef<Gateway>> {
    store
        .state()
        .iter()
        .filter(|gw| classes.contains(&gw.spec.gateway_class_name))
        .map(|gw| ObjectRef::from_obj(gw.as_ref()))
        .collect()
}

/// Gateways owning the DataPlane that owns `service`
fn gateways_of_service(service: &Service, dataplanes: &[Arc<DataPlane>]) -> Vec<ObjectRef<Gateway>> {
    let owners: Vec<&str> = service
        .owner_references()
        .iter()
        .filter(|o| o.kind == DataPlane::kind(&()))
        .map(|o| o.uid.as_str())
        .collect();
    dataplanes
        .iter()
        .filter(|dp| dp.namespace() == service.namespace())
        .filter(|dp| dp.uid().is_some_and(|uid| owners.contains(&uid.as_str())))
        .flat_map(|dp| {
            let namespace = dp.namespace().unwrap_or_default();
            dp.owner_references()
                .iter()
                .filter(|o| o.kind == Gateway::kind(&()))
                .map(|o| ObjectRef::new(&o.name).within(&namespace))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Initialize the Gateway controller and run it until shutdown
pub async fn run(client: Client, ctx: Arc<Context<KubeClusterClient>>) {
    let gw_api = Api::<Gateway>::all(client.clone());
    let class_api = Api::<GatewayClass>::all(client.clone());
    let config_api = Api::<GatewayConfiguration>::all(client.clone());
    let dp_api = Api::<DataPlane>::all(client.clone());
    let cp_api = Api::<ControlPlane>::all(client.clone());
    let svc_api = Api::<Service>::all(client.clone());

    let cfg = watcher::Config::default().labels(&ManagedBy::Gateway.selector());

    let (gw_store, gw_writer) = reflector::store();
    let gw_reflector = reflector(gw_writer, watcher(gw_api, watcher::Config::default()))
        .touched_objects()
        .default_backoff();

    let (class_store, class_writer) = reflector::store();
    let class_reflector = reflector(class_writer, watcher(class_api, watcher::Config::default()))
        .touched_objects()
        .default_backoff();

    let config_watcher = watcher(config_api, watcher::Config::default())
        .touched_objects()
        .default_backoff();

    // the Gateway waits on the Provisioned condition of both children
    let (dp_store, dp_writer) = reflector::store();
    let dp_watcher = reflector(dp_writer, watcher(dp_api, cfg.clone()))
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate.combine(status_predicate_serde));
    let cp_watcher = watcher(cp_api, cfg)
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate.combine(status_predicate_serde));

    // load balancer addresses only show up in the Service status
    let svc_watcher = watcher(
        svc_api,
        watcher::Config::default().labels(&ManagedBy::DataPlane.selector()),
    )
    .touched_objects()
    .predicate_filter(status_predicate_serde);

    let class_gateways = gw_store.clone();
    let config_gateways = gw_store.clone();

    info!("Starting Gateway controller");
    Controller::for_stream(gw_reflector, gw_store)
        .with_config(controller_config(&ctx.config))
        .shutdown_on_signal()
        .owns_stream(dp_watcher)
        .owns_stream(cp_watcher)
        .watches_stream(class_reflector, move |class| {
            gateways_of_classes(&class_gateways, &[class.name_any()])
        })
        .watches_stream(config_watcher, move |config| {
            let target = config.namespace().map(|ns| (ns, config.name_any()));
            let classes: Vec<String> = class_store
                .state()
                .iter()
                .filter(|class| configuration_ref(class).ok().flatten() == target)
                .map(|class| class.name_any())
                .collect();
            gateways_of_classes(&config_gateways, &classes)
        })
        .watches_stream(svc_watcher, move |svc| gateways_of_service(&svc, &dp_store.state()))
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, OwnerReference};

    use super::*;
    use crate::client::fake::FakeCluster;
    use crate::controllers::controlplane::env::PUBLISH_SERVICE_ENV;
    use crate::controllers::test_support::{
        assign_cluster_ips, assign_load_balancer_ip, context, mark_deployments_available,
    };
    use crate::controllers::{controlplane, dataplane};
    use crate::resources::gateways::{
        GatewayClassSpec, GatewaySpec, GatewayStatusAddress, Listener, ParametersReference,
    };

    const NS: &str = "infra";

    fn create_class(fake: &FakeCluster, controller_name: &str, parameters_ref: Option<ParametersReference>) {
        fake.insert(GatewayClass::new(
            "kong",
            GatewayClassSpec {
                controller_name: controller_name.into(),
                parameters_ref,
            },
        ));
    }

    fn create_gateway(fake: &FakeCluster) {
        let mut gw = Gateway::new(
            "edge",
            GatewaySpec {
                gateway_class_name: "kong".into(),
                listeners: vec![Listener {
                    name: "http".into(),
                    port: 80,
                    protocol: "HTTP".into(),
                    hostname: None,
                }],
            },
        );
        gw.metadata.namespace = Some(NS.into());
        fake.insert(gw);
    }

    fn current(fake: &FakeCluster) -> Gateway {
        fake.fetch(Some(NS), "edge").unwrap()
    }

    fn condition(fake: &FakeCluster, type_: &str) -> Option<Condition> {
        conditions::find(current(fake).conditions(), type_).cloned()
    }

    async fn pass(ctx: &Context<FakeCluster>) -> Result<Action> {
        let gw = current(&ctx.client);
        reconcile_gateway(&gw, ctx).await
    }

    /// One pass of every child reconciler, then let the workloads come up
    async fn run_children(ctx: &Arc<Context<FakeCluster>>) {
        let fake = &ctx.client;
        for dp in fake.all::<DataPlane>(Some(NS)) {
            dataplane::reconcile(Arc::new(dp), ctx.clone()).await.unwrap();
        }
        for cp in fake.all::<ControlPlane>(Some(NS)) {
            controlplane::reconcile(Arc::new(cp), ctx.clone()).await.unwrap();
        }
        assign_cluster_ips(fake, NS);
        mark_deployments_available(fake, NS);
    }

    async fn converge(ctx: &Arc<Context<FakeCluster>>) {
        for _ in 0..25 {
            pass(ctx).await.unwrap();
            run_children(ctx).await;
        }
        pass(ctx).await.unwrap();
    }

    fn dataplane_service(fake: &FakeCluster) -> Service {
        let mut services: Vec<Service> = fake.all(Some(NS));
        assert_eq!(services.len(), 1);
        services.remove(0)
    }

    fn set_child_provisioned<K>(fake: &FakeCluster, status: bool)
    where
        K: crate::client::ClusterResource,
        K: HasConditions,
    {
        let children: Vec<K> = fake.all(Some(NS));
        assert_eq!(children.len(), 1);
        fake.modify::<K>(Some(NS), &children[0].name_any(), |child| {
            let condition = child
                .conditions_mut()
                .iter_mut()
                .find(|c| c.type_ == CONDITION_PROVISIONED)
                .unwrap();
            condition.status = if status { "True" } else { "False" }.into();
        });
    }

    trait HasConditions {
        fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    }

    impl HasConditions for DataPlane {
        fn conditions_mut(&mut self) -> &mut Vec<Condition> {
            &mut self.status.as_mut().unwrap().conditions
        }
    }

    impl HasConditions for ControlPlane {
        fn conditions_mut(&mut self) -> &mut Vec<Condition> {
            &mut self.status.as_mut().unwrap().conditions
        }
    }

    #[tokio::test]
    async fn fresh_gateway_becomes_ready() {
        let ctx = context().await;
        let fake = &ctx.client;
        create_class(fake, "example/operator", None);
        create_gateway(fake);

        pass(&ctx).await.unwrap();
        let scheduled = condition(fake, CONDITION_SCHEDULED).unwrap();
        assert_eq!(scheduled.status, "True");
        assert_eq!(
            scheduled.message,
            "this gateway has been picked up by the example/operator and will be processed"
        );

        pass(&ctx).await.unwrap();
        let dataplanes: Vec<DataPlane> = fake.all(Some(NS));
        assert_eq!(dataplanes.len(), 1);
        assert!(dataplanes[0].name_any().starts_with("edge-"));

        // nothing to do until the DataPlane is provisioned
        let writes = fake.writes();
        pass(&ctx).await.unwrap();
        assert_eq!(fake.writes(), writes);
        assert!(condition(fake, CONDITION_READY).is_none());
        assert!(fake.all::<ControlPlane>(Some(NS)).is_empty());

        converge(&ctx).await;

        let service = dataplane_service(fake);
        let controlplanes: Vec<ControlPlane> = fake.all(Some(NS));
        assert_eq!(controlplanes.len(), 1);
        let cp = &controlplanes[0];
        assert_eq!(cp.spec.data_plane.as_deref(), Some(dataplanes[0].name_any().as_str()));
        assert_eq!(cp.spec.gateway_class.as_deref(), Some("kong"));
        assert_eq!(
            cp.spec.deployment.env_value(PUBLISH_SERVICE_ENV),
            Some(format!("{NS}/{}", service.name_any()).as_str())
        );
        assert_eq!(fake.all::<Deployment>(Some(NS)).len(), 2);

        let ready = condition(fake, CONDITION_READY).unwrap();
        assert_eq!(ready.status, "True");
        assert_eq!(ready.reason, REASON_READY);
        let cluster_ip = service.spec.unwrap().cluster_ip.unwrap();
        assert_eq!(
            current(fake).status.unwrap().addresses,
            vec![GatewayStatusAddress::ip(cluster_ip)]
        );
        assert_eq!(condition(fake, CONDITION_SCHEDULED).unwrap().status, "True");

        // converged
        let writes = fake.writes();
        pass(&ctx).await.unwrap();
        run_children(&ctx).await;
        pass(&ctx).await.unwrap();
        assert_eq!(fake.writes(), writes);
    }

    #[tokio::test]
    async fn load_balancer_address_is_published() {
        let ctx = context().await;
        let fake = &ctx.client;
        create_class(fake, "example/operator", None);
        create_gateway(fake);
        converge(&ctx).await;
        let before = dataplane_service(fake);
        let cluster_ip = before.spec.as_ref().unwrap().cluster_ip.clone().unwrap();
        assert_eq!(
            current(fake).status.unwrap().addresses,
            vec![GatewayStatusAddress::ip(cluster_ip)]
        );

        assign_load_balancer_ip(fake, NS, &before.name_any(), "203.0.113.7");
        let service = dataplane_service(fake);

        // the assignment is a Service status change which leads back to the Gateway
        assert_ne!(status_predicate_serde(&before), status_predicate_serde(&service));
        let dataplanes: Vec<Arc<DataPlane>> = fake.all::<DataPlane>(Some(NS)).into_iter().map(Arc::new).collect();
        assert_eq!(
            gateways_of_service(&service, &dataplanes),
            vec![ObjectRef::<Gateway>::new("edge").within(NS)]
        );

        pass(&ctx).await.unwrap();
        assert_eq!(
            current(fake).status.unwrap().addresses,
            vec![GatewayStatusAddress::ip("203.0.113.7")]
        );
    }

    #[tokio::test]
    async fn ready_requires_both_children() {
        let ctx = context().await;
        let fake = &ctx.client;
        create_class(fake, "example/operator", None);
        create_gateway(fake);
        converge(&ctx).await;
        assert_eq!(condition(fake, CONDITION_READY).unwrap().status, "True");

        set_child_provisioned::<DataPlane>(fake, false);
        pass(&ctx).await.unwrap();
        let ready = condition(fake, CONDITION_READY).unwrap();
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, REASON_PENDING);

        set_child_provisioned::<DataPlane>(fake, true);
        pass(&ctx).await.unwrap();
        assert_eq!(condition(fake, CONDITION_READY).unwrap().status, "True");

        set_child_provisioned::<ControlPlane>(fake, false);
        pass(&ctx).await.unwrap();
        let ready = condition(fake, CONDITION_READY).unwrap();
        assert_eq!(ready.status, "False");
        assert!(ready.message.contains("ControlPlane"));

        run_children(&ctx).await;
        pass(&ctx).await.unwrap();
        assert_eq!(condition(fake, CONDITION_READY).unwrap().status, "True");
        assert_eq!(current(fake).conditions().len(), 2);
    }

    #[tokio::test]
    async fn gateways_of_other_controllers_are_ignored() {
        let ctx = context().await;
        let fake = &ctx.client;
        create_class(fake, "someone/else", None);
        create_gateway(fake);

        let writes = fake.writes();
        assert_eq!(pass(&ctx).await.unwrap(), Action::await_change());
        assert_eq!(fake.writes(), writes);
        assert!(current(fake).status.is_none());
        assert!(fake.events().is_empty());
    }

    #[tokio::test]
    async fn invalid_parameters_ref_is_reported() {
        let ctx = context().await;
        let fake = &ctx.client;
        let parameters = ParametersReference {
            group: "example.com".into(),
            kind: "Config".into(),
            name: "cfg".into(),
            namespace: Some(NS.into()),
        };
        create_class(fake, "example/operator", Some(parameters));
        create_gateway(fake);
        pass(&ctx).await.unwrap();

        let gw = current(fake);
        let err = reconcile(Arc::new(gw), ctx.clone()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidGatewayConfigurationRef(_)));
        let events = fake.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, "FailedReconcile");
        assert!(fake.all::<DataPlane>(Some(NS)).is_empty());
    }

    #[tokio::test]
    async fn configuration_options_reach_the_dataplane() {
        let ctx = context().await;
        let fake = &ctx.client;
        let mut configuration = GatewayConfiguration::new("cfg", Default::default());
        configuration.metadata.namespace = Some(NS.into());
        configuration.spec.data_plane_deployment_options = Some(crate::resources::DeploymentOptions {
            replicas: Some(3),
            ..Default::default()
        });
        fake.insert(configuration);
        create_class(
            fake,
            "example/operator",
            Some(ParametersReference {
                group: "gateway-operator.dev".into(),
                kind: "GatewayConfiguration".into(),
                name: "cfg".into(),
                namespace: Some(NS.into()),
            }),
        );
        create_gateway(fake);
        pass(&ctx).await.unwrap();
        pass(&ctx).await.unwrap();

        let dataplanes: Vec<DataPlane> = fake.all(Some(NS));
        assert_eq!(dataplanes.len(), 1);
        assert_eq!(dataplanes[0].spec.deployment.replicas, Some(3));
        assert_eq!(dataplanes[0].spec.deployment.env_value("KONG_DATABASE"), Some("off"));
    }

    #[test]
    fn services_of_unknown_dataplanes_map_to_nothing() {
        let mut service = Service::default();
        service.metadata.namespace = Some(NS.into());
        service.metadata.owner_references = Some(vec![OwnerReference {
            kind: "DataPlane".into(),
            name: "edge-00001".into(),
            uid: "uid-dp".into(),
            ..Default::default()
        }]);
        let mut dp = DataPlane::new("edge-00001", Default::default());
        dp.metadata.namespace = Some("elsewhere".into());
        dp.metadata.uid = Some("uid-dp".into());
        dp.metadata.owner_references = Some(vec![OwnerReference {
            kind: "Gateway".into(),
            name: "edge".into(),
            uid: "uid-gw".into(),
            ..Default::default()
        }]);
        assert!(gateways_of_service(&service, &[Arc::new(dp.clone())]).is_empty());

        dp.metadata.namespace = Some(NS.into());
        assert_eq!(
            gateways_of_service(&service, &[Arc::new(dp)]),
            vec![ObjectRef::<Gateway>::new("edge").within(NS)]
        );
    }

    #[tokio::test]
    async fn duplicate_dataplanes_are_replaced() {
        let ctx = context().await;
        let fake = &ctx.client;
        create_class(fake, "example/operator", None);
        create_gateway(fake);
        converge(&ctx).await;

        let original = fake.all::<DataPlane>(Some(NS)).remove(0);
        let mut duplicate = original.clone();
        duplicate.metadata.name = Some("edge-duplicate".into());
        duplicate.metadata.uid = None;
        duplicate.metadata.resource_version = None;
        fake.insert(duplicate);
        assert_eq!(fake.all::<DataPlane>(Some(NS)).len(), 2);

        pass(&ctx).await.unwrap();
        let dataplanes: Vec<DataPlane> = fake.all(Some(NS));
        assert_eq!(dataplanes.len(), 1);
        assert_ne!(dataplanes[0].name_any(), original.name_any());
        assert_ne!(dataplanes[0].name_any(), "edge-duplicate");
        assert!(dataplanes[0].name_any().starts_with("edge-"));
    }

    #[tokio::test]
    async fn extra_dataplane_services_are_an_error() {
        let ctx = context().await;
        let fake = &ctx.client;
        create_class(fake, "example/operator", None);
        create_gateway(fake);
        converge(&ctx).await;

        let mut extra = dataplane_service(fake);
        extra.metadata.name = Some("dataplane-extra".into());
        extra.metadata.uid = None;
        extra.metadata.resource_version = None;
        fake.insert(extra);

        let err = pass(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::ServiceCardinality { count: 2, .. }));
    }
}
