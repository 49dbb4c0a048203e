use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{Service, ServiceSpec, ServiceStatus};
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::*;

use crate::client::{ClusterClient, ClusterResource, KubeClusterClient};
use crate::config::{OperatorConfig, OPERATOR_NAME};
use crate::resources::controlplanes::{ControlPlane, ControlPlaneStatus};
use crate::resources::dataplanes::{DataPlane, DataPlaneStatus};
use crate::resources::gateways::Gateway;
use crate::{Error, Metrics, Result};

pub mod controlplane;
pub mod dataplane;
pub mod gateway;

/// Delay before retrying a pass that lost an optimistic concurrency race
pub const REQUEUE_WITHOUT_BACKOFF: Duration = Duration::from_millis(200);

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    /// Whether this instance currently holds the leader lease
    pub leader: bool,
    /// Kinds reconciled by this instance
    pub controllers: Vec<&'static str>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            leader: false,
            controllers: Vec::new(),
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

/// Per-object exponential backoff for failed passes.
///
/// A failing object is retried at least every [`Backoff::MAX`], so entries
/// untouched for longer than [`Backoff::FORGET_AFTER`] belong to objects that
/// are gone and are dropped.
#[derive(Default)]
pub struct Backoff {
    attempts: Mutex<HashMap<String, (u32, Instant)>>,
}

impl Backoff {
    const BASE: Duration = Duration::from_millis(500);
    const MAX: Duration = Duration::from_secs(300);
    const FORGET_AFTER: Duration = Duration::from_secs(600);

    pub fn next(&self, key: &str) -> Duration {
        self.next_at(key, Instant::now())
    }

    fn next_at(&self, key: &str, now: Instant) -> Duration {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.retain(|_, (_, last)| now.saturating_duration_since(*last) < Self::FORGET_AFTER);
        let (attempt, last) = attempts.entry(key.to_owned()).or_insert((0, now));
        let delay = Self::BASE
            .checked_mul(1u32 << (*attempt).min(20))
            .unwrap_or(Self::MAX)
            .min(Self::MAX);
        *attempt = attempt.saturating_add(1);
        *last = now;
        delay
    }

    pub fn reset(&self, key: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// Context shared by the passes of one controller
pub struct Context<C> {
    pub client: C,
    pub config: Arc<OperatorConfig>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    pub backoff: Backoff,
}

impl<C: ClusterClient> Context<C> {
    pub fn new(client: C, config: Arc<OperatorConfig>, metrics: Metrics, state: &State) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            diagnostics: state.diagnostics.clone(),
            metrics,
            backoff: Backoff::default(),
        })
    }
}

pub(crate) fn object_key<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    format!(
        "{}/{}/{}",
        K::kind(&()),
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

/// Run one reconcile pass for `obj` within the configured deadline.
///
/// Conflicts are retried shortly without backoff. Other failures are logged,
/// published as a Warning event on the object and counted, then handed to the
/// error policy.
pub(crate) async fn run_pass<K, C, F>(obj: &K, ctx: &Context<C>, pass: F) -> Result<Action>
where
    K: ClusterResource,
    C: ClusterClient,
    F: Future<Output = Result<Action>>,
{
    let _timer = ctx.metrics.count_and_measure::<K>();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let key = object_key(obj);

    let result = match tokio::time::timeout(ctx.config.reconcile_timeout, pass).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(ctx.config.reconcile_timeout)),
    };
    // a 404 for the object itself means it was deleted during the pass
    let result = match result {
        Err(err) if err.is_not_found() => {
            match ctx.client.get::<K>(obj.namespace().as_deref(), &obj.name_any()).await {
                Ok(None) => {
                    debug!("{key} was deleted while being reconciled");
                    Ok(Action::await_change())
                }
                _ => Err(err),
            }
        }
        result => result,
    };

    match result {
        Ok(action) => {
            ctx.backoff.reset(&key);
            Ok(action)
        }
        Err(err) if err.is_conflict() => {
            debug!("Conflict while reconciling {key}, retrying");
            Ok(Action::requeue(REQUEUE_WITHOUT_BACKOFF))
        }
        Err(err) => {
            warn!("reconcile of {key} failed: {err:?}");
            let event = Event {
                type_: EventType::Warning,
                reason: "FailedReconcile".into(),
                note: Some(err.to_string()),
                action: "Reconcile".into(),
                secondary: None,
            };
            if let Err(e) = ctx.client.publish_event(obj, event).await {
                debug!("Failed to publish event for {key}: {e}");
            }
            ctx.metrics.reconcile_failure(obj, &err);
            Err(err)
        }
    }
}

pub(crate) fn error_policy<K, C>(obj: Arc<K>, _error: &Error, ctx: Arc<Context<C>>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    Action::requeue(ctx.backoff.next(&object_key(obj.as_ref())))
}

pub(crate) fn controller_config(config: &OperatorConfig) -> kube::runtime::controller::Config {
    kube::runtime::controller::Config::default().concurrency(config.max_concurrent_reconciles)
}

async fn ensure_queryable<K>(client: &Client)
where
    K: Resource<DynamicType = ()> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let api = Api::<K>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("{} is not queryable; {e:?}. Is the CRD installed?", K::kind(&()));
        std::process::exit(1);
    }
}

/// Run every enabled controller until shutdown
pub async fn run(client: Client, state: State, config: OperatorConfig) {
    let metrics = match Metrics::new().and_then(|m| m.register(&state.registry)) {
        Ok(metrics) => metrics,
        Err(e) => {
            error!("Could not register metrics: {e}");
            std::process::exit(1);
        }
    };
    let config = Arc::new(config);
    let cluster = KubeClusterClient::new(client.clone(), OPERATOR_NAME);

    let mut enabled = Vec::new();
    if config.gateway_controller_enabled {
        ensure_queryable::<Gateway>(&client).await;
        enabled.push("Gateway");
    }
    if config.dataplane_controller_enabled {
        ensure_queryable::<DataPlane>(&client).await;
        enabled.push("DataPlane");
    }
    if config.controlplane_controller_enabled {
        ensure_queryable::<ControlPlane>(&client).await;
        enabled.push("ControlPlane");
    }
    state.diagnostics.write().await.controllers = enabled;

    let gateways = async {
        if config.gateway_controller_enabled {
            let ctx = Context::new(cluster.clone(), config.clone(), metrics.clone(), &state);
            gateway::run(client.clone(), ctx).await;
        }
    };
    let dataplanes = async {
        if config.dataplane_controller_enabled {
            let ctx = Context::new(cluster.clone(), config.clone(), metrics.clone(), &state);
            dataplane::run(client.clone(), ctx).await;
        }
    };
    let controlplanes = async {
        if config.controlplane_controller_enabled {
            let ctx = Context::new(cluster.clone(), config.clone(), metrics.clone(), &state);
            controlplane::run(client.clone(), ctx).await;
        }
    };

    info!("Starting controllers");
    tokio::join!(gateways, dataplanes, controlplanes);
}

// deletion apparently doesn't lead to any change in metadata otherwise, which means the changed_predicate
// would drop them.
pub(crate) fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<kube::runtime::watcher::Event<K>, E>,
) -> Result<kube::runtime::watcher::Event<K>, E> {
    if let Ok(kube::runtime::watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

pub(crate) fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        // covers spec but not metadata or status
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    obj.meta()
        .owner_references
        .iter()
        .flatten()
        .for_each(|o| o.uid.hash(&mut hasher));
    // ignore status
    Some(hasher.finish())
}

pub(crate) trait MyHasStatus {
    type Status;

    fn status(&self) -> Option<&Self::Status>;
}

impl MyHasStatus for Deployment {
    type Status = DeploymentStatus;

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

impl MyHasStatus for Service {
    type Status = ServiceStatus;

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

impl MyHasStatus for DataPlane {
    type Status = DataPlaneStatus;

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

impl MyHasStatus for ControlPlane {
    type Status = ControlPlaneStatus;

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

pub(crate) fn status_predicate_serde<K: Resource + MyHasStatus>(obj: &K) -> Option<u64>
where
    K::Status: Serialize,
{
    let mut hasher = DefaultHasher::new();
    if let Some(s) = obj.status() {
        match serde_hashkey::to_key(s) {
            Ok(key) => key.hash(&mut hasher),
            // an unhashable status always counts as a change
            Err(_) => return None,
        }
    }
    Some(hasher.finish())
}

pub(crate) trait MyHasSpec {
    type Spec;

    fn spec(&self) -> &Self::Spec;
}

impl MyHasSpec for Service {
    type Spec = Option<ServiceSpec>;

    fn spec(&self) -> &Self::Spec {
        &self.spec
    }
}

pub(crate) fn spec_predicate_serde<K: Resource + MyHasSpec>(obj: &K) -> Option<u64>
where
    K::Spec: Serialize,
{
    let mut hasher = DefaultHasher::new();
    match serde_hashkey::to_key(obj.spec()) {
        Ok(key) => key.hash(&mut hasher),
        Err(_) => return None,
    }
    Some(hasher.finish())
}
