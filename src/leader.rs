//! Leader election on a `coordination.k8s.io/v1` Lease.
//!
//! Only the instance holding the lease runs controllers. Standby instances
//! poll the lease until it expires; the leader renews it and terminates the
//! process once it can no longer do so.

use std::future::Future;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::time::{Duration, Instant};
use tracing::*;

use crate::client::ClusterClient;
use crate::{Result, State};

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);

/// What to do with the lease in its current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No lease exists yet
    Create,
    /// We hold the lease
    Renew,
    /// The lease is free or its holder stopped renewing it
    TakeOver,
    /// Someone else holds a live lease
    Standby,
}

fn lease_expiry(spec: &LeaseSpec, default_duration: Duration) -> Option<DateTime<Utc>> {
    let last = spec.renew_time.as_ref().or(spec.acquire_time.as_ref())?;
    let seconds = spec
        .lease_duration_seconds
        .map(i64::from)
        .unwrap_or(default_duration.as_secs() as i64);
    Some(last.0 + ChronoDuration::seconds(seconds))
}

pub fn decide(lease: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>, duration: Duration) -> Decision {
    let Some(spec) = lease else {
        return Decision::Create;
    };
    match spec.holder_identity.as_deref() {
        Some(holder) if holder == identity => Decision::Renew,
        None | Some("") => Decision::TakeOver,
        Some(_) => match lease_expiry(spec, duration) {
            Some(expiry) if now <= expiry => Decision::Standby,
            _ => Decision::TakeOver,
        },
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Renewal {
    Renewed,
    Retry,
    Lost,
}

/// `$POD_NAME` (or the hostname) with a random suffix
pub fn default_identity() -> String {
    let base = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| crate::config::OPERATOR_NAME.to_owned());
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{base}_{suffix}")
}

pub struct LeaderElector<C> {
    client: C,
    name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
}

impl<C: ClusterClient> LeaderElector<C> {
    pub fn new(client: C, name: &str, namespace: &str, identity: String) -> Self {
        Self {
            client,
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            identity,
            lease_duration: DEFAULT_LEASE_DURATION,
        }
    }

    fn retry_period(&self) -> Duration {
        self.lease_duration / 3
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    /// Acquire or renew the lease, `true` if we hold it afterwards.
    ///
    /// Losing a write race to another instance is not an error, it just means
    /// the lease was not won.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let existing: Option<Lease> = self.client.get(Some(&self.namespace), &self.name).await?;
        let decision = decide(
            existing.as_ref().and_then(|l| l.spec.as_ref()),
            &self.identity,
            now,
            self.lease_duration,
        );

        let written = match (decision, existing) {
            (Decision::Standby, _) => return Ok(false),
            (Decision::Create, _) => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.identity.clone()),
                        lease_duration_seconds: Some(self.lease_duration_seconds()),
                        acquire_time: Some(MicroTime(now)),
                        renew_time: Some(MicroTime(now)),
                        lease_transitions: Some(0),
                        ..Default::default()
                    }),
                };
                self.client.create(&lease).await.map(|_| ())
            }
            (decision, Some(mut lease)) => {
                let spec = lease.spec.get_or_insert_with(Default::default);
                if decision == Decision::TakeOver {
                    spec.holder_identity = Some(self.identity.clone());
                    spec.acquire_time = Some(MicroTime(now));
                    spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
                }
                spec.lease_duration_seconds = Some(self.lease_duration_seconds());
                spec.renew_time = Some(MicroTime(now));
                self.client.replace(&lease).await.map(|_| ())
            }
            (_, None) => return Ok(false),
        };

        match written {
            Ok(()) => {
                if decision == Decision::TakeOver {
                    info!("Took over lease {}/{} as {}", self.namespace, self.name, self.identity);
                }
                Ok(true)
            }
            Err(err) if err.is_conflict() => {
                debug!("Lost the race for lease {}/{}", self.namespace, self.name);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn acquire(&self) {
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => return,
                Ok(false) => debug!("Lease {}/{} is held elsewhere, standing by", self.namespace, self.name),
                Err(e) => warn!("Failed to acquire lease {}/{}: {e}", self.namespace, self.name),
            }
            tokio::time::sleep(self.retry_period()).await;
        }
    }

    /// Whether the stored lease still names us as holder
    async fn holds_lease(&self) -> Result<bool> {
        let lease: Option<Lease> = self.client.get(Some(&self.namespace), &self.name).await?;
        Ok(lease
            .and_then(|l| l.spec)
            .is_some_and(|spec| spec.holder_identity.as_deref() == Some(self.identity.as_str())))
    }

    async fn renew(&self) -> Renewal {
        match self.try_acquire_or_renew().await {
            Ok(true) => Renewal::Renewed,
            // a lost write race is only fatal if someone else took the lease
            Ok(false) => match self.holds_lease().await {
                Ok(true) => Renewal::Retry,
                Ok(false) => Renewal::Lost,
                Err(e) => {
                    warn!("Failed to read lease {}/{}: {e}", self.namespace, self.name);
                    Renewal::Retry
                }
            },
            Err(e) => {
                warn!("Failed to renew lease {}/{}: {e}", self.namespace, self.name);
                Renewal::Retry
            }
        }
    }

    /// Renew until the lease is lost or could not be renewed for a whole lease duration
    async fn hold(&self) {
        let mut last_renewal = Instant::now();
        loop {
            tokio::time::sleep(self.retry_period()).await;
            match self.renew().await {
                Renewal::Renewed => last_renewal = Instant::now(),
                Renewal::Lost => return,
                Renewal::Retry if last_renewal.elapsed() >= self.lease_duration => return,
                Renewal::Retry => {}
            }
        }
    }

    /// Wait for leadership, then run `work` for as long as it is held.
    ///
    /// Losing the lease terminates the process.
    pub async fn lead<F: Future<Output = ()>>(self, state: &State, work: F) {
        info!("Waiting for lease {}/{} as {}", self.namespace, self.name, self.identity);
        self.acquire().await;
        info!("Acquired lease {}/{}", self.namespace, self.name);
        state.diagnostics.write().await.leader = true;

        tokio::select! {
            _ = work => {}
            _ = self.hold() => {
                error!("Lost lease {}/{}, exiting", self.namespace, self.name);
                std::process::exit(1);
            }
        }
    }
}
