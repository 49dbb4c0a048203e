//! Convergence of a parent's owned children.
//!
//! Children are found by the managed-by label and then by ownerReference uid.
//! More than one child of a kind is resolved by deleting all of them and
//! creating a fresh one; a single child is updated in place when the
//! generated object differs in a meaningful field.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount, ServicePort};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::{Resource, ResourceExt};
use tracing::*;

use super::{is_owned_by, merge_object_meta, ManagedBy};
use crate::client::{ClusterClient, ClusterResource};
use crate::resources::controlplanes::ControlPlane;
use crate::resources::dataplanes::DataPlane;
use crate::{Error, Result};

/// Outcome of ensuring a child
#[derive(Debug)]
pub enum Ensured<K> {
    Created(K),
    Updated(K),
    Unchanged(K),
}

impl<K> Ensured<K> {
    /// Whether a write happened; the caller should end its pass
    pub fn changed(&self) -> bool {
        !matches!(self, Ensured::Unchanged(_))
    }

    pub fn get(&self) -> &K {
        match self {
            Ensured::Created(k) | Ensured::Updated(k) | Ensured::Unchanged(k) => k,
        }
    }

    pub fn into_inner(self) -> K {
        match self {
            Ensured::Created(k) | Ensured::Updated(k) | Ensured::Unchanged(k) => k,
        }
    }
}

/// A kind that can be owned and converged by [`ensure_owned_with`]
pub trait OwnedResource: ClusterResource {
    /// True if `existing` differs from `generated` in a field the API server won't update
    fn requires_recreate(_existing: &Self, _generated: &Self) -> bool {
        false
    }
}

/// An owned kind whose meaningful fields are always enforced, see [`ensure_owned`]
pub trait MergeSpec: OwnedResource {
    /// Copy the meaningful fields of `generated` onto `existing`, returning true if it changed
    fn merge_spec(existing: &mut Self, generated: &Self) -> bool;
}

/// Children of kind `K` carrying the `managed_by` label and an ownerReference to `owner`
pub async fn list_owned<C, K, P>(client: &C, owner: &P, managed_by: ManagedBy) -> Result<Vec<K>>
where
    C: ClusterClient,
    K: ClusterResource,
    P: Resource<DynamicType = ()>,
{
    let uid = owner.uid().ok_or(Error::MissingObjectKey("metadata.uid"))?;
    let namespace = if K::NAMESPACED { owner.namespace() } else { None };
    let children: Vec<K> = client
        .list(namespace.as_deref(), &managed_by.selector())
        .await?;
    Ok(children
        .into_iter()
        .filter(|child| is_owned_by(child.meta(), &uid))
        .collect())
}

pub async fn ensure_owned<C, K, P>(
    client: &C,
    owner: &P,
    managed_by: ManagedBy,
    generated: K,
) -> Result<Ensured<K>>
where
    C: ClusterClient,
    K: MergeSpec,
    P: Resource<DynamicType = ()> + Sync,
{
    ensure_owned_with(client, owner, managed_by, generated, K::merge_spec).await
}

/// Like [`ensure_owned`] but with a caller supplied spec merge
pub async fn ensure_owned_with<C, K, P, F>(
    client: &C,
    owner: &P,
    managed_by: ManagedBy,
    generated: K,
    merge_spec: F,
) -> Result<Ensured<K>>
where
    C: ClusterClient,
    K: OwnedResource,
    P: Resource<DynamicType = ()> + Sync,
    F: FnOnce(&mut K, &K) -> bool + Send,
{
    let kind = K::kind(&());
    let mut children: Vec<K> = list_owned(client, owner, managed_by).await?;

    if children.len() > 1 {
        warn!(
            "Found {} {kind} objects owned by {} {}, recreating",
            children.len(),
            P::kind(&()),
            owner.name_any()
        );
        for child in children.drain(..) {
            client.delete(&child).await?;
        }
    }

    let Some(mut existing) = children.pop() else {
        let created = client.create(&generated).await?;
        info!(
            "Created {kind} {} for {} {}",
            created.name_any(),
            P::kind(&()),
            owner.name_any()
        );
        return Ok(Ensured::Created(created));
    };

    if K::requires_recreate(&existing, &generated) {
        info!("{kind} {} needs to be recreated", existing.name_any());
        client.delete(&existing).await?;
        return Ok(Ensured::Created(client.create(&generated).await?));
    }

    let meta_changed = merge_object_meta(existing.meta_mut(), generated.meta());
    let spec_changed = merge_spec(&mut existing, &generated);
    if !(meta_changed || spec_changed) {
        return Ok(Ensured::Unchanged(existing));
    }

    debug!(
        "Updating {kind} {} (metadata changed: {meta_changed}, spec changed: {spec_changed})",
        existing.name_any()
    );
    Ok(Ensured::Updated(client.replace(&existing).await?))
}

fn replace_if_different<T: PartialEq + Clone>(existing: &mut T, generated: &T) -> bool {
    if existing != generated {
        *existing = generated.clone();
        true
    } else {
        false
    }
}

impl OwnedResource for Deployment {
    fn requires_recreate(existing: &Self, generated: &Self) -> bool {
        let selector = |d: &Deployment| d.spec.as_ref().map(|s| s.selector.clone());
        selector(existing) != selector(generated)
    }
}

impl MergeSpec for Deployment {
    fn merge_spec(existing: &mut Self, generated: &Self) -> bool {
        let (Some(existing), Some(generated)) = (existing.spec.as_mut(), generated.spec.as_ref())
        else {
            return false;
        };
        let mut changed = false;

        match generated.replicas {
            Some(replicas) if existing.replicas != Some(replicas) => {
                existing.replicas = Some(replicas);
                changed = true;
            }
            // unset replicas restore the default count, but only undo an explicit scale to zero
            None if existing.replicas == Some(0) => {
                existing.replicas = None;
                changed = true;
            }
            _ => {}
        }

        let (Some(pod), Some(desired_pod)) = (
            existing.template.spec.as_mut(),
            generated.template.spec.as_ref(),
        ) else {
            return changed;
        };

        changed |= replace_if_different(
            &mut pod.service_account_name,
            &desired_pod.service_account_name,
        );

        let volumes_match = desired_pod.volumes.iter().flatten().all(|desired| {
            pod.volumes.iter().flatten().any(|v| {
                v.name == desired.name
                    && v.secret.as_ref().map(|s| &s.secret_name)
                        == desired.secret.as_ref().map(|s| &s.secret_name)
            })
        });
        if !volumes_match {
            pod.volumes = desired_pod.volumes.clone();
            changed = true;
        }

        for desired in &desired_pod.containers {
            match pod.containers.iter_mut().find(|c| c.name == desired.name) {
                Some(container) => {
                    changed |= replace_if_different(&mut container.image, &desired.image);
                    changed |= replace_if_different(&mut container.env, &desired.env);
                    changed |= replace_if_different(&mut container.env_from, &desired.env_from);
                    changed |=
                        replace_if_different(&mut container.volume_mounts, &desired.volume_mounts);
                }
                None => {
                    pod.containers = desired_pod.containers.clone();
                    return true;
                }
            }
        }
        changed
    }
}

fn comparable_ports(ports: &Option<Vec<ServicePort>>) -> Vec<(Option<String>, i32, Option<String>, Option<String>)> {
    ports
        .iter()
        .flatten()
        .map(|p| {
            (
                p.name.clone(),
                p.port,
                p.target_port.as_ref().map(|t| format!("{t:?}")),
                p.protocol.clone(),
            )
        })
        .collect()
}

impl OwnedResource for Service {}

impl MergeSpec for Service {
    fn merge_spec(existing: &mut Self, generated: &Self) -> bool {
        let (Some(existing), Some(generated)) = (existing.spec.as_mut(), generated.spec.as_ref())
        else {
            return false;
        };
        let mut changed = replace_if_different(&mut existing.selector, &generated.selector);
        changed |= replace_if_different(&mut existing.type_, &generated.type_);
        if comparable_ports(&existing.ports) != comparable_ports(&generated.ports) {
            existing.ports = generated.ports.clone();
            changed = true;
        }
        changed
    }
}

impl OwnedResource for ServiceAccount {}

impl MergeSpec for ServiceAccount {
    fn merge_spec(_existing: &mut Self, _generated: &Self) -> bool {
        false
    }
}

impl OwnedResource for Secret {
    fn requires_recreate(existing: &Self, generated: &Self) -> bool {
        // the type of a secret is immutable
        existing.type_ != generated.type_
    }
}

impl MergeSpec for Secret {
    fn merge_spec(existing: &mut Self, generated: &Self) -> bool {
        let mut changed = replace_if_different(&mut existing.type_, &generated.type_);
        changed |= replace_if_different(&mut existing.data, &generated.data);
        changed
    }
}

impl OwnedResource for ClusterRole {}

impl MergeSpec for ClusterRole {
    fn merge_spec(existing: &mut Self, generated: &Self) -> bool {
        replace_if_different(&mut existing.rules, &generated.rules)
    }
}

impl OwnedResource for ClusterRoleBinding {
    fn requires_recreate(existing: &Self, generated: &Self) -> bool {
        existing.role_ref != generated.role_ref
    }
}

impl MergeSpec for ClusterRoleBinding {
    fn merge_spec(existing: &mut Self, generated: &Self) -> bool {
        replace_if_different(&mut existing.subjects, &generated.subjects)
    }
}

// which DataPlane and ControlPlane fields are enforced depends on the GatewayConfiguration
impl OwnedResource for DataPlane {}

impl OwnedResource for ControlPlane {}
