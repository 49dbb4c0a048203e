use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::client::ClusterResource;
use crate::{Error, Result};

pub mod conditions;
pub mod ensure;

/// Every object created by the operator carries this label; its value names the managing kind
pub const MANAGED_BY_LABEL: &str = "gateway-operator.dev/managed-by";

/// Which kind of parent manages an owned object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagedBy {
    Gateway,
    DataPlane,
    ControlPlane,
}

impl ManagedBy {
    pub fn label_value(self) -> &'static str {
        match self {
            ManagedBy::Gateway => "gateway",
            ManagedBy::DataPlane => "dataplane",
            ManagedBy::ControlPlane => "controlplane",
        }
    }

    pub fn selector(self) -> String {
        format!("{MANAGED_BY_LABEL}={}", self.label_value())
    }

    pub fn labels(self) -> BTreeMap<String, String> {
        BTreeMap::from([(MANAGED_BY_LABEL.to_owned(), self.label_value().to_owned())])
    }
}

/// True if any ownerReference on `meta` points at `uid`
pub fn is_owned_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|owner| owner.uid == uid)
}

/// Metadata for an object of kind `K` owned by `owner`.
///
/// Names are generated by the API server from `<prefix>-<owner name>-`, so a
/// replacement created while the previous object is still terminating never collides.
pub fn owned_object_meta<K, P>(owner: &P, managed_by: ManagedBy, prefix: &str) -> Result<ObjectMeta>
where
    K: ClusterResource,
    P: Resource<DynamicType = ()>,
{
    let owner_reference = owner
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("metadata.uid"))?;
    let generate_name = if prefix.is_empty() {
        format!("{}-", owner.name_any())
    } else {
        format!("{prefix}-{}-", owner.name_any())
    };
    Ok(ObjectMeta {
        generate_name: Some(generate_name),
        namespace: if K::NAMESPACED { owner.namespace() } else { None },
        labels: Some(managed_by.labels()),
        owner_references: Some(vec![owner_reference]),
        ..Default::default()
    })
}

fn merge_map(
    existing: &mut Option<BTreeMap<String, String>>,
    generated: &Option<BTreeMap<String, String>>,
) -> bool {
    let Some(generated) = generated else {
        return false;
    };
    let current = existing.get_or_insert_with(Default::default);
    let mut changed = false;
    for (k, v) in generated {
        if current.get(k) != Some(v) {
            current.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

/// Bring `existing` in line with the generated metadata: owner references are
/// replaced, labels and annotations are merged with the generated values winning.
/// Returns true if anything changed.
pub fn merge_object_meta(existing: &mut ObjectMeta, generated: &ObjectMeta) -> bool {
    let mut changed = false;

    if existing.owner_references != generated.owner_references {
        existing.owner_references = generated.owner_references.clone();
        changed = true;
    }

    changed |= merge_map(&mut existing.labels, &generated.labels);
    changed |= merge_map(&mut existing.annotations, &generated.annotations);
    changed
}

/// A deployment is ready once it reports replicas and all of them are available
pub fn deployment_ready(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let replicas = status.replicas.unwrap_or(0);
    replicas > 0 && status.available_replicas.unwrap_or(0) >= replicas
}


#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::rbac::v1::ClusterRole;

    use super::test_support::owner_ref;
    use super::*;
    use crate::resources::dataplanes::{DataPlane, DataPlaneSpec};

    fn dataplane() -> DataPlane {
        let mut dp = DataPlane::new("edge", DataPlaneSpec::default());
        dp.metadata.namespace = Some("infra".into());
        dp.metadata.uid = Some("dp-uid".into());
        dp
    }

    #[test]
    fn owned_meta_for_namespaced_and_cluster_kinds() {
        let dp = dataplane();
        let meta = owned_object_meta::<Deployment, _>(&dp, ManagedBy::DataPlane, "dataplane").unwrap();
        assert_eq!(meta.generate_name.as_deref(), Some("dataplane-edge-"));
        assert_eq!(meta.namespace.as_deref(), Some("infra"));
        assert!(is_owned_by(&meta, "dp-uid"));
        assert_eq!(
            meta.labels.unwrap().get(MANAGED_BY_LABEL).map(String::as_str),
            Some("dataplane")
        );

        let meta = owned_object_meta::<ClusterRole, _>(&dp, ManagedBy::DataPlane, "dataplane").unwrap();
        assert_eq!(meta.namespace, None);
    }

    #[test]
    fn deployment_readiness() {
        use k8s_openapi::api::apps::v1::DeploymentStatus;

        let with_status = |replicas, available| Deployment {
            status: Some(DeploymentStatus {
                replicas,
                available_replicas: available,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!deployment_ready(&Deployment::default()));
        assert!(!deployment_ready(&with_status(Some(0), Some(0))));
        assert!(!deployment_ready(&with_status(Some(2), Some(1))));
        assert!(deployment_ready(&with_status(Some(2), Some(2))));
    }

    #[test]
    fn owner_without_uid_is_rejected() {
        let mut dp = dataplane();
        dp.metadata.uid = None;
        assert!(owned_object_meta::<Deployment, _>(&dp, ManagedBy::DataPlane, "dataplane").is_err());
    }

    #[test]
    fn merge_meta_unions_labels_and_replaces_owners() {
        let mut existing = ObjectMeta {
            labels: Some(BTreeMap::from([
                ("user".to_string(), "kept".to_string()),
                (MANAGED_BY_LABEL.to_string(), "wrong".to_string()),
            ])),
            owner_references: Some(vec![owner_ref("DataPlane", "old", "old-uid")]),
            ..Default::default()
        };
        let generated = ObjectMeta {
            labels: Some(ManagedBy::DataPlane.labels()),
            owner_references: Some(vec![owner_ref("DataPlane", "edge", "dp-uid")]),
            ..Default::default()
        };

        assert!(merge_object_meta(&mut existing, &generated));
        let labels = existing.labels.clone().unwrap();
        assert_eq!(labels["user"], "kept");
        assert_eq!(labels[MANAGED_BY_LABEL], "dataplane");
        assert!(is_owned_by(&existing, "dp-uid"));
        assert!(!is_owned_by(&existing, "old-uid"));

        assert!(!merge_object_meta(&mut existing, &generated));
    }
}
