use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use kube::ResourceExt;

use super::NAME_PREFIX;
use crate::client::ClusterClient;
use crate::reconcilers::ensure::{ensure_owned, list_owned, Ensured};
use crate::reconcilers::{owned_object_meta, ManagedBy};
use crate::resources::controlplanes::{ControlPlane, DEFAULT_CONTROLPLANE_IMAGE};
use crate::{Error, Result};

/// Controller versions, by image tag, the generated RBAC understands
#[derive(Debug, PartialEq)]
enum ImageVersion {
    /// major and minor of a semver-ish tag
    Release(u64, u64),
    /// `latest`, digests and anything else without a version
    Unknown,
}

fn image_version(image: &str) -> ImageVersion {
    let name = image.rsplit('/').next().unwrap_or(image);
    if name.contains('@') {
        return ImageVersion::Unknown;
    }
    let Some((_, tag)) = name.rsplit_once(':') else {
        return ImageVersion::Unknown;
    };
    let mut parts = tag.trim_start_matches('v').split('.');
    let major = parts.next().and_then(|m| m.parse().ok());
    let minor = parts.next().map(|m| {
        m.chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .parse()
            .unwrap_or(0)
    });
    match major {
        Some(major) => ImageVersion::Release(major, minor.unwrap_or(0)),
        None => ImageVersion::Unknown,
    }
}

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(owned(groups)),
        resources: Some(owned(resources)),
        verbs: owned(verbs),
        ..Default::default()
    }
}

const READ: &[&str] = &["get", "list", "watch"];

/// RBAC rules for the controller running `image`
pub fn cluster_role_rules(image: &str) -> Result<Vec<PolicyRule>> {
    let version = image_version(image);
    if let ImageVersion::Release(major, _) = version {
        if major < 2 {
            return Err(Error::UnsupportedImage(image.to_owned()));
        }
    }

    let mut rules = vec![
        rule(&[""], &["endpoints", "nodes", "pods", "secrets", "services", "namespaces", "configmaps"], READ),
        rule(&[""], &["events"], &["create", "patch"]),
        rule(&[""], &["services/status"], &["get", "patch", "update"]),
        rule(&["coordination.k8s.io"], &["leases"], &["get", "list", "watch", "create", "update", "patch", "delete"]),
        rule(&["discovery.k8s.io"], &["endpointslices"], READ),
        rule(&["networking.k8s.io"], &["ingresses", "ingressclasses"], READ),
        rule(&["networking.k8s.io"], &["ingresses/status"], &["get", "patch", "update"]),
        rule(&["configuration.konghq.com"], &["*"], READ),
        rule(&["configuration.konghq.com"], &["*/status"], &["get", "patch", "update"]),
        rule(
            &["gateway.networking.k8s.io"],
            &["gatewayclasses", "gateways", "httproutes", "tcproutes", "tlsroutes", "udproutes"],
            READ,
        ),
        rule(
            &["gateway.networking.k8s.io"],
            &["gatewayclasses/status", "gateways/status", "httproutes/status", "tcproutes/status", "tlsroutes/status", "udproutes/status"],
            &["get", "update"],
        ),
    ];

    let reference_grants = match version {
        ImageVersion::Release(major, minor) => (major, minor) >= (2, 4),
        ImageVersion::Unknown => true,
    };
    if reference_grants {
        rules.push(rule(&["gateway.networking.k8s.io"], &["referencegrants"], READ));
    }
    Ok(rules)
}

pub async fn ensure_service_account<C: ClusterClient>(
    client: &C,
    cp: &ControlPlane,
) -> Result<Ensured<ServiceAccount>> {
    let generated = ServiceAccount {
        metadata: owned_object_meta::<ServiceAccount, _>(cp, ManagedBy::ControlPlane, NAME_PREFIX)?,
        ..Default::default()
    };
    ensure_owned(client, cp, ManagedBy::ControlPlane, generated).await
}

pub async fn ensure_cluster_role<C: ClusterClient>(client: &C, cp: &ControlPlane) -> Result<Ensured<ClusterRole>> {
    let image = cp
        .spec
        .deployment
        .container_image
        .as_deref()
        .unwrap_or(DEFAULT_CONTROLPLANE_IMAGE);
    let generated = ClusterRole {
        metadata: owned_object_meta::<ClusterRole, _>(cp, ManagedBy::ControlPlane, NAME_PREFIX)?,
        rules: Some(cluster_role_rules(image)?),
        aggregation_rule: None,
    };
    ensure_owned(client, cp, ManagedBy::ControlPlane, generated).await
}

pub async fn ensure_cluster_role_binding<C: ClusterClient>(
    client: &C,
    cp: &ControlPlane,
    service_account: &ServiceAccount,
    cluster_role: &ClusterRole,
) -> Result<Ensured<ClusterRoleBinding>> {
    let generated = ClusterRoleBinding {
        metadata: owned_object_meta::<ClusterRoleBinding, _>(cp, ManagedBy::ControlPlane, NAME_PREFIX)?,
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "ClusterRole".into(),
            name: cluster_role.name_any(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".into(),
            name: service_account.name_any(),
            namespace: service_account.namespace(),
            api_group: None,
        }]),
    };
    ensure_owned(client, cp, ManagedBy::ControlPlane, generated).await
}

/// Delete the cluster scoped objects owned by `cp`, which garbage collection won't remove
pub async fn delete_cluster_resources<C: ClusterClient>(client: &C, cp: &ControlPlane) -> Result<()> {
    let bindings: Vec<ClusterRoleBinding> = list_owned(client, cp, ManagedBy::ControlPlane).await?;
    for binding in &bindings {
        client.delete(binding).await?;
    }
    let roles: Vec<ClusterRole> = list_owned(client, cp, ManagedBy::ControlPlane).await?;
    for role in &roles {
        client.delete(role).await?;
    }
    Ok(())
}
