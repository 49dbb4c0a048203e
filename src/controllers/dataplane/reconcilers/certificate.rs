use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use tracing::*;

use super::NAME_PREFIX;
use crate::bootstrap::{load_cluster_ca, CA_CERT_KEY, TLS_CERT_KEY, TLS_KEY_KEY, TLS_SECRET_TYPE};
use crate::client::ClusterClient;
use crate::config::OperatorConfig;
use crate::reconcilers::ensure::{ensure_owned, list_owned, Ensured};
use crate::reconcilers::{owned_object_meta, ManagedBy};
use crate::resources::dataplanes::DataPlane;
use crate::Result;

/// Records which DNS name the certificate in a secret was issued for
pub const CERTIFICATE_SUBJECT_ANNOTATION: &str = "gateway-operator.dev/certificate-subject";

fn reusable_data(secret: &Secret, subject: &str) -> Option<BTreeMap<String, ByteString>> {
    if secret.annotations().get(CERTIFICATE_SUBJECT_ANNOTATION).map(String::as_str) != Some(subject) {
        return None;
    }
    let data = secret.data.as_ref()?;
    [TLS_CERT_KEY, TLS_KEY_KEY, CA_CERT_KEY]
        .iter()
        .all(|key| data.get(*key).is_some_and(|v| !v.0.is_empty()))
        .then(|| data.clone())
}

/// Ensure the secret holding the proxy's cluster certificate for `service_name`.
///
/// A complete secret issued for the same name is kept as is; otherwise a new
/// key and certificate are signed by the cluster CA.
pub async fn ensure_certificate<C: ClusterClient>(
    client: &C,
    config: &OperatorConfig,
    dataplane: &DataPlane,
    service_name: &str,
) -> Result<Ensured<Secret>> {
    let namespace = dataplane.namespace().unwrap_or_default();
    let subject = format!("{service_name}.{namespace}.svc");

    let existing: Vec<Secret> = list_owned(client, dataplane, ManagedBy::DataPlane).await?;
    let data = match existing.as_slice() {
        [secret] => reusable_data(secret, &subject),
        _ => None,
    };
    let data = match data {
        Some(data) => data,
        None => {
            debug!("Issuing certificate for {subject}");
            let ca = load_cluster_ca(
                client,
                &config.cluster_ca_secret,
                &config.cluster_ca_secret_namespace,
            )
            .await?;
            let issued = ca.issue_server_certificate(&subject)?;
            BTreeMap::from([
                (TLS_CERT_KEY.to_owned(), ByteString(issued.cert_pem.into_bytes())),
                (TLS_KEY_KEY.to_owned(), ByteString(issued.key_pem.into_bytes())),
                (CA_CERT_KEY.to_owned(), ByteString(ca.cert_pem().as_bytes().to_vec())),
            ])
        }
    };

    let mut metadata = owned_object_meta::<Secret, _>(dataplane, ManagedBy::DataPlane, NAME_PREFIX)?;
    metadata.annotations = Some(BTreeMap::from([(
        CERTIFICATE_SUBJECT_ANNOTATION.to_owned(),
        subject,
    )]));
    let generated = Secret {
        metadata,
        type_: Some(TLS_SECRET_TYPE.into()),
        data: Some(data),
        ..Default::default()
    };
    ensure_owned(client, dataplane, ManagedBy::DataPlane, generated).await
}
