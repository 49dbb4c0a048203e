use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use tokio::time::Duration;
use tracing::*;

use crate::client::ClusterClient;
use crate::{Error, Result};

pub const CA_COMMON_NAME: &str = "Gateway Operator CA";
const CA_ORGANIZATION: &str = "Gateway Operator";
const CA_VALIDITY_DAYS: i64 = 10 * 365;
const SERVER_CERT_VALIDITY_DAYS: i64 = 365;

const CA_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";
pub const CA_CERT_KEY: &str = "ca.crt";

fn validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(days))
}

/// A PEM encoded certificate and its private key
#[derive(Clone, Debug, PartialEq)]
pub struct KeyedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// The certificate authority signing DataPlane cluster certificates
#[derive(Clone, Debug)]
pub struct CertificateAuthority(KeyedCertificate);

impl CertificateAuthority {
    /// Generate a new self-signed CA with an ECDSA P-256 key
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(CA_COMMON_NAME.into()));
        dn.push(DnType::OrganizationName, DnValue::Utf8String(CA_ORGANIZATION.into()));
        dn.push(DnType::CountryName, DnValue::Utf8String("US".into()));
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
        ];
        (params.not_before, params.not_after) = validity(CA_VALIDITY_DAYS);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;
        Ok(Self(KeyedCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        }))
    }

    /// Load the CA from a `kubernetes.io/tls` secret
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let field = |key: &str| -> Result<String> {
            let value = secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .ok_or_else(|| Error::CaSecret(format!("missing {key}")))?;
            String::from_utf8(value.0.clone())
                .map_err(|_| Error::CaSecret(format!("{key} is not valid PEM")))
        };
        let key_pem = field(TLS_KEY_KEY)?;
        KeyPair::from_pem(&key_pem).map_err(|e| Error::CaSecret(format!("invalid {TLS_KEY_KEY}: {e}")))?;
        Ok(Self(KeyedCertificate {
            cert_pem: field(TLS_CERT_KEY)?,
            key_pem,
        }))
    }

    pub fn cert_pem(&self) -> &str {
        &self.0.cert_pem
    }

    pub fn to_secret(&self, name: &str, namespace: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            type_: Some(TLS_SECRET_TYPE.into()),
            data: Some(BTreeMap::from([
                (TLS_CERT_KEY.into(), ByteString(self.0.cert_pem.clone().into_bytes())),
                (TLS_KEY_KEY.into(), ByteString(self.0.key_pem.clone().into_bytes())),
            ])),
            ..Default::default()
        }
    }

    /// Issue a server certificate for `dns_name` with a freshly generated key
    pub fn issue_server_certificate(&self, dns_name: &str) -> Result<KeyedCertificate> {
        let mut params = CertificateParams::new(vec![dns_name.to_owned()])?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(dns_name.into()));
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        (params.not_before, params.not_after) = validity(SERVER_CERT_VALIDITY_DAYS);

        let server_key = KeyPair::generate()?;
        let ca_key = KeyPair::from_pem(&self.0.key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&self.0.cert_pem, &ca_key)?;
        let cert = params.signed_by(&server_key, &issuer)?;

        Ok(KeyedCertificate {
            cert_pem: cert.pem(),
            key_pem: server_key.serialize_pem(),
        })
    }
}

/// Make sure the cluster CA secret exists, creating a new CA if it doesn't.
///
/// An existing secret is never modified.
pub async fn ensure_cluster_ca<C: ClusterClient>(client: &C, name: &str, namespace: &str) -> Result<()> {
    if name.is_empty() || namespace.is_empty() {
        return Err(Error::CaSecret(
            "cluster CA secret name and namespace must be set".into(),
        ));
    }

    let existing: Option<Secret> = tokio::time::timeout(CA_LOOKUP_TIMEOUT, client.get(Some(namespace), name))
        .await
        .map_err(|_| Error::Timeout(CA_LOOKUP_TIMEOUT))??;
    if existing.is_some() {
        debug!("Cluster CA secret {namespace}/{name} exists");
        return Ok(());
    }

    let ca = CertificateAuthority::generate()?;
    match client.create(&ca.to_secret(name, namespace)).await {
        Ok(_) => {
            info!("Created cluster CA secret {namespace}/{name}");
            Ok(())
        }
        // another instance got there first
        Err(e) if e.is_conflict() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Load the cluster CA from its secret
pub async fn load_cluster_ca<C: ClusterClient>(
    client: &C,
    name: &str,
    namespace: &str,
) -> Result<CertificateAuthority> {
    let secret: Secret = client
        .get(Some(namespace), name)
        .await?
        .ok_or_else(|| Error::CaSecret(format!("secret {namespace}/{name} not found")))?;
    CertificateAuthority::from_secret(&secret)
}

/// Paths of the admission webhook serving certificates
#[derive(Debug, PartialEq)]
pub struct WebhookCertificates {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Returns the webhook certificates in `dir`, or `None` when any of them is missing
pub fn webhook_certificates(dir: &Path) -> Option<WebhookCertificates> {
    let certs = WebhookCertificates {
        ca_cert: dir.join(CA_CERT_KEY),
        cert: dir.join(TLS_CERT_KEY),
        key: dir.join(TLS_KEY_KEY),
    };
    for path in [&certs.ca_cert, &certs.cert, &certs.key] {
        if !path.is_file() {
            info!(
                "{} not found, admission webhook will not be started",
                path.display()
            );
            return None;
        }
    }
    Some(certs)
}
