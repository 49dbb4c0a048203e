use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Certificate Error: {0}")]
    CertificateError(#[from] rcgen::Error),

    #[error("Object is missing {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid GatewayClass parametersRef: {0}")]
    InvalidGatewayConfigurationRef(String),

    #[error("found {count} services for DataPlane {dataplane}, expected exactly 1")]
    ServiceCardinality { dataplane: String, count: usize },

    #[error("Unsupported ControlPlane image {0}")]
    UnsupportedImage(String),

    #[error("Invalid cluster CA secret: {0}")]
    CaSecret(String),

    #[error("Reconcile did not finish within {0:?}")]
    Timeout(Duration),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::CertificateError(_) => "CertificateError",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::InvalidGatewayConfigurationRef(_) => "InvalidGatewayConfigurationRef",
            Error::ServiceCardinality { .. } => "ServiceCardinality",
            Error::UnsupportedImage(_) => "UnsupportedImage",
            Error::CaSecret(_) => "CaSecret",
            Error::Timeout(_) => "Timeout",
        }
    }

    /// An optimistic concurrency failure: the object changed since it was read
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 409)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 404)
    }
}

/// CA and webhook certificate bootstrap
pub mod bootstrap;

/// Access to cluster state
pub mod client;

/// Operator configuration
pub mod config;

pub mod controllers;
pub use controllers::{run, State};

/// Lease based leader election
pub mod leader;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// Shared reconciliation building blocks
pub mod reconcilers;

/// CRDs
pub mod resources;
