use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{app_labels, NAME_PREFIX};
use crate::client::ClusterClient;
use crate::reconcilers::ensure::{ensure_owned, Ensured};
use crate::reconcilers::{owned_object_meta, ManagedBy};
use crate::resources::dataplanes::{
    DataPlane, DATAPLANE_ADMIN_PORT, DATAPLANE_PROXY_PORT, DATAPLANE_PROXY_SSL_PORT,
};
use crate::Result;

fn port(name: &str, port: i32, target: i32) -> ServicePort {
    ServicePort {
        name: Some(name.into()),
        port,
        target_port: Some(IntOrString::Int(target)),
        protocol: Some("TCP".into()),
        ..Default::default()
    }
}

pub fn generate_service(dataplane: &DataPlane) -> Result<Service> {
    Ok(Service {
        metadata: owned_object_meta::<Service, _>(dataplane, ManagedBy::DataPlane, NAME_PREFIX)?,
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".into()),
            selector: Some(app_labels(dataplane)),
            ports: Some(vec![
                port("http", 80, DATAPLANE_PROXY_PORT),
                port("https", 443, DATAPLANE_PROXY_SSL_PORT),
                port("admin", DATAPLANE_ADMIN_PORT, DATAPLANE_ADMIN_PORT),
            ]),
            ..Default::default()
        }),
        status: None,
    })
}

pub async fn ensure_service<C: ClusterClient>(client: &C, dataplane: &DataPlane) -> Result<Ensured<Service>> {
    ensure_owned(client, dataplane, ManagedBy::DataPlane, generate_service(dataplane)?).await
}
