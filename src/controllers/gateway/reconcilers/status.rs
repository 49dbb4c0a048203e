use k8s_openapi::api::core::v1::Service;

use crate::resources::gateways::GatewayStatusAddress;

/// Addresses a Gateway is reachable on through its DataPlane Service.
///
/// Load balancer addresses win; the cluster IP is only used without them.
pub fn gateway_addresses(service: &Service) -> Vec<GatewayStatusAddress> {
    let ingress = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref());
    let external: Vec<_> = ingress
        .into_iter()
        .flatten()
        .filter_map(|ingress| match (&ingress.ip, &ingress.hostname) {
            (Some(ip), _) if !ip.is_empty() => Some(GatewayStatusAddress::ip(ip)),
            (_, Some(hostname)) if !hostname.is_empty() => Some(GatewayStatusAddress::hostname(hostname)),
            _ => None,
        })
        .collect();
    if !external.is_empty() {
        return external;
    }

    service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty() && *ip != "None")
        .map(GatewayStatusAddress::ip)
        .into_iter()
        .collect()
}
