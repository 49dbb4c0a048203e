use std::time::Duration;

/// Controller name used when none is configured
pub const DEFAULT_CONTROLLER_NAME: &str = "gateway-operator.dev/gateway-operator";

/// Name reported on events and used as the field manager
pub const OPERATOR_NAME: &str = "gateway-operator";

/// Settings fixed at startup and shared read-only by every controller
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Matched against `GatewayClass.spec.controllerName`
    pub controller_name: String,
    /// Secret holding the CA that signs DataPlane certificates
    pub cluster_ca_secret: String,
    pub cluster_ca_secret_namespace: String,
    /// Per-kind limit of concurrently reconciled objects
    pub max_concurrent_reconciles: u16,
    /// Deadline for a single reconcile pass
    pub reconcile_timeout: Duration,
    pub gateway_controller_enabled: bool,
    pub dataplane_controller_enabled: bool,
    pub controlplane_controller_enabled: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            controller_name: DEFAULT_CONTROLLER_NAME.into(),
            cluster_ca_secret: "gateway-operator-ca".into(),
            cluster_ca_secret_namespace: "gateway-operator-system".into(),
            max_concurrent_reconciles: 4,
            reconcile_timeout: Duration::from_secs(30),
            gateway_controller_enabled: true,
            dataplane_controller_enabled: true,
            controlplane_controller_enabled: true,
        }
    }
}

/// Parse a duration such as `30s`, `2m` or a bare number of seconds
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (number, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration {value:?}"))?;
    let seconds = |factor: u64| {
        number
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration {value:?} is too large"))
    };
    match unit {
        "ms" => Ok(Duration::from_millis(number)),
        "s" => Ok(Duration::from_secs(number)),
        "m" => seconds(60),
        "h" => seconds(3600),
        _ => Err(format!("invalid duration unit in {value:?}, expected ms, s, m or h")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("45"), Ok(Duration::from_secs(45)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration(&format!("{}h", u64::MAX / 60)).is_err());
        assert!(parse_duration(&format!("{}m", u64::MAX)).is_err());
        assert_eq!(parse_duration(&format!("{}s", u64::MAX)), Ok(Duration::from_secs(u64::MAX)));
    }
}
