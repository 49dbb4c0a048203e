use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::resources::controlplanes::ControlPlane;

pub mod deployment;
pub mod rbac;

/// Generated names of ControlPlane children start with this
pub const NAME_PREFIX: &str = "controlplane";

fn app_labels(cp: &ControlPlane) -> BTreeMap<String, String> {
    [("app".to_string(), cp.name_any())].into()
}
