use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::resources::dataplanes::DataPlane;

pub mod certificate;
pub mod deployment;
pub mod service;

/// Prefix of the generated names of every object a DataPlane owns
const NAME_PREFIX: &str = "dataplane";

/// Labels selecting the proxy pods of a DataPlane
fn app_labels(dataplane: &DataPlane) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_owned(), dataplane.name_any())])
}
