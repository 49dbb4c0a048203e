//! In-memory [`ClusterClient`] used by the reconciler tests.
//!
//! Objects are stored as JSON keyed by kind, namespace and name. The fake
//! assigns uids, resource versions and generations, honours `generateName`,
//! rejects stale writes with a 409 and keeps a count of every write so tests
//! can assert that a converged pass is a no-op.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::events::{Event, EventType};
use kube::ResourceExt;
use serde_json::Value;

use super::{ClusterClient, ClusterResource};
use crate::{Error, Result};

type Key = (String, Option<String>, String);

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub kind: String,
    pub name: String,
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    counter: u64,
    writes: usize,
    events: Vec<RecordedEvent>,
    status_conflicts: usize,
    replace_conflicts: usize,
}

/// Clones share the same objects
#[derive(Clone, Default)]
pub struct FakeCluster {
    inner: Arc<Mutex<Inner>>,
}

pub fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".into(),
        message,
        reason: reason.into(),
        code,
    }))
}

fn key<K: ClusterResource>(namespace: Option<&str>, name: &str) -> Key {
    let namespace = if K::NAMESPACED {
        namespace.map(str::to_owned)
    } else {
        None
    };
    (K::kind(&()).into_owned(), namespace, name.to_owned())
}

fn matches_selector(obj: &Value, selector: &str) -> bool {
    let labels = &obj["metadata"]["labels"];
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels[k].as_str() == Some(v),
            None => !labels[term].is_null(),
        })
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object as-is (apart from server managed fields), without counting a write
    pub fn insert<K: ClusterResource>(&self, obj: K) -> K {
        let mut inner = self.inner.lock().unwrap();
        let mut value = serde_json::to_value(&obj).unwrap();
        let name = obj.meta().name.clone().expect("inserted objects need a name");
        inner.counter += 1;
        let counter = inner.counter;
        let meta = value["metadata"].as_object_mut().unwrap();
        meta.entry("uid").or_insert(Value::String(format!("uid-{counter}")));
        meta.entry("generation").or_insert(Value::from(1));
        meta.insert("resourceVersion".into(), Value::String(counter.to_string()));
        let k = key::<K>(obj.meta().namespace.as_deref(), &name);
        inner.objects.insert(k, value.clone());
        serde_json::from_value(value).unwrap()
    }

    pub fn fetch<K: ClusterResource>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// All objects of a kind in a namespace (every namespace when `None`)
    pub fn all<K: ClusterResource>(&self, namespace: Option<&str>) -> Vec<K> {
        let inner = self.inner.lock().unwrap();
        let kind = K::kind(&());
        inner
            .objects
            .iter()
            .filter(|((k, ns, _), _)| {
                *k == kind && (namespace.is_none() || ns.as_deref() == namespace)
            })
            .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
            .collect()
    }

    /// Mutate a stored object the way another controller would (no write is counted)
    pub fn modify<K: ClusterResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
        f: impl FnOnce(&mut K),
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.counter += 1;
        let counter = inner.counter;
        let value = inner
            .objects
            .get_mut(&key::<K>(namespace, name))
            .expect("object to modify exists");
        let mut obj: K = serde_json::from_value(value.clone()).unwrap();
        f(&mut obj);
        obj.meta_mut().resource_version = Some(counter.to_string());
        *value = serde_json::to_value(&obj).unwrap();
    }

    pub fn writes(&self) -> usize {
        self.inner.lock().unwrap().writes
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.inner.lock().unwrap().events.clone()
    }

    /// Make the next `n` replaces fail with a conflict
    pub fn conflict_on_replaces(&self, n: usize) {
        self.inner.lock().unwrap().replace_conflicts = n;
    }

    /// Make the next `n` status writes fail with a conflict
    pub fn conflict_on_status_writes(&self, n: usize) {
        self.inner.lock().unwrap().status_conflicts = n;
    }
}

fn check_version(stored: &Value, incoming: &Value) -> Result<()> {
    let incoming = &incoming["metadata"]["resourceVersion"];
    if !incoming.is_null() && *incoming != stored["metadata"]["resourceVersion"] {
        return Err(api_error(
            409,
            "Conflict",
            "the object has been modified; please apply your changes to the latest version and try again".into(),
        ));
    }
    Ok(())
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get<K: ClusterResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>> {
        Ok(self.fetch(namespace, name))
    }

    async fn list<K: ClusterResource>(
        &self,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<K>> {
        let inner = self.inner.lock().unwrap();
        let kind = K::kind(&());
        inner
            .objects
            .iter()
            .filter(|((k, ns, _), v)| {
                *k == kind
                    && (namespace.is_none() || ns.as_deref() == namespace)
                    && matches_selector(v, label_selector)
            })
            .map(|(_, v)| Ok(serde_json::from_value(v.clone())?))
            .collect()
    }

    async fn create<K: ClusterResource>(&self, obj: &K) -> Result<K> {
        let mut inner = self.inner.lock().unwrap();
        inner.counter += 1;
        let counter = inner.counter;
        let name = match (&obj.meta().name, &obj.meta().generate_name) {
            (Some(name), _) => name.clone(),
            (None, Some(prefix)) => format!("{prefix}{counter:05x}"),
            (None, None) => return Err(Error::MissingObjectKey("metadata.name")),
        };
        let k = key::<K>(obj.meta().namespace.as_deref(), &name);
        if inner.objects.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists", format!("{name} already exists")));
        }
        let mut created = obj.clone();
        let meta = created.meta_mut();
        meta.name = Some(name);
        meta.uid = Some(format!("uid-{counter}"));
        meta.resource_version = Some(counter.to_string());
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Time(Utc::now()));
        inner.objects.insert(k, serde_json::to_value(&created)?);
        inner.writes += 1;
        Ok(created)
    }

    async fn replace<K: ClusterResource>(&self, obj: &K) -> Result<K> {
        let mut inner = self.inner.lock().unwrap();
        if inner.replace_conflicts > 0 {
            inner.replace_conflicts -= 1;
            return Err(api_error(409, "Conflict", "injected conflict".into()));
        }
        let name = obj.name_any();
        let k = key::<K>(obj.meta().namespace.as_deref(), &name);
        let Some(stored) = inner.objects.get(&k).cloned() else {
            return Err(api_error(404, "NotFound", format!("{name} not found")));
        };
        let mut incoming = serde_json::to_value(obj)?;
        check_version(&stored, &incoming)?;

        inner.counter += 1;
        let counter = inner.counter;
        let generation = stored["metadata"]["generation"].as_i64().unwrap_or(1);
        let spec_changed = stored["spec"] != incoming["spec"];
        incoming["status"] = stored["status"].clone();
        if incoming["status"].is_null() {
            incoming.as_object_mut().unwrap().remove("status");
        }
        let meta = &mut incoming["metadata"];
        meta["uid"] = stored["metadata"]["uid"].clone();
        meta["creationTimestamp"] = stored["metadata"]["creationTimestamp"].clone();
        meta["deletionTimestamp"] = stored["metadata"]["deletionTimestamp"].clone();
        meta["resourceVersion"] = Value::String(counter.to_string());
        meta["generation"] = Value::from(generation + i64::from(spec_changed));
        let finalizers_empty = meta["finalizers"]
            .as_array()
            .map_or(true, |f| f.is_empty());
        let deleting = !meta["deletionTimestamp"].is_null();

        inner.writes += 1;
        let replaced: K = serde_json::from_value(incoming.clone())?;
        if deleting && finalizers_empty {
            inner.objects.remove(&k);
        } else {
            inner.objects.insert(k, incoming);
        }
        Ok(replaced)
    }

    async fn replace_status<K: ClusterResource>(&self, obj: &K) -> Result<K> {
        let mut inner = self.inner.lock().unwrap();
        if inner.status_conflicts > 0 {
            inner.status_conflicts -= 1;
            return Err(api_error(409, "Conflict", "injected conflict".into()));
        }
        let name = obj.name_any();
        let k = key::<K>(obj.meta().namespace.as_deref(), &name);
        let Some(mut stored) = inner.objects.get(&k).cloned() else {
            return Err(api_error(404, "NotFound", format!("{name} not found")));
        };
        let incoming = serde_json::to_value(obj)?;
        check_version(&stored, &incoming)?;

        inner.counter += 1;
        stored["status"] = incoming["status"].clone();
        stored["metadata"]["resourceVersion"] = Value::String(inner.counter.to_string());
        inner.writes += 1;
        let replaced = serde_json::from_value(stored.clone())?;
        inner.objects.insert(k, stored);
        Ok(replaced)
    }

    async fn delete<K: ClusterResource>(&self, obj: &K) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let k = key::<K>(obj.meta().namespace.as_deref(), &obj.name_any());
        let Some(stored) = inner.objects.get_mut(&k) else {
            return Ok(());
        };
        if obj.meta().uid.is_some() && stored["metadata"]["uid"].as_str() != obj.meta().uid.as_deref() {
            return Err(api_error(409, "Conflict", "uid precondition failed".into()));
        }
        let has_finalizers = stored["metadata"]["finalizers"]
            .as_array()
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            stored["metadata"]["deletionTimestamp"] = serde_json::to_value(Time(Utc::now()))?;
        } else {
            inner.objects.remove(&k);
        }
        inner.writes += 1;
        Ok(())
    }

    async fn publish_event<K: ClusterResource>(&self, obj: &K, event: Event) -> Result<()> {
        self.inner.lock().unwrap().events.push(RecordedEvent {
            kind: K::kind(&()).into_owned(),
            name: obj.name_any(),
            warning: matches!(event.type_, EventType::Warning),
            reason: event.reason,
            note: event.note,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn config_map(name: Option<&str>, generate_name: Option<&str>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: name.map(str::to_owned),
                generate_name: generate_name.map(str::to_owned),
                namespace: Some("default".into()),
                labels: Some([("app".to_string(), "demo".to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stale_replace_is_a_conflict() {
        let fake = FakeCluster::new();
        let created = fake.create(&config_map(Some("a"), None)).await.unwrap();
        fake.replace(&created).await.unwrap();
        let err = fake.replace(&created).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(fake.writes(), 2);
    }

    #[tokio::test]
    async fn generate_name_and_selectors() {
        let fake = FakeCluster::new();
        let created = fake.create(&config_map(None, Some("demo-"))).await.unwrap();
        assert!(created.name_any().starts_with("demo-"));
        let found: Vec<ConfigMap> = fake.list(Some("default"), "app=demo").await.unwrap();
        assert_eq!(found.len(), 1);
        let found: Vec<ConfigMap> = fake.list(Some("default"), "app").await.unwrap();
        assert_eq!(found.len(), 1);
        let found: Vec<ConfigMap> = fake.list(Some("default"), "app=other").await.unwrap();
        assert!(found.is_empty());
        let found: Vec<ConfigMap> = fake.list(Some("elsewhere"), "app").await.unwrap();
        assert!(found.is_empty());
    }
}
