//! In-process [`ObjectStore`] used by tests and dry runs
//!
//! Mimics the API server behaviour the movers depend on: uid, resourceVersion
//! and creationTimestamp assignment, AlreadyExists/NotFound errors, label
//! selection, and a status subresource that survives `replace`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;
use parking_lot::Mutex;
use serde_json::Value;

use super::store::ObjectStore;
use crate::error::{Error, Result};

#[derive(Default)]
struct State {
    objects: BTreeMap<String, DynamicObject>,
    logs: BTreeMap<String, String>,
    resource_version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// Map-backed object store
#[derive(Default)]
pub struct MemoryObjectStore {
    state: Mutex<State>,
}

fn key(resource: &ApiResource, namespace: &str, name: &str) -> String {
    format!("{}/{}/{}/{}", resource.api_version, resource.kind, namespace, name)
}

fn describe(resource: &ApiResource, namespace: &str, name: &str) -> String {
    format!("{} {}/{}", resource.kind, namespace, name)
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the log returned for a pod
    pub fn set_pod_logs(&self, namespace: &str, pod: &str, logs: impl Into<String>) {
        self.state
            .lock()
            .logs
            .insert(format!("{}/{}", namespace, pod), logs.into());
    }

    /// Number of stored objects of a kind, across namespaces
    pub fn count(&self, kind: &str) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|o| o.types.as_ref().is_some_and(|t| t.kind == kind))
            .count()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self
            .state
            .lock()
            .objects
            .get(&key(resource, namespace, name))
            .cloned())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        let prefix = format!("{}/{}/", resource.api_version, resource.kind);
        let state = self.state.lock();
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, o)| o)
            .filter(|o| namespace.is_empty() || o.namespace().as_deref() == Some(namespace))
            .filter(|o| {
                let have = o.labels();
                labels.iter().all(|(k, v)| have.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = obj.name_any();
        let k = key(resource, namespace, &name);
        let mut state = self.state.lock();
        if state.objects.contains_key(&k) {
            return Err(Error::AlreadyExists(describe(resource, namespace, &name)));
        }

        let mut created = obj.clone();
        if !namespace.is_empty() {
            created.metadata.namespace = Some(namespace.to_string());
        }
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        created.metadata.resource_version = Some(state.next_version());
        state.objects.insert(k, created.clone());
        Ok(created)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = obj.name_any();
        let k = key(resource, namespace, &name);
        let mut state = self.state.lock();
        let existing = state
            .objects
            .get(&k)
            .cloned()
            .ok_or_else(|| Error::NotFound(describe(resource, namespace, &name)))?;

        let mut replaced = obj.clone();
        replaced.metadata.namespace = existing.metadata.namespace.clone();
        replaced.metadata.uid = existing.metadata.uid.clone();
        replaced.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
        replaced.metadata.resource_version = Some(state.next_version());
        if let Some(map) = replaced.data.as_object_mut() {
            match existing.data.get("status") {
                Some(status) => {
                    map.insert("status".into(), status.clone());
                }
                None => {
                    map.remove("status");
                }
            }
        }
        state.objects.insert(k, replaced.clone());
        Ok(replaced)
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .objects
            .remove(&key(resource, namespace, name))
            .is_some())
    }

    async fn apply_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        status: Value,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let version = state.next_version();
        let obj = state
            .objects
            .get_mut(&key(resource, namespace, name))
            .ok_or_else(|| Error::NotFound(describe(resource, namespace, name)))?;
        if let Some(map) = obj.data.as_object_mut() {
            map.insert("status".into(), status);
        } else {
            obj.data = serde_json::json!({ "status": status });
        }
        obj.metadata.resource_version = Some(version);
        Ok(())
    }

    async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<String> {
        Ok(self
            .state
            .lock()
            .logs
            .get(&format!("{}/{}", namespace, pod))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::adapters::ResourceClient;

    fn pvc(name: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns".into()),
                labels: Some(BTreeMap::from([("app".into(), "db".into())])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_assigns_identity_and_rejects_duplicates() {
        let client = ResourceClient::new(Arc::new(MemoryObjectStore::new()));
        let created = client.create(&pvc("data")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.creation_timestamp.is_some());

        let err = client.create(&pvc("data")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_list_filters_by_labels() {
        let client = ResourceClient::new(Arc::new(MemoryObjectStore::new()));
        client.create(&pvc("a")).await.unwrap();
        let mut other = pvc("b");
        other.metadata.labels = None;
        client.create(&other).await.unwrap();

        let selector = BTreeMap::from([("app".to_string(), "db".to_string())]);
        let found: Vec<PersistentVolumeClaim> = client.list("ns", &selector).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name_any(), "a");
    }

    #[tokio::test]
    async fn test_replace_preserves_status() {
        let client = ResourceClient::new(Arc::new(MemoryObjectStore::new()));
        let mut obj = client.create(&pvc("data")).await.unwrap();
        obj.status = Some(k8s_openapi::api::core::v1::PersistentVolumeClaimStatus {
            phase: Some("Bound".into()),
            ..Default::default()
        });
        client.apply_status(&obj).await.unwrap();

        obj.status = None;
        obj.metadata.annotations = Some(BTreeMap::from([("k".into(), "v".into())]));
        let replaced = client.replace(&obj).await.unwrap();
        assert_eq!(replaced.status.unwrap().phase.as_deref(), Some("Bound"));
    }
}
