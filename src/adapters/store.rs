//! Kubernetes object access
//!
//! Movers and volume handlers never talk to `kube::Api` directly. They go
//! through [`ResourceClient`], a typed facade over the object-safe
//! [`ObjectStore`] port. Production wires in [`KubeObjectStore`]; tests use
//! the in-memory store.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams,
    PostParams,
};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "volsync-operator";

/// Lines of pod log fetched for mover status reporting
pub const LOG_TAIL_LINES: i64 = 100;

/// Object-safe access to namespaced (or cluster-scoped, with an empty namespace) objects
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object, `None` if it does not exist
    async fn get(&self, resource: &ApiResource, namespace: &str, name: &str)
        -> Result<Option<DynamicObject>>;

    /// List objects carrying every one of `labels`
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>>;

    /// Create a new object
    async fn create(&self, resource: &ApiResource, namespace: &str, obj: &DynamicObject)
        -> Result<DynamicObject>;

    /// Replace an existing object (status is left untouched)
    async fn replace(&self, resource: &ApiResource, namespace: &str, obj: &DynamicObject)
        -> Result<DynamicObject>;

    /// Delete with background propagation; `false` when nothing existed
    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<bool>;

    /// Apply the status subresource
    async fn apply_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        status: Value,
    ) -> Result<()>;

    /// Tail of a pod's log
    async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<String>;
}

/// Bounds for objects handled through [`ResourceClient`]
pub trait KubeObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> KubeObject for K where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Typed facade over an [`ObjectStore`]
#[derive(Clone)]
pub struct ResourceClient {
    store: Arc<dyn ObjectStore>,
}

impl ResourceClient {
    /// Wrap a store
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Client backed by the Kubernetes API server
    pub fn from_kube(client: Client) -> Self {
        Self::new(Arc::new(KubeObjectStore::new(client)))
    }

    pub async fn get<K: KubeObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let ar = ApiResource::erase::<K>(&());
        self.store
            .get(&ar, namespace, name)
            .await?
            .map(from_dynamic)
            .transpose()
    }

    /// Fetch an object that must exist
    pub async fn get_required<K: KubeObject>(&self, namespace: &str, name: &str) -> Result<K> {
        self.get(namespace, name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} {}/{}", K::kind(&()), namespace, name)))
    }

    pub async fn list<K: KubeObject>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let ar = ApiResource::erase::<K>(&());
        self.store
            .list(&ar, namespace, labels)
            .await?
            .into_iter()
            .map(from_dynamic)
            .collect()
    }

    pub async fn create<K: KubeObject>(&self, obj: &K) -> Result<K> {
        let ar = ApiResource::erase::<K>(&());
        let namespace = obj.namespace().unwrap_or_default();
        let created = self.store.create(&ar, &namespace, &to_dynamic(obj)?).await?;
        from_dynamic(created)
    }

    pub async fn replace<K: KubeObject>(&self, obj: &K) -> Result<K> {
        let ar = ApiResource::erase::<K>(&());
        let namespace = obj.namespace().unwrap_or_default();
        let replaced = self.store.replace(&ar, &namespace, &to_dynamic(obj)?).await?;
        from_dynamic(replaced)
    }

    pub async fn delete<K: KubeObject>(&self, namespace: &str, name: &str) -> Result<bool> {
        let ar = ApiResource::erase::<K>(&());
        self.store.delete(&ar, namespace, name).await
    }

    /// Write the `status` of `obj` to its status subresource
    pub async fn apply_status<K: KubeObject>(&self, obj: &K) -> Result<()> {
        let ar = ApiResource::erase::<K>(&());
        let namespace = obj.namespace().unwrap_or_default();
        let status = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .unwrap_or_else(|| json!({}));
        self.store
            .apply_status(&ar, &namespace, &obj.name_any(), status)
            .await
    }

    pub async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<String> {
        self.store.pod_logs(namespace, pod).await
    }
}

fn to_dynamic<K: KubeObject>(obj: &K) -> Result<DynamicObject> {
    let mut value = serde_json::to_value(obj)?;
    // Typed objects built in code may not carry their TypeMeta yet
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".into(), Value::String(K::api_version(&()).into_owned()));
        map.insert("kind".into(), Value::String(K::kind(&()).into_owned()));
    }
    Ok(serde_json::from_value(value)?)
}

fn from_dynamic<K: KubeObject>(obj: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Render a label map as a Kubernetes label selector
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// [`ObjectStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, resource)
        }
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(resource, namespace).get_opt(name).await?)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(self.api(resource, namespace).list(&params).await?.items)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        Ok(self
            .api(resource, namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        Ok(self
            .api(resource, namespace)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<bool> {
        match self
            .api(resource, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    async fn apply_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        status: Value,
    ) -> Result<()> {
        let patch = json!({
            "apiVersion": resource.api_version,
            "kind": resource.kind,
            "status": status,
        });
        self.api(resource, namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await?;
        Ok(())
    }

    async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            tail_lines: Some(LOG_TAIL_LINES),
            ..Default::default()
        };
        Ok(pods.logs(pod, &params).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector_is_sorted_and_comma_joined() {
        let labels = BTreeMap::from([
            ("volsync.backube/cleanup".to_string(), "uid-1".to_string()),
            ("app.kubernetes.io/managed-by".to_string(), "volsync".to_string()),
        ]);
        assert_eq!(
            label_selector(&labels),
            "app.kubernetes.io/managed-by=volsync,volsync.backube/cleanup=uid-1"
        );
    }

    #[test]
    fn test_to_dynamic_fills_type_meta() {
        let pvc = k8s_openapi::api::core::v1::PersistentVolumeClaim {
            metadata: kube::api::ObjectMeta {
                name: Some("data".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let obj = to_dynamic(&pvc).unwrap();
        let types = obj.types.unwrap();
        assert_eq!(types.kind, "PersistentVolumeClaim");
        assert_eq!(types.api_version, "v1");
    }
}
