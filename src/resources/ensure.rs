//! Read, diff, then write
//!
//! `create_or_update` fetches the live object, applies a mutate closure to a
//! copy of it and writes only when something changed. Mutate closures set the
//! fields they own one at a time so that values defaulted by the API server
//! survive and do not show up as differences on every pass.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::Resource;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::adapters::{KubeObject, ResourceClient};
use crate::crd::VolumeSnapshot;
use crate::error::{Error, Result};

/// What `create_or_update` did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Updated,
    Unchanged,
    /// The desired state differs in fields the API server refuses to update
    ImmutableConflict,
}

/// Objects managed through `create_or_update`
pub trait Reconcilable: KubeObject + Default {
    /// Fields that cannot change once the object exists
    fn immutable_fields(&self) -> Value {
        Value::Null
    }
}

impl Reconcilable for Job {
    fn immutable_fields(&self) -> Value {
        json!(self.spec.as_ref().map(|s| &s.template))
    }
}

impl Reconcilable for PersistentVolumeClaim {
    fn immutable_fields(&self) -> Value {
        json!(self.spec.as_ref().map(|s| json!({
            "storageClassName": s.storage_class_name,
            "accessModes": s.access_modes,
            "dataSource": s.data_source,
            "volumeMode": s.volume_mode,
        })))
    }
}

impl Reconcilable for VolumeSnapshot {
    fn immutable_fields(&self) -> Value {
        json!({
            "source": self.spec.source,
            "volumeSnapshotClassName": self.spec.volume_snapshot_class_name,
        })
    }
}

impl Reconcilable for RoleBinding {
    fn immutable_fields(&self) -> Value {
        json!(self.role_ref)
    }
}

impl Reconcilable for Secret {}
impl Reconcilable for Service {}
impl Reconcilable for ServiceAccount {}
impl Reconcilable for Role {}

/// Whether `obj` has not been persisted yet
pub fn is_new<K: Resource>(obj: &K) -> bool {
    obj.meta().creation_timestamp.is_none()
}

/// Create the named object or bring the existing one in line with `mutate`
///
/// An [`EnsureOutcome::ImmutableConflict`] leaves the live object untouched.
pub async fn create_or_update<K, F>(
    client: &ResourceClient,
    namespace: &str,
    name: &str,
    mutate: F,
) -> Result<(K, EnsureOutcome)>
where
    K: Reconcilable,
    F: FnOnce(&mut K) -> Result<()>,
{
    let kind = K::kind(&());
    match client.get::<K>(namespace, name).await? {
        None => {
            let mut obj = K::default();
            obj.meta_mut().name = Some(name.to_string());
            obj.meta_mut().namespace = Some(namespace.to_string());
            mutate(&mut obj)?;
            let created = client.create(&obj).await?;
            info!(kind = %kind, name, namespace, "Created object");
            Ok((created, EnsureOutcome::Created))
        }
        Some(existing) => {
            let mut desired = existing.clone();
            mutate(&mut desired)?;
            if serde_json::to_value(&desired)? == serde_json::to_value(&existing)? {
                return Ok((existing, EnsureOutcome::Unchanged));
            }
            if desired.immutable_fields() != existing.immutable_fields() {
                return Ok((existing, EnsureOutcome::ImmutableConflict));
            }
            let updated = client.replace(&desired).await?;
            debug!(kind = %kind, name, namespace, "Updated object");
            Ok((updated, EnsureOutcome::Updated))
        }
    }
}

/// [`create_or_update`], deleting the object when it cannot be updated in place
///
/// The deletion is reported as [`Error::ImmutableConflict`] so the pass ends;
/// the next pass recreates the object from scratch.
pub async fn create_or_replace<K, F>(
    client: &ResourceClient,
    namespace: &str,
    name: &str,
    mutate: F,
) -> Result<(K, EnsureOutcome)>
where
    K: Reconcilable,
    F: FnOnce(&mut K) -> Result<()>,
{
    let (obj, outcome) = create_or_update(client, namespace, name, mutate).await?;
    if outcome == EnsureOutcome::ImmutableConflict {
        info!(kind = %K::kind(&()), name, namespace, "Deleting object with immutable changes");
        client.delete::<K>(namespace, name).await?;
        return Err(Error::ImmutableConflict {
            kind: K::kind(&()).into_owned(),
            name: name.to_string(),
        });
    }
    Ok((obj, outcome))
}
