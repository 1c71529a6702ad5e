//! Labels, names and ownership shared by every generated object
//!
//! Every object a mover creates is owned by its ReplicationSource or
//! ReplicationDestination and carries the managed-by label. Objects that only
//! live for one synchronization additionally carry the cleanup label, which
//! the cleanup sweep selects on.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

/// Label identifying objects created by this operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "volsync";

/// Label holding the owner's uid on objects removed after each synchronization
pub const CLEANUP_LABEL: &str = "volsync.backube/cleanup";

/// Label protecting an object from the cleanup sweep
pub const DO_NOT_DELETE_LABEL: &str = "volsync.backube/do-not-delete";

/// Annotation on a destination PVC naming the snapshot taken of it
pub const SNAPNAME_ANNOTATION: &str = "volsync.backube/snapname";

/// Namespace annotation allowing privileged movers
pub const PRIVILEGED_MOVERS_ANNOTATION: &str = "volsync.backube/privileged-movers";

/// CR annotation turning on mover debug output
pub const ENABLE_DEBUG_ANNOTATION: &str = "volsync.backube/enable-debug-mover";

/// Prefix of every generated object name
pub const NAME_PREFIX: &str = "volsync-";

/// Longest name accepted for labels and most object kinds
pub const MAX_NAME_LENGTH: usize = 63;

/// The replication object a mover acts for
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Owner {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub annotations: BTreeMap<String, String>,
}

impl Owner {
    pub fn from_resource<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        Self {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            name: obj.name_any(),
            namespace: obj.namespace().unwrap_or_default(),
            uid: obj.uid().unwrap_or_default(),
            creation_timestamp: obj.meta().creation_timestamp.as_ref().map(|t| t.0),
            annotations: obj.annotations().clone(),
        }
    }

    /// Controller reference placed on every generated object
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Reference used as the subject of Events
    pub fn object_reference(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(self.api_version.clone()),
            kind: Some(self.kind.clone()),
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            uid: Some(self.uid.clone()),
            ..Default::default()
        }
    }

    pub fn debug_enabled(&self) -> bool {
        self.annotations
            .get(ENABLE_DEBUG_ANNOTATION)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

/// `<prefix><owner name><suffix>`, falling back to the owner's uid when too long
pub fn bounded_name(prefix: &str, owner: &Owner, suffix: &str) -> String {
    let name = format!("{}{}{}", prefix, owner.name, suffix);
    if name.len() > MAX_NAME_LENGTH {
        format!("{}{}{}", prefix, owner.uid, suffix)
    } else {
        name
    }
}

/// Make `owner` the controller of `meta` and stamp the managed-by label
pub fn set_owned_by(meta: &mut ObjectMeta, owner: &Owner) {
    let reference = owner.owner_reference();
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    refs.retain(|r| r.controller != Some(true) || r.uid == reference.uid);
    match refs.iter_mut().find(|r| r.uid == reference.uid) {
        Some(existing) => *existing = reference,
        None => refs.push(reference),
    }
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
}

/// Drop `owner`'s reference from `meta`
pub fn remove_owned_by(meta: &mut ObjectMeta, owner_uid: &str) {
    if let Some(refs) = meta.owner_references.as_mut() {
        refs.retain(|r| r.uid != owner_uid);
    }
}

/// Label `meta` for removal at the end of the current synchronization
pub fn mark_for_cleanup(meta: &mut ObjectMeta, owner: &Owner) {
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(CLEANUP_LABEL.to_string(), owner.uid.clone());
}

pub fn unmark_for_cleanup(meta: &mut ObjectMeta) {
    if let Some(labels) = meta.labels.as_mut() {
        labels.remove(CLEANUP_LABEL);
    }
}

pub fn is_marked_for_cleanup(meta: &ObjectMeta, owner: &Owner) -> bool {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(CLEANUP_LABEL))
        .is_some_and(|uid| *uid == owner.uid)
}

pub fn is_do_not_delete(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .is_some_and(|l| l.contains_key(DO_NOT_DELETE_LABEL))
}

/// Selector matching every object marked for cleanup by `owner`
pub fn cleanup_selector(owner: &Owner) -> BTreeMap<String, String> {
    BTreeMap::from([(CLEANUP_LABEL.to_string(), owner.uid.clone())])
}

/// Labels selecting the mover Pod of one owner and direction
pub fn mover_pod_labels(owner: &Owner, direction: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            bounded_name(&format!("{}{}-", NAME_PREFIX, direction), owner, ""),
        ),
        ("app.kubernetes.io/component".to_string(), "mover".to_string()),
        ("app.kubernetes.io/part-of".to_string(), "volsync".to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(name: &str) -> Owner {
        Owner {
            api_version: "volsync.backube/v1alpha1".into(),
            kind: "ReplicationSource".into(),
            name: name.into(),
            namespace: "ns".into(),
            uid: "0b5f1c3e-6f0e-4d9b-9e53-3f7b0f2f1a11".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_bounded_name_short() {
        assert_eq!(bounded_name("volsync-src-", &owner("db"), ""), "volsync-src-db");
    }

    #[test]
    fn test_bounded_name_falls_back_to_uid() {
        let long = "a".repeat(60);
        let name = bounded_name("volsync-src-", &owner(&long), "");
        assert_eq!(name, "volsync-src-0b5f1c3e-6f0e-4d9b-9e53-3f7b0f2f1a11");
        assert!(name.len() <= MAX_NAME_LENGTH);
    }

    #[test]
    fn test_set_owned_by_replaces_other_controller() {
        let mut meta = ObjectMeta {
            owner_references: Some(vec![OwnerReference {
                uid: "someone-else".into(),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let o = owner("db");
        set_owned_by(&mut meta, &o);
        set_owned_by(&mut meta, &o);

        let refs = meta.owner_references.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, o.uid);
        assert_eq!(
            meta.labels.unwrap().get(MANAGED_BY_LABEL).map(String::as_str),
            Some(MANAGED_BY_VALUE)
        );
    }

    #[test]
    fn test_cleanup_marking() {
        let o = owner("db");
        let mut meta = ObjectMeta::default();
        mark_for_cleanup(&mut meta, &o);
        assert!(is_marked_for_cleanup(&meta, &o));
        unmark_for_cleanup(&mut meta);
        assert!(!is_marked_for_cleanup(&meta, &o));
    }
}
