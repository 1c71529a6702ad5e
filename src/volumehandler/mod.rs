//! Point-in-time copies of volumes
//!
//! A [`VolumeHandler`] turns the volume options of a mover into PVCs and
//! VolumeSnapshots: the copy of a source volume the mover reads from, the
//! volume a destination writes into, and the image published once a
//! destination synchronization completes.

pub mod copy_trigger;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, TypedLocalObjectReference,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::adapters::{actions, reasons, EventPublisher, ResourceClient};
use crate::crd::{
    CopyMethod, DestinationVolumeOptions, SourceVolumeOptions, VolumeSnapshot,
    VolumeSnapshotSpec, SNAPSHOT_GROUP,
};
use crate::error::{Error, Result};
use crate::resources::{
    bounded_name, create_or_update, is_do_not_delete, is_new, mark_for_cleanup, set_owned_by,
    EnsureOutcome, Owner, Readiness, NAME_PREFIX, SNAPNAME_ANNOTATION,
};

use copy_trigger::GateDecision;

const STORAGE: &str = "storage";
const PVC_KIND: &str = "PersistentVolumeClaim";
const SNAPSHOT_KIND: &str = "VolumeSnapshot";

pub fn is_pvc_bound(pvc: &PersistentVolumeClaim) -> bool {
    pvc.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Bound")
}

/// Requested (or, failing that, provisioned) size of a PVC
pub fn pvc_capacity(pvc: &PersistentVolumeClaim) -> Option<Quantity> {
    pvc.spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get(STORAGE))
        .or_else(|| {
            pvc.status
                .as_ref()
                .and_then(|s| s.capacity.as_ref())
                .and_then(|c| c.get(STORAGE))
        })
        .cloned()
}

fn storage_request(capacity: Option<Quantity>) -> Option<VolumeResourceRequirements> {
    capacity.map(|q| VolumeResourceRequirements {
        requests: Some(BTreeMap::from([(STORAGE.to_string(), q)])),
        ..Default::default()
    })
}

/// Creates and tracks the volumes a mover works on
pub struct VolumeHandler {
    client: ResourceClient,
    events: Arc<dyn EventPublisher>,
    owner: Owner,
    copy_method: CopyMethod,
    capacity: Option<Quantity>,
    storage_class_name: Option<String>,
    access_modes: Vec<String>,
    volume_snapshot_class_name: Option<String>,
    copy_trigger_timeout: chrono::Duration,
}

impl VolumeHandler {
    pub fn for_source(
        client: ResourceClient,
        events: Arc<dyn EventPublisher>,
        owner: Owner,
        options: &SourceVolumeOptions,
        copy_trigger_timeout: chrono::Duration,
    ) -> Self {
        Self {
            client,
            events,
            owner,
            copy_method: options.copy_method,
            capacity: options.capacity.clone(),
            storage_class_name: options.storage_class_name.clone(),
            access_modes: options.access_modes.clone(),
            volume_snapshot_class_name: options.volume_snapshot_class_name.clone(),
            copy_trigger_timeout,
        }
    }

    pub fn for_destination(
        client: ResourceClient,
        events: Arc<dyn EventPublisher>,
        owner: Owner,
        options: &DestinationVolumeOptions,
    ) -> Self {
        Self {
            client,
            events,
            owner,
            copy_method: options.copy_method,
            capacity: options.capacity.clone(),
            storage_class_name: options.storage_class_name.clone(),
            access_modes: options.access_modes.clone(),
            volume_snapshot_class_name: options.volume_snapshot_class_name.clone(),
            copy_trigger_timeout: chrono::Duration::zero(),
        }
    }

    pub fn capacity(&self) -> Option<&Quantity> {
        self.capacity.as_ref()
    }

    pub fn storage_class_name(&self) -> Option<&str> {
        self.storage_class_name.as_deref()
    }

    pub fn access_modes(&self) -> &[String] {
        &self.access_modes
    }

    async fn event(&self, reason: &str, action: &str, note: String) {
        self.events
            .publish(
                &self.owner.object_reference(),
                EventType::Normal,
                reason,
                action,
                Some(note),
            )
            .await;
    }

    /// The PVC the mover should read `src` through
    ///
    /// Direct returns `src` itself; Clone and Snapshot produce a copy named
    /// `name`, marked for cleanup when `is_temporary`.
    pub async fn ensure_pvc_from_src(
        &self,
        src: &PersistentVolumeClaim,
        name: &str,
        is_temporary: bool,
    ) -> Result<Readiness<PersistentVolumeClaim>> {
        match self.copy_method {
            CopyMethod::None | CopyMethod::Direct => Ok(Readiness::Ready(src.clone())),
            CopyMethod::Clone => self.ensure_clone(src, name, is_temporary).await,
            CopyMethod::Snapshot => {
                let snapshot = match self.ensure_snapshot(src, name, is_temporary).await? {
                    Readiness::Ready(snapshot) => snapshot,
                    Readiness::Pending => return Ok(Readiness::Pending),
                };
                self.ensure_pvc_from_snapshot(src, &snapshot, name, is_temporary)
                    .await
            }
        }
    }

    /// Run the copy-trigger handshake for a copy of `src` that does not exist yet
    async fn copy_trigger_gate(&self, src: &PersistentVolumeClaim) -> Result<Readiness<()>> {
        let mut annotations = src.annotations().clone();
        if !copy_trigger::copy_trigger_enabled(&annotations) {
            return Ok(Readiness::Ready(()));
        }

        let decision =
            copy_trigger::evaluate_gate(&mut annotations, Utc::now(), self.copy_trigger_timeout);
        if annotations != *src.annotations() {
            let mut updated = src.clone();
            updated.metadata.annotations = Some(annotations);
            self.client.replace(&updated).await?;
        }

        match decision {
            GateDecision::Proceed => Ok(Readiness::Ready(())),
            GateDecision::Wait => {
                debug!(pvc = %src.name_any(), "Waiting for copy-trigger");
                Ok(Readiness::Pending)
            }
            GateDecision::TimedOut => Err(Error::CopyTriggerTimeout {
                pvc: src.name_any(),
            }),
        }
    }

    /// Advance the source's copy-trigger watermark once its copy is bound
    async fn complete_copy_trigger(&self, src: &PersistentVolumeClaim) -> Result<()> {
        if !copy_trigger::copy_trigger_enabled(src.annotations()) {
            return Ok(());
        }
        // the gate may have rewritten the PVC earlier in this pass
        let Some(current) = self
            .client
            .get::<PersistentVolumeClaim>(&self.owner.namespace, &src.name_any())
            .await?
        else {
            return Ok(());
        };
        let mut annotations = current.annotations().clone();
        copy_trigger::mark_completed(&mut annotations);
        if annotations != *current.annotations() {
            let mut updated = current;
            updated.metadata.annotations = Some(annotations);
            self.client.replace(&updated).await?;
            info!(pvc = %src.name_any(), "Copy-trigger satisfied");
        }
        Ok(())
    }

    async fn ensure_clone(
        &self,
        src: &PersistentVolumeClaim,
        name: &str,
        is_temporary: bool,
    ) -> Result<Readiness<PersistentVolumeClaim>> {
        let ns = &self.owner.namespace;
        if self
            .client
            .get::<PersistentVolumeClaim>(ns, name)
            .await?
            .is_none()
        {
            if let Readiness::Pending = self.copy_trigger_gate(src).await? {
                return Ok(Readiness::Pending);
            }
        }

        let src_spec = src.spec.clone().unwrap_or_default();
        let (pvc, outcome) = create_or_update::<PersistentVolumeClaim, _>(
            &self.client,
            ns,
            name,
            |pvc| {
                if is_temporary {
                    mark_for_cleanup(&mut pvc.metadata, &self.owner);
                }
                set_owned_by(&mut pvc.metadata, &self.owner);
                if is_new(pvc) {
                    pvc.spec = Some(PersistentVolumeClaimSpec {
                        access_modes: Some(self.access_modes_or(&src_spec.access_modes)),
                        resources: storage_request(
                            self.capacity.clone().or_else(|| pvc_capacity(src)),
                        ),
                        storage_class_name: self
                            .storage_class_name
                            .clone()
                            .or_else(|| src_spec.storage_class_name.clone()),
                        volume_mode: src_spec.volume_mode.clone(),
                        data_source: Some(TypedLocalObjectReference {
                            api_group: None,
                            kind: PVC_KIND.to_string(),
                            name: src.name_any(),
                        }),
                        ..Default::default()
                    });
                }
                Ok(())
            },
        )
        .await?;

        if outcome == EnsureOutcome::Created {
            self.event(
                reasons::PVC_CREATED,
                actions::CREATE_PVC,
                format!("created {} from {}", name, src.name_any()),
            )
            .await;
        }

        // bound only once a consumer exists under WaitForFirstConsumer, so
        // the clone is handed out before it binds
        if is_pvc_bound(&pvc) {
            self.complete_copy_trigger(src).await?;
        }
        Ok(Readiness::Ready(pvc))
    }

    async fn ensure_snapshot(
        &self,
        src: &PersistentVolumeClaim,
        name: &str,
        is_temporary: bool,
    ) -> Result<Readiness<VolumeSnapshot>> {
        let ns = &self.owner.namespace;
        if self.client.get::<VolumeSnapshot>(ns, name).await?.is_none() {
            if let Readiness::Pending = self.copy_trigger_gate(src).await? {
                return Ok(Readiness::Pending);
            }
        }

        let (snapshot, outcome) = create_or_update::<VolumeSnapshot, _>(
            &self.client,
            ns,
            name,
            |snap| {
                if is_temporary {
                    mark_for_cleanup(&mut snap.metadata, &self.owner);
                }
                set_owned_by(&mut snap.metadata, &self.owner);
                if is_new(snap) {
                    snap.spec.source.persistent_volume_claim_name = Some(src.name_any());
                    snap.spec.volume_snapshot_class_name = self.volume_snapshot_class_name.clone();
                }
                Ok(())
            },
        )
        .await?;

        if outcome == EnsureOutcome::Created {
            self.event(
                reasons::SNAPSHOT_CREATED,
                actions::CREATE_SNAPSHOT,
                format!("created {} from {}", name, src.name_any()),
            )
            .await;
        }

        if !snapshot.is_bound() {
            debug!(snapshot = %name, "Waiting for snapshot to be bound");
            return Ok(Readiness::Pending);
        }
        self.complete_copy_trigger(src).await?;
        Ok(Readiness::Ready(snapshot))
    }

    async fn ensure_pvc_from_snapshot(
        &self,
        src: &PersistentVolumeClaim,
        snapshot: &VolumeSnapshot,
        name: &str,
        is_temporary: bool,
    ) -> Result<Readiness<PersistentVolumeClaim>> {
        let src_spec = src.spec.clone().unwrap_or_default();
        let restore_size = snapshot.status.as_ref().and_then(|s| s.restore_size.clone());
        let (pvc, outcome) = create_or_update::<PersistentVolumeClaim, _>(
            &self.client,
            &self.owner.namespace,
            name,
            |pvc| {
                if is_temporary {
                    mark_for_cleanup(&mut pvc.metadata, &self.owner);
                }
                set_owned_by(&mut pvc.metadata, &self.owner);
                if is_new(pvc) {
                    pvc.spec = Some(PersistentVolumeClaimSpec {
                        access_modes: Some(self.access_modes_or(&src_spec.access_modes)),
                        resources: storage_request(
                            self.capacity
                                .clone()
                                .or(restore_size)
                                .or_else(|| pvc_capacity(src)),
                        ),
                        storage_class_name: self
                            .storage_class_name
                            .clone()
                            .or_else(|| src_spec.storage_class_name.clone()),
                        volume_mode: src_spec.volume_mode.clone(),
                        data_source: Some(TypedLocalObjectReference {
                            api_group: Some(SNAPSHOT_GROUP.to_string()),
                            kind: SNAPSHOT_KIND.to_string(),
                            name: snapshot.name_any(),
                        }),
                        ..Default::default()
                    });
                }
                Ok(())
            },
        )
        .await?;

        if outcome == EnsureOutcome::Created {
            self.event(
                reasons::PVC_CREATED,
                actions::CREATE_PVC,
                format!("created {} from snapshot {}", name, snapshot.name_any()),
            )
            .await;
        }
        Ok(Readiness::Ready(pvc))
    }

    fn access_modes_or(&self, fallback: &Option<Vec<String>>) -> Vec<String> {
        if self.access_modes.is_empty() {
            fallback.clone().unwrap_or_default()
        } else {
            self.access_modes.clone()
        }
    }

    /// Provision (or keep) a PVC sized and classed from the volume options
    pub async fn ensure_new_pvc(
        &self,
        name: &str,
        is_temporary: bool,
    ) -> Result<Readiness<PersistentVolumeClaim>> {
        let Some(capacity) = self.capacity.clone() else {
            return Err(Error::validation(
                "capacity must be specified when no existing PVC is provided",
            ));
        };
        if self.access_modes.is_empty() {
            return Err(Error::validation(
                "accessModes must be specified when no existing PVC is provided",
            ));
        }

        let (pvc, outcome) = create_or_update::<PersistentVolumeClaim, _>(
            &self.client,
            &self.owner.namespace,
            name,
            |pvc| {
                if is_temporary {
                    mark_for_cleanup(&mut pvc.metadata, &self.owner);
                }
                set_owned_by(&mut pvc.metadata, &self.owner);
                if is_new(pvc) {
                    pvc.spec = Some(PersistentVolumeClaimSpec {
                        access_modes: Some(self.access_modes.clone()),
                        resources: storage_request(Some(capacity)),
                        storage_class_name: self.storage_class_name.clone(),
                        ..Default::default()
                    });
                }
                Ok(())
            },
        )
        .await?;

        if outcome == EnsureOutcome::Created {
            self.event(
                reasons::PVC_CREATED,
                actions::CREATE_PVC,
                format!("created {}", name),
            )
            .await;
        }
        Ok(Readiness::Ready(pvc))
    }

    /// A user supplied PVC; it is neither owned nor modified
    pub async fn use_provided_pvc(&self, name: &str) -> Result<Readiness<PersistentVolumeClaim>> {
        Ok(Readiness::Ready(
            self.client
                .get_required::<PersistentVolumeClaim>(&self.owner.namespace, name)
                .await?,
        ))
    }

    /// Preserve the destination volume as the latest image
    pub async fn ensure_image(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<Readiness<TypedLocalObjectReference>> {
        match self.copy_method {
            CopyMethod::None | CopyMethod::Direct => {
                Ok(Readiness::Ready(TypedLocalObjectReference {
                    api_group: None,
                    kind: PVC_KIND.to_string(),
                    name: pvc.name_any(),
                }))
            }
            CopyMethod::Snapshot => self.ensure_image_snapshot(pvc, Utc::now()).await,
            CopyMethod::Clone => Err(Error::validation(
                "copyMethod Clone is not supported for destinations",
            )),
        }
    }

    async fn ensure_image_snapshot(
        &self,
        pvc: &PersistentVolumeClaim,
        now: DateTime<Utc>,
    ) -> Result<Readiness<TypedLocalObjectReference>> {
        let ns = &self.owner.namespace;
        let snap_name = match pvc.annotations().get(SNAPNAME_ANNOTATION) {
            Some(name) => name.clone(),
            None => {
                let name = bounded_name(
                    NAME_PREFIX,
                    &self.owner,
                    &format!("-dst-{}", now.format("%Y%m%d%H%M%S")),
                );
                // the name is recorded before the snapshot exists so a retry
                // reuses it instead of taking a second snapshot
                let mut updated = pvc.clone();
                updated
                    .annotations_mut()
                    .insert(SNAPNAME_ANNOTATION.to_string(), name.clone());
                self.client.replace(&updated).await?;
                name
            }
        };

        let (snapshot, outcome) = create_or_update::<VolumeSnapshot, _>(
            &self.client,
            ns,
            &snap_name,
            |snap| {
                set_owned_by(&mut snap.metadata, &self.owner);
                if is_new(snap) {
                    snap.spec = VolumeSnapshotSpec {
                        volume_snapshot_class_name: self.volume_snapshot_class_name.clone(),
                        ..Default::default()
                    };
                    snap.spec.source.persistent_volume_claim_name = Some(pvc.name_any());
                }
                Ok(())
            },
        )
        .await?;

        if outcome == EnsureOutcome::Created {
            self.event(
                reasons::SNAPSHOT_CREATED,
                actions::CREATE_SNAPSHOT,
                format!("created {} from {}", snap_name, pvc.name_any()),
            )
            .await;
        }

        if !snapshot.is_bound() {
            debug!(snapshot = %snap_name, "Waiting for image snapshot to be bound");
            return Ok(Readiness::Pending);
        }
        Ok(Readiness::Ready(TypedLocalObjectReference {
            api_group: Some(SNAPSHOT_GROUP.to_string()),
            kind: SNAPSHOT_KIND.to_string(),
            name: snap_name,
        }))
    }

    /// Forget the image snapshot recorded on a destination PVC
    pub async fn remove_snapshot_annotation_from_pvc(&self, pvc_name: &str) -> Result<()> {
        let Some(mut pvc) = self
            .client
            .get::<PersistentVolumeClaim>(&self.owner.namespace, pvc_name)
            .await?
        else {
            return Ok(());
        };
        if pvc.annotations_mut().remove(SNAPNAME_ANNOTATION).is_some() {
            self.client.replace(&pvc).await?;
        }
        Ok(())
    }
}

/// Queue the previous image snapshot for removal once a new image replaces it
pub async fn release_previous_image(
    client: &ResourceClient,
    owner: &Owner,
    previous: Option<&TypedLocalObjectReference>,
    latest: &TypedLocalObjectReference,
) -> Result<()> {
    let Some(previous) = previous else {
        return Ok(());
    };
    if previous.kind != SNAPSHOT_KIND || previous.name == latest.name {
        return Ok(());
    }
    let Some(mut snapshot) = client
        .get::<VolumeSnapshot>(&owner.namespace, &previous.name)
        .await?
    else {
        return Ok(());
    };
    if is_do_not_delete(&snapshot.metadata) {
        return Ok(());
    }
    mark_for_cleanup(&mut snapshot.metadata, owner);
    client.replace(&snapshot).await?;
    Ok(())
}
