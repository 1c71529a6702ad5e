//! ReplicationDestination Custom Resource Definition

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::TypedLocalObjectReference;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{CustomCaSpec, DestinationVolumeOptions, ExternalSpec, MoverConfig, SyncStatus, TriggerSpec};

/// ReplicationDestination resource specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "volsync.backube",
    version = "v1alpha1",
    kind = "ReplicationDestination",
    plural = "replicationdestinations",
    singular = "replicationdestination",
    namespaced,
    status = "ReplicationDestinationStatus",
    printcolumn = r#"{"name": "Last sync", "type": "string", "format": "date-time", "jsonPath": ".status.lastSyncTime"}"#,
    printcolumn = r#"{"name": "Duration", "type": "string", "jsonPath": ".status.lastSyncDuration"}"#,
    printcolumn = r#"{"name": "Next sync", "type": "string", "format": "date-time", "jsonPath": ".status.nextSyncTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationDestinationSpec {
    /// When synchronizations start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerSpec>,

    /// Restic mover configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restic: Option<ReplicationDestinationResticSpec>,

    /// Rsync-over-TLS mover configuration
    #[serde(rename = "rsyncTLS", skip_serializing_if = "Option::is_none")]
    pub rsync_tls: Option<ReplicationDestinationRsyncTlsSpec>,

    /// Mover implemented outside this operator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalSpec>,

    /// Stop launching mover Pods
    #[serde(default)]
    pub paused: bool,
}

/// Restic destination configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationDestinationResticSpec {
    #[serde(flatten)]
    pub volume: DestinationVolumeOptions,

    /// Secret holding the restic repository configuration
    pub repository: String,

    /// Capacity of the restic cache volume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_capacity: Option<Quantity>,

    /// StorageClass of the restic cache volume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_storage_class_name: Option<String>,

    /// Access modes of the restic cache volume
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cache_access_modes: Vec<String>,

    /// Restore the latest snapshot taken at or before this RFC3339 time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_as_of: Option<String>,

    /// Restore the Nth snapshot before the selected one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<i32>,

    /// Delete files on the destination that are absent from the snapshot
    #[serde(default)]
    pub enable_file_deletion: bool,

    /// Custom CA for the repository endpoint
    #[serde(rename = "customCA", skip_serializing_if = "Option::is_none")]
    pub custom_ca: Option<CustomCaSpec>,

    #[serde(flatten)]
    pub mover: MoverConfig,
}

/// Rsync-over-TLS destination configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationDestinationRsyncTlsSpec {
    #[serde(flatten)]
    pub volume: DestinationVolumeOptions,

    /// Secret holding the pre-shared key; generated when omitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_secret: Option<String>,

    /// Type of the Service exposing the mover (default ClusterIP)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    /// Annotations added to the Service
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_annotations: BTreeMap<String, String>,

    #[serde(flatten)]
    pub mover: MoverConfig,
}

/// Rsync-over-TLS destination status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RsyncTlsDestinationStatus {
    /// Address sources should connect to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Port sources should connect to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Secret holding the pre-shared key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_secret: Option<String>,
}

/// ReplicationDestination status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationDestinationStatus {
    #[serde(flatten)]
    pub sync: SyncStatus,

    /// Most recent consistent copy of the replicated data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_image: Option<TypedLocalObjectReference>,

    /// Rsync-over-TLS specific status
    #[serde(rename = "rsyncTLS", skip_serializing_if = "Option::is_none")]
    pub rsync_tls: Option<RsyncTlsDestinationStatus>,
}
