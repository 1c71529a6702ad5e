//! ReplicationSource Custom Resource Definition

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{CustomCaSpec, ExternalSpec, MoverConfig, SourceVolumeOptions, SyncStatus, TriggerSpec};

/// ReplicationSource resource specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "volsync.backube",
    version = "v1alpha1",
    kind = "ReplicationSource",
    plural = "replicationsources",
    singular = "replicationsource",
    namespaced,
    status = "ReplicationSourceStatus",
    printcolumn = r#"{"name": "Source", "type": "string", "jsonPath": ".spec.sourcePVC"}"#,
    printcolumn = r#"{"name": "Last sync", "type": "string", "format": "date-time", "jsonPath": ".status.lastSyncTime"}"#,
    printcolumn = r#"{"name": "Duration", "type": "string", "jsonPath": ".status.lastSyncDuration"}"#,
    printcolumn = r#"{"name": "Next sync", "type": "string", "format": "date-time", "jsonPath": ".status.nextSyncTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceSpec {
    /// Name of the PVC to replicate
    #[serde(rename = "sourcePVC")]
    pub source_pvc: String,

    /// When synchronizations start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerSpec>,

    /// Restic mover configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restic: Option<ReplicationSourceResticSpec>,

    /// Rsync-over-TLS mover configuration
    #[serde(rename = "rsyncTLS", skip_serializing_if = "Option::is_none")]
    pub rsync_tls: Option<ReplicationSourceRsyncTlsSpec>,

    /// Mover implemented outside this operator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalSpec>,

    /// Stop launching mover Pods
    #[serde(default)]
    pub paused: bool,
}

/// Retention policy applied with `restic forget`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResticRetainPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hourly: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weekly: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yearly: Option<i32>,
    /// Keep everything newer than this duration (e.g. "3d4h")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub within: Option<String>,
}

/// Restic source configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceResticSpec {
    #[serde(flatten)]
    pub volume: SourceVolumeOptions,

    /// Days between prune operations (default 7)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prune_interval_days: Option<i32>,

    /// Secret holding the restic repository configuration
    pub repository: String,

    /// Snapshot retention policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retain: Option<ResticRetainPolicy>,

    /// Capacity of the restic cache volume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_capacity: Option<Quantity>,

    /// StorageClass of the restic cache volume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_storage_class_name: Option<String>,

    /// Access modes of the restic cache volume
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cache_access_modes: Vec<String>,

    /// Custom CA for the repository endpoint
    #[serde(rename = "customCA", skip_serializing_if = "Option::is_none")]
    pub custom_ca: Option<CustomCaSpec>,

    /// Changing this value runs `restic unlock` before the next backup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlock: Option<String>,

    #[serde(flatten)]
    pub mover: MoverConfig,
}

/// Rsync-over-TLS source configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceRsyncTlsSpec {
    #[serde(flatten)]
    pub volume: SourceVolumeOptions,

    /// Secret holding the pre-shared key (psk.txt)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_secret: Option<String>,

    /// Address of the destination
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Port of the destination (default 8000)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    #[serde(flatten)]
    pub mover: MoverConfig,
}

/// Restic-specific source status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResticSourceStatus {
    /// When the repository was last pruned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pruned: Option<DateTime<Utc>>,

    /// Value of spec.restic.unlock last acted upon
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_unlocked: Option<String>,
}

/// ReplicationSource status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceStatus {
    #[serde(flatten)]
    pub sync: SyncStatus,

    /// Restic-specific status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restic: Option<ResticSourceStatus>,
}
