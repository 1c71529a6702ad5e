//! Types shared by ReplicationSource and ReplicationDestination

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Affinity, PodSecurityContext, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the replication resources
pub const GROUP: &str = "volsync.backube";

/// Condition type tracking the synchronization cycle
pub const CONDITION_SYNCHRONIZING: &str = "Synchronizing";

/// Condition reasons for [`CONDITION_SYNCHRONIZING`]
pub mod reasons {
    pub const SYNC_IN_PROGRESS: &str = "SyncInProgress";
    pub const WAITING_FOR_SCHEDULE: &str = "WaitingForSchedule";
    pub const WAITING_FOR_MANUAL: &str = "WaitingForManual";
    pub const CLEANING_UP: &str = "CleaningUp";
    pub const ERROR: &str = "Error";
}

/// When a synchronization should start
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    /// Cron-style schedule (5-field or @-shorthand)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Manual trigger tag; a sync runs whenever it differs from status.lastManualSync
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual: Option<String>,
}

/// How the mover obtains a point-in-time view of a volume
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CopyMethod {
    /// Use the volume directly (legacy spelling of Direct)
    None,
    /// Use the volume directly
    #[default]
    Direct,
    /// Clone the volume through a PVC dataSource
    Clone,
    /// Take a VolumeSnapshot and restore it into a new PVC
    Snapshot,
}

impl std::fmt::Display for CopyMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyMethod::None => write!(f, "None"),
            CopyMethod::Direct => write!(f, "Direct"),
            CopyMethod::Clone => write!(f, "Clone"),
            CopyMethod::Snapshot => write!(f, "Snapshot"),
        }
    }
}

/// Volume options for the source side of a mover
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceVolumeOptions {
    /// How to make the point-in-time copy of the source volume
    #[serde(default)]
    pub copy_method: CopyMethod,

    /// Capacity of the point-in-time copy (defaults to the source's)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<Quantity>,

    /// StorageClass of the point-in-time copy (defaults to the source's)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Access modes of the point-in-time copy (defaults to the source's)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,

    /// VolumeSnapshotClass used when copyMethod is Snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

/// Volume options for the destination side of a mover
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationVolumeOptions {
    /// How the synchronized data is preserved as latestImage (Direct or Snapshot)
    #[serde(default)]
    pub copy_method: CopyMethod,

    /// Capacity of the dynamically provisioned destination volume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<Quantity>,

    /// StorageClass of the dynamically provisioned destination volume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Access modes of the dynamically provisioned destination volume
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,

    /// VolumeSnapshotClass used when copyMethod is Snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,

    /// Existing PVC to receive the data instead of provisioning one
    #[serde(rename = "destinationPVC", skip_serializing_if = "Option::is_none")]
    pub destination_pvc: Option<String>,
}

/// Overrides applied to the mover Pod
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MoverConfig {
    /// Pod-level security context for the mover
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mover_security_context: Option<PodSecurityContext>,

    /// Existing ServiceAccount to run the mover as
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mover_service_account: Option<String>,

    /// Resource requirements of the mover container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mover_resources: Option<ResourceRequirements>,

    /// Scheduling affinity of the mover Pod
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mover_affinity: Option<Affinity>,
}

/// Hands the CR to a mover implemented outside this operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSpec {
    /// Name of the external provider
    pub provider: String,

    /// Provider-specific parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Secret holding a custom certificate authority
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomCaSpec {
    /// Secret name
    pub secret_name: String,
    /// Key within the Secret holding the PEM bundle
    pub key: String,
}

/// Outcome of the most recent mover Job
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub enum MoverResult {
    Successful,
    Failed,
}

/// Result and filtered logs of the most recent mover Job
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MoverStatus {
    pub result: MoverResult,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logs: String,
}

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Reason for the condition
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

/// Insert or update a condition, bumping lastTransitionTime only when status changes
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
) {
    let status = if status { "True" } else { "False" }.to_string();
    let message = message.into();
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Utc::now();
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message;
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status,
            last_transition_time: Utc::now(),
            reason: reason.to_string(),
            message,
        }),
    }
}

/// Look up a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Synchronization bookkeeping shared by both CR kinds
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Completion time of the most recent sync
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,

    /// Start time of the current or most recent sync
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_start_time: Option<DateTime<Utc>>,

    /// Duration of the most recent sync
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_duration: Option<String>,

    /// When the next scheduled sync starts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_sync_time: Option<DateTime<Utc>>,

    /// Manual trigger tag of the most recent manual sync
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_manual_sync: Option<String>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Result of the most recent mover Job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_mover_status: Option<MoverStatus>,
}
