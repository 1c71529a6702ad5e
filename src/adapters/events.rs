//! Kubernetes Event recording
//!
//! Events are fire-and-forget: a failed publish is logged and never breaks
//! a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about replication objects
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// [`EventPublisher`] backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `controller_name` is reported as the Event's reportingComponent
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Discards every Event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    /// A mover Job was created
    pub const TRANSFER_STARTED: &str = "TransferStarted";
    /// A mover Job exhausted its retries
    pub const TRANSFER_FAILED: &str = "TransferFailed";
    /// A data PVC was provisioned for the mover
    pub const PVC_CREATED: &str = "PersistentVolumeClaimCreated";
    /// A point-in-time VolumeSnapshot was taken
    pub const SNAPSHOT_CREATED: &str = "VolumeSnapshotCreated";
    /// The destination's Service received an address
    pub const SERVICE_ADDRESS_ASSIGNED: &str = "ServiceAddressAssigned";
    /// The source PVC's copy-trigger was not updated in time
    pub const COPY_TRIGGER_TIMEOUT: &str = "CopyTriggerTimeout";
}

/// Event actions, shown in the ACTION column of `kubectl get events`
pub mod actions {
    pub const CREATE_JOB: &str = "CreateJob";
    pub const DELETE_JOB: &str = "DeleteJob";
    pub const CREATE_PVC: &str = "CreatePersistentVolumeClaim";
    pub const CREATE_SNAPSHOT: &str = "CreateVolumeSnapshot";
    pub const PUBLISH_ADDRESS: &str = "PublishAddress";
    pub const WAIT_FOR_TRIGGER: &str = "WaitForCopyTrigger";
}
