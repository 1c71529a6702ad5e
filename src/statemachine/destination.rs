use async_trait::async_trait;
use kube::ResourceExt;
use tracing::info;

use super::ReplicationMachine;
use crate::adapters::ResourceClient;
use crate::crd::{ReplicationDestination, ReplicationDestinationStatus, SyncStatus, TriggerSpec};
use crate::error::Result;
use crate::metrics::SyncMetrics;
use crate::movers::{Mover, MoverResult, OwnerStatus};
use crate::resources::Owner;
use crate::volumehandler::release_previous_image;

/// A ReplicationDestination and its mover
///
/// A completed synchronization that carries an image becomes `latestImage`;
/// the image it replaces is handed to the cleanup sweep.
pub struct DestinationMachine<'a> {
    client: ResourceClient,
    owner: Owner,
    trigger: Option<TriggerSpec>,
    status: &'a mut ReplicationDestinationStatus,
    mover: &'a dyn Mover,
    metrics: SyncMetrics,
}

impl<'a> DestinationMachine<'a> {
    pub fn new(
        client: ResourceClient,
        destination: &ReplicationDestination,
        status: &'a mut ReplicationDestinationStatus,
        mover: &'a dyn Mover,
    ) -> Self {
        Self {
            client,
            owner: Owner::from_resource(destination),
            trigger: destination.spec.trigger.clone(),
            metrics: SyncMetrics::new(
                &destination.name_any(),
                &destination.namespace().unwrap_or_default(),
                "destination",
                mover.name(),
            ),
            status,
            mover,
        }
    }
}

#[async_trait]
impl ReplicationMachine for DestinationMachine<'_> {
    fn trigger(&self) -> Option<&TriggerSpec> {
        self.trigger.as_ref()
    }

    fn status(&self) -> &SyncStatus {
        &self.status.sync
    }

    fn status_mut(&mut self) -> &mut SyncStatus {
        &mut self.status.sync
    }

    fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    async fn synchronize(&mut self) -> Result<MoverResult> {
        let result = self
            .mover
            .synchronize(&mut OwnerStatus::Destination(&mut *self.status))
            .await?;
        if let (true, Some(image)) = (result.completed, result.image.as_ref()) {
            release_previous_image(
                &self.client,
                &self.owner,
                self.status.latest_image.as_ref(),
                image,
            )
            .await?;
            info!(kind = %image.kind, image = %image.name, "Published latest image");
            self.status.latest_image = Some(image.clone());
        }
        Ok(result)
    }

    async fn cleanup(&mut self) -> Result<MoverResult> {
        self.mover
            .cleanup(&mut OwnerStatus::Destination(&mut *self.status))
            .await
    }
}
