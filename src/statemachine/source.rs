use async_trait::async_trait;
use kube::ResourceExt;

use super::ReplicationMachine;
use crate::crd::{ReplicationSource, ReplicationSourceStatus, SyncStatus, TriggerSpec};
use crate::error::Result;
use crate::metrics::SyncMetrics;
use crate::movers::{Mover, MoverResult, OwnerStatus};

/// A ReplicationSource and its mover
pub struct SourceMachine<'a> {
    trigger: Option<TriggerSpec>,
    status: &'a mut ReplicationSourceStatus,
    mover: &'a dyn Mover,
    metrics: SyncMetrics,
}

impl<'a> SourceMachine<'a> {
    pub fn new(
        source: &ReplicationSource,
        status: &'a mut ReplicationSourceStatus,
        mover: &'a dyn Mover,
    ) -> Self {
        Self {
            trigger: source.spec.trigger.clone(),
            metrics: SyncMetrics::new(
                &source.name_any(),
                &source.namespace().unwrap_or_default(),
                "source",
                mover.name(),
            ),
            status,
            mover,
        }
    }
}

#[async_trait]
impl ReplicationMachine for SourceMachine<'_> {
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
        self.mover
            .synchronize(&mut OwnerStatus::Source(&mut *self.status))
            .await
    }

    async fn cleanup(&mut self) -> Result<MoverResult> {
        self.mover
            .cleanup(&mut OwnerStatus::Source(&mut *self.status))
            .await
    }
}
