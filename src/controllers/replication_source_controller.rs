//! ReplicationSource controller
//!
//! Watches ReplicationSource resources and the objects their movers own.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use tracing::{debug, error, info, instrument};

use super::{retry_delay, Context};
use crate::crd::{
    reasons, set_condition, ReplicationSource, ReplicationSourceStatus, CONDITION_SYNCHRONIZING,
};
use crate::error::{Error, Result};
use crate::metrics::{self, SyncMetrics};
use crate::movers::privileged_movers_allowed;
use crate::statemachine::{self, Requeue, SourceMachine};

const KIND: &str = "ReplicationSource";

/// Run the ReplicationSource controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<ReplicationSource> = Api::all(client.clone());

    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("ReplicationSource CRD not installed: {}", e);
        return;
    }

    info!("Starting ReplicationSource controller");

    let concurrency = context.config.max_concurrent_reconciles;
    Controller::new(api, WatcherConfig::default())
        .owns(Api::<Job>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<PersistentVolumeClaim>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<Service>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<Secret>::all(client), WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled ReplicationSource"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                    metrics::RECONCILIATION_ERRORS.with_label_values(&[KIND]).inc();
                }
            }
        })
        .await;
}

#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<ReplicationSource>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[KIND])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();

    reconcile_source(&obj, &ctx).await.map(Action::from)
}

/// One pass over a ReplicationSource: pick its mover, run the state
/// machine, and write the resulting status
pub async fn reconcile_source(source: &ReplicationSource, ctx: &Context) -> Result<Requeue> {
    let name = source.name_any();
    let namespace = source.namespace().unwrap_or_default();

    if source.metadata.deletion_timestamp.is_some() {
        // owned objects go with the CR through garbage collection
        debug!(name = %name, "ReplicationSource is being deleted");
        if let Some(method) = mover_method(source) {
            SyncMetrics::new(&name, &namespace, "source", method).remove();
        }
        return Ok(Requeue::AwaitChange);
    }

    let privileged = privileged_movers_allowed(&ctx.kube, &namespace).await?;
    let mover = match ctx
        .catalog
        .source_mover(&ctx.mover_env(), source, privileged)
    {
        Ok(Some(mover)) => mover,
        Ok(None) => return Ok(Requeue::AwaitChange),
        Err(e) => {
            let mut status = source.status.clone().unwrap_or_default();
            set_condition(
                &mut status.sync.conditions,
                CONDITION_SYNCHRONIZING,
                false,
                reasons::ERROR,
                e.to_string(),
            );
            write_status(ctx, source, status).await?;
            return Err(e);
        }
    };

    let mut status = source.status.clone().unwrap_or_default();
    let outcome = {
        let mut machine = SourceMachine::new(source, &mut status, mover.as_ref());
        statemachine::run(&mut machine, Utc::now(), ctx.config.sync_poll_interval()).await
    };
    write_status(ctx, source, status).await?;
    outcome
}

async fn write_status(
    ctx: &Context,
    source: &ReplicationSource,
    status: ReplicationSourceStatus,
) -> Result<()> {
    let mut updated = source.clone();
    updated.status = Some(status);
    ctx.kube.apply_status(&updated).await
}

fn mover_method(source: &ReplicationSource) -> Option<&'static str> {
    if source.spec.restic.is_some() {
        Some("restic")
    } else if source.spec.rsync_tls.is_some() {
        Some("rsync-tls")
    } else {
        None
    }
}

fn error_policy(obj: Arc<ReplicationSource>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        name = %obj.name_any(),
        error = %error,
        "Reconciliation failed, scheduling retry"
    );
    Action::requeue(retry_delay(error))
}
