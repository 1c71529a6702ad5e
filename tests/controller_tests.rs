//! Full reconcile passes against the in-memory store

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::Role;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use tokio_test::{assert_err, assert_ok};

use common::{env_value, Harness, NAMESPACE};
use volsync_operator::adapters::NoopEventPublisher;
use volsync_operator::config::OperatorConfig;
use volsync_operator::controllers::{reconcile_destination, reconcile_source, Context};
use volsync_operator::crd::{
    find_condition, reasons, DestinationVolumeOptions, ExternalSpec, ReplicationDestination,
    ReplicationDestinationResticSpec, ReplicationDestinationSpec, ReplicationSource,
    ReplicationSourceResticSpec, ReplicationSourceRsyncTlsSpec, ReplicationSourceSpec,
    TriggerSpec, CONDITION_SYNCHRONIZING,
};
use volsync_operator::movers::Catalog;
use volsync_operator::resources::PRIVILEGED_MOVERS_ANNOTATION;
use volsync_operator::statemachine::Requeue;
use volsync_operator::Error;

fn context(h: &Harness) -> Context {
    Context::new(
        h.client.clone(),
        Arc::new(NoopEventPublisher),
        h.config.clone(),
        Arc::new(Catalog::from_config(&h.config)),
    )
}

fn manual(tag: &str) -> Option<TriggerSpec> {
    Some(TriggerSpec {
        manual: Some(tag.to_string()),
        ..Default::default()
    })
}

fn restic_source_spec() -> ReplicationSourceSpec {
    ReplicationSourceSpec {
        source_pvc: "data".to_string(),
        trigger: manual("once"),
        restic: Some(ReplicationSourceResticSpec {
            repository: "restic-config".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn stored_source(h: &Harness, name: &str) -> ReplicationSource {
    h.client
        .get::<ReplicationSource>(NAMESPACE, name)
        .await
        .unwrap()
        .unwrap()
}

async fn stored_destination(h: &Harness, name: &str) -> ReplicationDestination {
    h.client
        .get::<ReplicationDestination>(NAMESPACE, name)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn source_backup_runs_to_completion() {
    let h = Harness::new();
    h.bound_pvc("data", "1Gi").await;
    h.restic_repository("restic-config").await;
    let ctx = context(&h);
    h.store_source(&common::source("app-backup", restic_source_spec()))
        .await;

    let source = stored_source(&h, "app-backup").await;
    let requeue = assert_ok!(reconcile_source(&source, &ctx).await);
    assert_eq!(requeue, Requeue::After(Duration::from_secs(30)));

    let source = stored_source(&h, "app-backup").await;
    let status = source.status.clone().unwrap();
    let condition = find_condition(&status.sync.conditions, CONDITION_SYNCHRONIZING).unwrap();
    assert_eq!(condition.status, "True");
    assert!(status.sync.last_sync_start_time.is_some());
    assert_eq!(h.store.count("Job"), 1);

    h.set_job_status("volsync-src-app-backup", 1, 0).await;
    let requeue = assert_ok!(reconcile_source(&source, &ctx).await);
    assert_eq!(requeue, Requeue::AwaitChange);

    let status = stored_source(&h, "app-backup").await.status.unwrap();
    assert_eq!(status.sync.last_manual_sync.as_deref(), Some("once"));
    assert!(status.sync.last_sync_time.is_some());
    assert!(status.sync.latest_mover_status.is_some());
    let condition = find_condition(&status.sync.conditions, CONDITION_SYNCHRONIZING).unwrap();
    assert_eq!(condition.reason, reasons::WAITING_FOR_MANUAL);
    assert_eq!(h.store.count("Job"), 0);
}

#[tokio::test]
async fn source_without_a_mover_reports_an_error() {
    let h = Harness::new();
    let ctx = context(&h);
    let source = h
        .store_source(&common::source(
            "nothing",
            ReplicationSourceSpec {
                source_pvc: "data".to_string(),
                ..Default::default()
            },
        ))
        .await;

    let err = assert_err!(reconcile_source(&source, &ctx).await);
    assert!(matches!(err, Error::NoMoverFound { .. }));

    let status = stored_source(&h, "nothing").await.status.unwrap();
    let condition = find_condition(&status.sync.conditions, CONDITION_SYNCHRONIZING).unwrap();
    assert_eq!(condition.status, "False");
    assert_eq!(condition.reason, reasons::ERROR);
    assert!(condition.message.contains("restic"));
    assert!(condition.message.contains("rsync-tls"));
}

#[tokio::test]
async fn source_with_two_movers_is_rejected() {
    let h = Harness::new();
    let ctx = context(&h);
    let mut spec = restic_source_spec();
    spec.rsync_tls = Some(ReplicationSourceRsyncTlsSpec::default());
    let source = h.store_source(&common::source("both", spec)).await;

    let err = assert_err!(reconcile_source(&source, &ctx).await);
    assert!(matches!(err, Error::MultipleMoversFound { .. }));
    assert_eq!(h.store.count("Job"), 0);
}

#[tokio::test]
async fn disabled_mover_is_not_found() {
    let h = Harness::with_config(OperatorConfig {
        enabled_movers: vec!["rsync-tls".to_string()],
        ..Default::default()
    });
    let ctx = context(&h);
    let source = h
        .store_source(&common::source("restic-only", restic_source_spec()))
        .await;

    let err = assert_err!(reconcile_source(&source, &ctx).await);
    match err {
        Error::NoMoverFound { enabled } => assert_eq!(enabled, vec!["rsync-tls"]),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn external_source_is_left_alone() {
    let h = Harness::new();
    let ctx = context(&h);
    let source = h
        .store_source(&common::source(
            "external",
            ReplicationSourceSpec {
                source_pvc: "data".to_string(),
                external: Some(ExternalSpec {
                    provider: "example.com/mover".to_string(),
                    parameters: BTreeMap::new(),
                }),
                ..Default::default()
            },
        ))
        .await;

    let requeue = assert_ok!(reconcile_source(&source, &ctx).await);
    assert_eq!(requeue, Requeue::AwaitChange);
    assert!(stored_source(&h, "external").await.status.is_none());
}

#[tokio::test]
async fn deleted_source_is_not_reconciled() {
    let h = Harness::new();
    let ctx = context(&h);
    let mut source = common::source("going", restic_source_spec());
    source.metadata.deletion_timestamp = Some(Time(Utc::now()));

    let requeue = assert_ok!(reconcile_source(&source, &ctx).await);
    assert_eq!(requeue, Requeue::AwaitChange);
    assert_eq!(h.store.count("Job"), 0);
}

#[tokio::test]
async fn privileged_namespace_runs_privileged_movers() {
    let h = Harness::new();
    h.bound_pvc("data", "1Gi").await;
    h.restic_repository("restic-config").await;
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(NAMESPACE.to_string()),
            annotations: Some(BTreeMap::from([(
                PRIVILEGED_MOVERS_ANNOTATION.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    };
    h.client.create(&namespace).await.unwrap();
    let ctx = context(&h);
    let source = h
        .store_source(&common::source("priv", restic_source_spec()))
        .await;

    assert_ok!(reconcile_source(&source, &ctx).await);
    let job = h.job("volsync-src-priv").await.unwrap();
    assert!(env_value(&job, "PRIVILEGED_MOVER").is_none());
    assert_eq!(h.store.count("Role"), 1);
    assert!(h
        .client
        .get::<Role>(NAMESPACE, "volsync-src-priv")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn destination_restore_publishes_latest_image() {
    let h = Harness::new();
    h.restic_repository("restic-config").await;
    let ctx = context(&h);
    h.store_destination(&common::destination(
        "restore",
        ReplicationDestinationSpec {
            trigger: manual("once"),
            restic: Some(ReplicationDestinationResticSpec {
                repository: "restic-config".to_string(),
                volume: DestinationVolumeOptions {
                    access_modes: vec!["ReadWriteOnce".to_string()],
                    capacity: Some(Quantity("2Gi".to_string())),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        },
    ))
    .await;

    let destination = stored_destination(&h, "restore").await;
    assert_ok!(reconcile_destination(&destination, &ctx).await);
    h.set_job_status("volsync-dst-restore", 1, 0).await;

    let destination = stored_destination(&h, "restore").await;
    let requeue = assert_ok!(reconcile_destination(&destination, &ctx).await);
    assert_eq!(requeue, Requeue::AwaitChange);

    let status = stored_destination(&h, "restore").await.status.unwrap();
    let image = status.latest_image.unwrap();
    assert_eq!(image.kind, "PersistentVolumeClaim");
    assert_eq!(image.name, "volsync-restore-dst");
    // the provisioned volume outlives the synchronization
    assert!(h.pvc("volsync-restore-dst").await.is_some());
}

#[tokio::test]
async fn invalid_schedule_is_reported_on_the_destination() {
    let h = Harness::new();
    let ctx = context(&h);
    let destination = h
        .store_destination(&common::destination(
            "badcron",
            ReplicationDestinationSpec {
                trigger: Some(TriggerSpec {
                    schedule: Some("61 * * * *".to_string()),
                    ..Default::default()
                }),
                restic: Some(ReplicationDestinationResticSpec {
                    repository: "restic-config".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ))
        .await;

    let err = assert_err!(reconcile_destination(&destination, &ctx).await);
    assert!(matches!(err, Error::InvalidSchedule { .. }));
    let status = stored_destination(&h, "badcron").await.status.unwrap();
    let condition = find_condition(&status.sync.conditions, CONDITION_SYNCHRONIZING).unwrap();
    assert_eq!(condition.reason, reasons::ERROR);
    assert_eq!(h.store.count("Job"), 0);
}
