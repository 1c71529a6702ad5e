//! Copy-trigger handshake driven through a restic source with Clone copies

mod common;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use tokio_test::assert_ok;

use common::Harness;
use volsync_operator::config::OperatorConfig;
use volsync_operator::crd::{
    CopyMethod, MoverResult as JobResult, ReplicationSource, ReplicationSourceResticSpec,
    ReplicationSourceSpec, ReplicationSourceStatus, SourceVolumeOptions,
};
use volsync_operator::movers::restic::ResticMover;
use volsync_operator::movers::{Mover, OwnerStatus};
use volsync_operator::volumehandler::copy_trigger::{
    COPY_TRIGGER_ANNOTATION, LATEST_COPY_STATUS_ANNOTATION, LATEST_COPY_TRIGGER_ANNOTATION,
    PENDING_COPY_TRIGGER_ANNOTATION, USE_COPY_TRIGGER_ANNOTATION, WAITING_SINCE_ANNOTATION,
};

const CLONE: &str = "volsync-db-src";

fn clone_source() -> ReplicationSource {
    common::source(
        "db",
        ReplicationSourceSpec {
            source_pvc: "data".to_string(),
            restic: Some(ReplicationSourceResticSpec {
                repository: "restic-config".to_string(),
                volume: SourceVolumeOptions {
                    copy_method: CopyMethod::Clone,
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        },
    )
}

fn mover(h: &Harness, source: &ReplicationSource) -> ResticMover {
    let spec = source.spec.restic.clone().unwrap();
    ResticMover::for_source(&h.env(), source, &spec, "quay.io/backube/volsync:test", false)
}

async fn annotate(h: &Harness, name: &str, annotations: &[(&str, &str)]) {
    let mut pvc = h.pvc(name).await.unwrap();
    let existing = pvc.annotations_mut();
    for (k, v) in annotations {
        existing.insert(k.to_string(), v.to_string());
    }
    h.client.replace(&pvc).await.unwrap();
}

async fn source_annotations(h: &Harness) -> BTreeMap<String, String> {
    h.pvc("data").await.unwrap().annotations().clone()
}

async fn setup(config: OperatorConfig) -> Harness {
    let h = Harness::with_config(config);
    h.bound_pvc("data", "5Gi").await;
    h.restic_repository("restic-config").await;
    annotate(&h, "data", &[(USE_COPY_TRIGGER_ANNOTATION, "true")]).await;
    h
}

#[tokio::test]
async fn clone_waits_for_a_trigger() {
    let h = setup(OperatorConfig::default()).await;
    let source = clone_source();
    let mover = mover(&h, &source);
    let mut status = ReplicationSourceStatus::default();

    for _ in 0..2 {
        let result = assert_ok!(mover.synchronize(&mut OwnerStatus::Source(&mut status)).await);
        assert!(!result.completed);
    }
    assert!(h.pvc(CLONE).await.is_none());
    assert_eq!(h.store.count("Job"), 0);

    let annotations = source_annotations(&h).await;
    assert_eq!(
        annotations.get(LATEST_COPY_STATUS_ANNOTATION).map(String::as_str),
        Some("WaitingForTrigger")
    );
    assert!(annotations.contains_key(WAITING_SINCE_ANNOTATION));
}

#[tokio::test]
async fn new_trigger_takes_one_clone_and_completes_once_bound() {
    let h = setup(OperatorConfig::default()).await;
    let source = clone_source();
    let mover = mover(&h, &source);
    let mut status = ReplicationSourceStatus::default();

    assert_ok!(mover.synchronize(&mut OwnerStatus::Source(&mut status)).await);
    annotate(&h, "data", &[(COPY_TRIGGER_ANNOTATION, "quiesced-1")]).await;

    assert_ok!(mover.synchronize(&mut OwnerStatus::Source(&mut status)).await);
    assert_ok!(mover.synchronize(&mut OwnerStatus::Source(&mut status)).await);
    let clone = h.pvc(CLONE).await.unwrap();
    let data_source = clone.spec.as_ref().and_then(|s| s.data_source.clone()).unwrap();
    assert_eq!(data_source.kind, "PersistentVolumeClaim");
    assert_eq!(data_source.name, "data");
    // source, clone and cache
    assert_eq!(h.store.count("PersistentVolumeClaim"), 3);
    assert_eq!(h.store.count("Job"), 1);

    let annotations = source_annotations(&h).await;
    assert_eq!(
        annotations.get(LATEST_COPY_STATUS_ANNOTATION).map(String::as_str),
        Some("InProgress")
    );
    assert!(!annotations.contains_key(LATEST_COPY_TRIGGER_ANNOTATION));

    let mut clone: PersistentVolumeClaim = clone;
    h.bind_pvc(&mut clone).await;
    assert_ok!(mover.synchronize(&mut OwnerStatus::Source(&mut status)).await);

    let annotations = source_annotations(&h).await;
    assert_eq!(
        annotations.get(LATEST_COPY_STATUS_ANNOTATION).map(String::as_str),
        Some("Completed")
    );
    assert_eq!(
        annotations.get(LATEST_COPY_TRIGGER_ANNOTATION).map(String::as_str),
        Some("quiesced-1")
    );
    assert!(!annotations.contains_key(WAITING_SINCE_ANNOTATION));
}

#[tokio::test]
async fn clone_is_removed_by_cleanup_and_the_next_copy_waits_again() {
    let h = setup(OperatorConfig::default()).await;
    let source = clone_source();
    let mover = mover(&h, &source);
    let mut status = ReplicationSourceStatus::default();

    assert_ok!(mover.synchronize(&mut OwnerStatus::Source(&mut status)).await);
    annotate(&h, "data", &[(COPY_TRIGGER_ANNOTATION, "quiesced-1")]).await;
    assert_ok!(mover.synchronize(&mut OwnerStatus::Source(&mut status)).await);
    let mut clone = h.pvc(CLONE).await.unwrap();
    h.bind_pvc(&mut clone).await;
    h.set_job_status(&mover.job_name(), 1, 0).await;
    let result = assert_ok!(mover.synchronize(&mut OwnerStatus::Source(&mut status)).await);
    assert!(result.completed);

    assert_ok!(mover.cleanup(&mut OwnerStatus::Source(&mut status)).await);
    assert!(h.pvc(CLONE).await.is_none());
    assert_eq!(h.store.count("Job"), 0);

    // same trigger value: the next synchronization waits for a new one
    let result = assert_ok!(mover.synchronize(&mut OwnerStatus::Source(&mut status)).await);
    assert!(!result.completed);
    assert!(h.pvc(CLONE).await.is_none());
    assert_eq!(
        source_annotations(&h)
            .await
            .get(LATEST_COPY_STATUS_ANNOTATION)
            .map(String::as_str),
        Some("WaitingForTrigger")
    );
}

async fn annotation(h: &Harness, key: &str) -> Option<String> {
    source_annotations(h).await.get(key).cloned()
}

#[tokio::test]
async fn trigger_bumped_during_a_copy_gets_its_own_clone() {
    let h = setup(OperatorConfig::default()).await;
    let source = clone_source();
    let mover = mover(&h, &source);
    let mut status = ReplicationSourceStatus::default();

    annotate(&h, "data", &[(COPY_TRIGGER_ANNOTATION, "t1")]).await;
    assert_ok!(mover.synchronize(&mut OwnerStatus::Source(&mut status)).await);
    let mut clone = h.pvc(CLONE).await.unwrap();
    let first_uid = clone.uid();
    h.bind_pvc(&mut clone).await;
    assert_ok!(mover.synchronize(&mut OwnerStatus::Source(&mut status)).await);
    assert_eq!(annotation(&h, LATEST_COPY_TRIGGER_ANNOTATION).await.as_deref(), Some("t1"));

    // the application is quiesced again while the backup is still running
    annotate(&h, "data", &[(COPY_TRIGGER_ANNOTATION, "t2")]).await;
    let result = assert_ok!(mover.synchronize(&mut OwnerStatus::Source(&mut status)).await);
    assert!(!result.completed);
    assert_eq!(annotation(&h, LATEST_COPY_TRIGGER_ANNOTATION).await.as_deref(), Some("t1"));
    assert_eq!(
        annotation(&h, LATEST_COPY_STATUS_ANNOTATION).await.as_deref(),
        Some("Completed")
    );
    assert_eq!(h.pvc(CLONE).await.unwrap().uid(), first_uid);

    h.set_job_status(&mover.job_name(), 1, 0).await;
    let result = assert_ok!(mover.synchronize(&mut OwnerStatus::Source(&mut status)).await);
    assert!(result.completed);
    assert_ok!(mover.cleanup(&mut OwnerStatus::Source(&mut status)).await);
    assert!(h.pvc(CLONE).await.is_none());

    // the next cycle takes a copy for t2 without waiting
    assert_ok!(mover.synchronize(&mut OwnerStatus::Source(&mut status)).await);
    let mut clone = h.pvc(CLONE).await.unwrap();
    assert_ne!(clone.uid(), first_uid);
    assert_eq!(
        annotation(&h, LATEST_COPY_STATUS_ANNOTATION).await.as_deref(),
        Some("InProgress")
    );
    assert_eq!(
        annotation(&h, PENDING_COPY_TRIGGER_ANNOTATION).await.as_deref(),
        Some("t2")
    );

    h.bind_pvc(&mut clone).await;
    assert_ok!(mover.synchronize(&mut OwnerStatus::Source(&mut status)).await);
    assert_eq!(annotation(&h, LATEST_COPY_TRIGGER_ANNOTATION).await.as_deref(), Some("t2"));
}

#[tokio::test]
async fn waiting_past_the_timeout_is_recorded_as_failed() {
    let h = setup(OperatorConfig {
        copy_trigger_timeout_secs: 0,
        ..Default::default()
    })
    .await;
    let source = clone_source();
    let mover = mover(&h, &source);
    let mut status = ReplicationSourceStatus::default();

    let result = assert_ok!(mover.synchronize(&mut OwnerStatus::Source(&mut status)).await);
    assert!(!result.completed);
    let latest = status.sync.latest_mover_status.clone().unwrap();
    assert_eq!(latest.result, JobResult::Failed);
    assert!(latest.logs.contains("data"));
    assert_eq!(
        source_annotations(&h)
            .await
            .get(LATEST_COPY_STATUS_ANNOTATION)
            .map(String::as_str),
        Some("Failed")
    );
    assert!(h.pvc(CLONE).await.is_none());
}
