//! Fixtures shared by the integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, Secret,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;

use volsync_operator::adapters::{MemoryObjectStore, NoopEventPublisher, ResourceClient};
use volsync_operator::config::OperatorConfig;
use volsync_operator::crd::{
    ReplicationDestination, ReplicationDestinationSpec, ReplicationSource, ReplicationSourceSpec,
};
use volsync_operator::movers::MoverEnv;

pub const NAMESPACE: &str = "app";

pub struct Harness {
    pub store: Arc<MemoryObjectStore>,
    pub client: ResourceClient,
    pub config: Arc<OperatorConfig>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OperatorConfig::default())
    }

    pub fn with_config(config: OperatorConfig) -> Self {
        let store = Arc::new(MemoryObjectStore::new());
        Self {
            client: ResourceClient::new(store.clone()),
            store,
            config: Arc::new(config),
        }
    }

    pub fn env(&self) -> MoverEnv {
        MoverEnv {
            client: self.client.clone(),
            events: Arc::new(NoopEventPublisher),
            config: self.config.clone(),
        }
    }

    /// A user PVC, already bound
    pub async fn bound_pvc(&self, name: &str, capacity: &str) -> PersistentVolumeClaim {
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: Some("standard".to_string()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(capacity.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        };
        let mut created = self.client.create(&pvc).await.unwrap();
        self.bind_pvc(&mut created).await;
        created
    }

    pub async fn bind_pvc(&self, pvc: &mut PersistentVolumeClaim) {
        pvc.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            ..Default::default()
        });
        self.client.apply_status(pvc).await.unwrap();
    }

    pub async fn secret(&self, name: &str, data: &[(&str, &str)]) -> Secret {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };
        self.client.create(&secret).await.unwrap()
    }

    pub async fn restic_repository(&self, name: &str) -> Secret {
        self.secret(
            name,
            &[
                ("RESTIC_REPOSITORY", "s3:http://minio/bucket"),
                ("RESTIC_PASSWORD", "hunter2"),
                ("AWS_ACCESS_KEY_ID", "access"),
                ("AWS_SECRET_ACCESS_KEY", "secret"),
            ],
        )
        .await
    }

    pub async fn job(&self, name: &str) -> Option<Job> {
        self.client.get::<Job>(NAMESPACE, name).await.unwrap()
    }

    pub async fn set_job_status(&self, name: &str, succeeded: i32, failed: i32) {
        let mut job = self.job(name).await.expect("job exists");
        job.status = Some(JobStatus {
            succeeded: Some(succeeded),
            failed: Some(failed),
            ..Default::default()
        });
        self.client.apply_status(&job).await.unwrap();
    }

    pub async fn pvc(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.client
            .get::<PersistentVolumeClaim>(NAMESPACE, name)
            .await
            .unwrap()
    }

    /// Store a ReplicationSource so its status can be written back
    pub async fn store_source(&self, source: &ReplicationSource) -> ReplicationSource {
        self.client.create(source).await.unwrap()
    }

    pub async fn store_destination(
        &self,
        destination: &ReplicationDestination,
    ) -> ReplicationDestination {
        self.client.create(destination).await.unwrap()
    }
}

fn meta(name: &str, created: DateTime<Utc>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        uid: Some(format!("uid-{}", name)),
        creation_timestamp: Some(Time(created)),
        ..Default::default()
    }
}

pub fn source(name: &str, spec: ReplicationSourceSpec) -> ReplicationSource {
    source_created_at(name, spec, Utc::now())
}

pub fn source_created_at(
    name: &str,
    spec: ReplicationSourceSpec,
    created: DateTime<Utc>,
) -> ReplicationSource {
    let mut source = ReplicationSource::new(name, spec);
    source.metadata = meta(name, created);
    source
}

pub fn destination(name: &str, spec: ReplicationDestinationSpec) -> ReplicationDestination {
    let mut destination = ReplicationDestination::new(name, spec);
    destination.metadata = meta(name, Utc::now());
    destination
}

pub fn container_args(job: &Job) -> Vec<String> {
    volsync_operator::movers::job::container_args(job)
}

pub fn env_value(job: &Job, name: &str) -> Option<String> {
    job.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.clone())
}
