//! One restic synchronization: data PVC, cache PVC, ServiceAccount,
//! repository validation, then the mover Job

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, EnvVar, KeyToPath, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Secret, SecretVolumeSource, ServiceAccount, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::retention::{generate_forget_options, should_prune, should_unlock};
use super::{
    log_filter, GOOGLE_CREDENTIALS_KEY, MOVER_NAME, OPTIONAL_REPOSITORY_KEYS,
    REQUIRED_REPOSITORY_KEYS,
};
use crate::adapters::{
    actions, get_and_validate_secret, reasons, secret_has_key, EventPublisher, ResourceClient,
};
use crate::config::OperatorConfig;
use crate::crd::{
    CustomCaSpec, MoverConfig, MoverResult as JobResult, ReplicationDestination,
    ReplicationDestinationResticSpec, ReplicationSource, ReplicationSourceResticSpec,
    ResticRetainPolicy, ResticSourceStatus,
};
use crate::error::Result;
use crate::movers::job::{
    apply_mover_config, container_args, container_mut, container_security_context, env_var,
    pod_spec_mut, record_copy_trigger_timeout, secret_env, set_template_labels,
};
use crate::movers::service_account::ensure_service_account;
use crate::movers::{Mover, MoverEnv, MoverResult, OwnerStatus};
use crate::ready_or;
use crate::resources::job_status::{backoff_limit, failed, record_mover_status, succeeded};
use crate::resources::{
    bounded_name, cleanup_objects, create_or_replace, create_or_update, is_new, mark_for_cleanup,
    mover_pod_labels, set_owned_by, EnsureOutcome, Owner, Readiness, NAME_PREFIX,
};
use crate::volumehandler::{pvc_capacity, VolumeHandler};

const CONTAINER_NAME: &str = "restic";
const ENTRYPOINT: &str = "/mover-restic/entry.sh";
const BACKOFF_LIMIT: i32 = 8;
const DATA_MOUNT: &str = "/data";
const CACHE_MOUNT: &str = "/cache";
const CUSTOM_CA_MOUNT: &str = "/customCA";
const CREDENTIALS_MOUNT: &str = "/credentials";
const DEFAULT_CACHE_CAPACITY: &str = "1Gi";

/// Settings that only apply to backups
#[derive(Clone, Debug)]
struct SourceSettings {
    source_pvc: String,
    retain: Option<ResticRetainPolicy>,
    prune_interval_days: Option<i32>,
    unlock: Option<String>,
}

/// Settings that only apply to restores
#[derive(Clone, Debug)]
struct DestinationSettings {
    destination_pvc: Option<String>,
    restore_as_of: Option<String>,
    previous: Option<i32>,
    enable_file_deletion: bool,
}

#[derive(Clone, Debug)]
enum Direction {
    Source(SourceSettings),
    Destination(DestinationSettings),
}

impl Direction {
    fn suffix(&self) -> &'static str {
        match self {
            Direction::Source(_) => "src",
            Direction::Destination(_) => "dst",
        }
    }
}

/// Restic mover bound to one ReplicationSource or ReplicationDestination
pub struct ResticMover {
    client: ResourceClient,
    events: Arc<dyn EventPublisher>,
    config: Arc<OperatorConfig>,
    owner: Owner,
    image: String,
    privileged: bool,
    paused: bool,
    repository: String,
    custom_ca: Option<CustomCaSpec>,
    mover_config: MoverConfig,
    cache_capacity: Option<Quantity>,
    cache_storage_class_name: Option<String>,
    cache_access_modes: Vec<String>,
    volume_handler: VolumeHandler,
    direction: Direction,
}

impl ResticMover {
    pub fn for_source(
        env: &MoverEnv,
        source: &ReplicationSource,
        spec: &ReplicationSourceResticSpec,
        image: &str,
        privileged: bool,
    ) -> Self {
        let owner = Owner::from_resource(source);
        Self {
            client: env.client.clone(),
            events: env.events.clone(),
            config: env.config.clone(),
            image: image.to_string(),
            privileged,
            paused: source.spec.paused,
            repository: spec.repository.clone(),
            custom_ca: spec.custom_ca.clone(),
            mover_config: spec.mover.clone(),
            cache_capacity: spec.cache_capacity.clone(),
            cache_storage_class_name: spec.cache_storage_class_name.clone(),
            cache_access_modes: spec.cache_access_modes.clone(),
            volume_handler: VolumeHandler::for_source(
                env.client.clone(),
                env.events.clone(),
                owner.clone(),
                &spec.volume,
                env.config.copy_trigger_timeout(),
            ),
            direction: Direction::Source(SourceSettings {
                source_pvc: source.spec.source_pvc.clone(),
                retain: spec.retain.clone(),
                prune_interval_days: spec.prune_interval_days,
                unlock: spec.unlock.clone(),
            }),
            owner,
        }
    }

    pub fn for_destination(
        env: &MoverEnv,
        destination: &ReplicationDestination,
        spec: &ReplicationDestinationResticSpec,
        image: &str,
        privileged: bool,
    ) -> Self {
        let owner = Owner::from_resource(destination);
        Self {
            client: env.client.clone(),
            events: env.events.clone(),
            config: env.config.clone(),
            image: image.to_string(),
            privileged,
            paused: destination.spec.paused,
            repository: spec.repository.clone(),
            custom_ca: spec.custom_ca.clone(),
            mover_config: spec.mover.clone(),
            cache_capacity: spec.cache_capacity.clone(),
            cache_storage_class_name: spec.cache_storage_class_name.clone(),
            cache_access_modes: spec.cache_access_modes.clone(),
            volume_handler: VolumeHandler::for_destination(
                env.client.clone(),
                env.events.clone(),
                owner.clone(),
                &spec.volume,
            ),
            direction: Direction::Destination(DestinationSettings {
                destination_pvc: spec.volume.destination_pvc.clone(),
                restore_as_of: spec.restore_as_of.clone(),
                previous: spec.previous,
                enable_file_deletion: spec.enable_file_deletion,
            }),
            owner,
        }
    }

    fn is_source(&self) -> bool {
        matches!(self.direction, Direction::Source(_))
    }

    /// Name of the Job, and of the ServiceAccount it runs as
    pub fn job_name(&self) -> String {
        bounded_name(
            &format!("{}{}-", NAME_PREFIX, self.direction.suffix()),
            &self.owner,
            "",
        )
    }

    fn data_pvc_name(&self) -> String {
        match &self.direction {
            Direction::Destination(DestinationSettings {
                destination_pvc: Some(name),
                ..
            }) => name.clone(),
            _ => bounded_name(NAME_PREFIX, &self.owner, &format!("-{}", self.direction.suffix())),
        }
    }

    fn cache_pvc_name(&self) -> String {
        bounded_name(
            NAME_PREFIX,
            &self.owner,
            &format!("-{}-cache", self.direction.suffix()),
        )
    }

    async fn ensure_data_pvc(&self) -> Result<Readiness<PersistentVolumeClaim>> {
        match &self.direction {
            Direction::Source(settings) => {
                let src = self
                    .client
                    .get_required::<PersistentVolumeClaim>(&self.owner.namespace, &settings.source_pvc)
                    .await?;
                self.volume_handler
                    .ensure_pvc_from_src(&src, &self.data_pvc_name(), true)
                    .await
            }
            Direction::Destination(settings) => match &settings.destination_pvc {
                Some(name) => self.volume_handler.use_provided_pvc(name).await,
                None => self.volume_handler.ensure_new_pvc(&self.data_pvc_name(), false).await,
            },
        }
    }

    /// Persistent restic cache, configured from the cache options, then the
    /// volume options, then the data PVC
    async fn ensure_cache(
        &self,
        data_pvc: &PersistentVolumeClaim,
    ) -> Result<Readiness<PersistentVolumeClaim>> {
        let data_spec = data_pvc.spec.clone().unwrap_or_default();
        let access_modes = if !self.cache_access_modes.is_empty() {
            self.cache_access_modes.clone()
        } else if !self.volume_handler.access_modes().is_empty() {
            self.volume_handler.access_modes().to_vec()
        } else {
            data_spec.access_modes.clone().unwrap_or_default()
        };
        let storage_class_name = self
            .cache_storage_class_name
            .clone()
            .or_else(|| self.volume_handler.storage_class_name().map(str::to_string))
            .or_else(|| data_spec.storage_class_name.clone());
        let capacity = self
            .cache_capacity
            .clone()
            .or_else(|| self.volume_handler.capacity().cloned())
            .or_else(|| pvc_capacity(data_pvc))
            .unwrap_or_else(|| Quantity(DEFAULT_CACHE_CAPACITY.to_string()));

        let (pvc, outcome) = create_or_update::<PersistentVolumeClaim, _>(
            &self.client,
            &self.owner.namespace,
            &self.cache_pvc_name(),
            |pvc| {
                set_owned_by(&mut pvc.metadata, &self.owner);
                if is_new(pvc) {
                    pvc.spec = Some(PersistentVolumeClaimSpec {
                        access_modes: Some(access_modes),
                        storage_class_name,
                        resources: Some(VolumeResourceRequirements {
                            requests: Some(BTreeMap::from([("storage".to_string(), capacity)])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    });
                }
                Ok(())
            },
        )
        .await?;
        if outcome == EnsureOutcome::Created {
            debug!(pvc = %pvc.name_any(), "Created restic cache");
        }
        Ok(Readiness::Ready(pvc))
    }

    /// The repository Secret, checked for the keys restic needs
    pub async fn validate_repository(&self) -> Result<Secret> {
        get_and_validate_secret(
            &self.client,
            &self.repository,
            &self.owner.namespace,
            &REQUIRED_REPOSITORY_KEYS,
        )
        .await
    }

    async fn validate_custom_ca(&self) -> Result<Option<CustomCaSpec>> {
        let Some(ca) = self.custom_ca.as_ref().filter(|ca| !ca.secret_name.is_empty()) else {
            return Ok(None);
        };
        get_and_validate_secret(
            &self.client,
            &ca.secret_name,
            &self.owner.namespace,
            &[ca.key.as_str()],
        )
        .await?;
        Ok(Some(ca.clone()))
    }

    /// Verbs passed to the entrypoint for a new Job
    fn job_actions(&self, restic_status: Option<&ResticSourceStatus>) -> Vec<String> {
        match &self.direction {
            Direction::Destination(_) => vec!["restore".to_string()],
            Direction::Source(settings) => {
                let mut verbs = Vec::new();
                if should_unlock(
                    settings.unlock.as_deref(),
                    restic_status.and_then(|s| s.last_unlocked.as_deref()),
                ) {
                    verbs.push("unlock".to_string());
                }
                verbs.push("backup".to_string());
                if should_prune(
                    settings.prune_interval_days,
                    restic_status.and_then(|s| s.last_pruned),
                    self.owner.creation_timestamp,
                    Utc::now(),
                ) {
                    verbs.push("prune".to_string());
                }
                verbs
            }
        }
    }

    fn job_env(&self, repository: &Secret, custom_ca: Option<&CustomCaSpec>) -> Vec<EnvVar> {
        let mut env = Vec::new();
        if let Direction::Source(settings) = &self.direction {
            env.push(env_var("FORGET_OPTIONS", generate_forget_options(settings.retain.as_ref())));
        }
        env.push(env_var("DATA_DIR", DATA_MOUNT));
        env.push(env_var("RESTIC_CACHE_DIR", CACHE_MOUNT));
        if let Direction::Destination(settings) = &self.direction {
            if let Some(as_of) = &settings.restore_as_of {
                env.push(env_var("RESTORE_AS_OF", as_of.clone()));
            }
            if let Some(previous) = settings.previous {
                env.push(env_var("SELECT_PREVIOUS", previous.to_string()));
            }
            if settings.enable_file_deletion {
                env.push(env_var("ENABLE_FILE_DELETION", "true"));
            }
        }
        for key in REQUIRED_REPOSITORY_KEYS {
            env.push(secret_env(&self.repository, key, false));
        }
        for key in OPTIONAL_REPOSITORY_KEYS {
            env.push(secret_env(&self.repository, key, true));
        }
        if secret_has_key(repository, GOOGLE_CREDENTIALS_KEY) {
            env.push(env_var(
                GOOGLE_CREDENTIALS_KEY,
                format!("{}/{}", CREDENTIALS_MOUNT, GOOGLE_CREDENTIALS_KEY),
            ));
        }
        if let Some(ca) = custom_ca {
            env.push(env_var("CUSTOM_CA", format!("{}/{}", CUSTOM_CA_MOUNT, ca.key)));
        }
        for (name, value) in self.config.proxy_env() {
            env.push(env_var(&name, value));
        }
        if self.owner.debug_enabled() {
            env.push(env_var("DEBUG_MOVER", "1"));
        }
        if !self.privileged {
            env.push(env_var("PRIVILEGED_MOVER", "0"));
        }
        env
    }

    fn job_volumes(
        &self,
        data_pvc: &PersistentVolumeClaim,
        cache_pvc: &PersistentVolumeClaim,
        repository: &Secret,
        custom_ca: Option<&CustomCaSpec>,
    ) -> (Vec<Volume>, Vec<VolumeMount>) {
        let mut volumes = vec![
            Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: data_pvc.name_any(),
                    read_only: Some(self.is_source()),
                }),
                ..Default::default()
            },
            Volume {
                name: "cache".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: cache_pvc.name_any(),
                    read_only: Some(false),
                }),
                ..Default::default()
            },
            Volume {
                name: "tempdir".to_string(),
                empty_dir: Some(EmptyDirVolumeSource {
                    medium: Some("Memory".to_string()),
                    size_limit: None,
                }),
                ..Default::default()
            },
        ];
        let mut mounts = vec![
            VolumeMount {
                name: "data".to_string(),
                mount_path: DATA_MOUNT.to_string(),
                read_only: Some(self.is_source()),
                ..Default::default()
            },
            VolumeMount {
                name: "cache".to_string(),
                mount_path: CACHE_MOUNT.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "tempdir".to_string(),
                mount_path: "/tmp".to_string(),
                ..Default::default()
            },
        ];

        if secret_has_key(repository, GOOGLE_CREDENTIALS_KEY) {
            volumes.push(Volume {
                name: "gcs-credentials".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(self.repository.clone()),
                    items: Some(vec![KeyToPath {
                        key: GOOGLE_CREDENTIALS_KEY.to_string(),
                        path: GOOGLE_CREDENTIALS_KEY.to_string(),
                        mode: None,
                    }]),
                    default_mode: Some(0o600),
                    optional: None,
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: "gcs-credentials".to_string(),
                mount_path: CREDENTIALS_MOUNT.to_string(),
                ..Default::default()
            });
        }
        if let Some(ca) = custom_ca {
            volumes.push(Volume {
                name: "custom-ca".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(ca.secret_name.clone()),
                    items: Some(vec![KeyToPath {
                        key: ca.key.clone(),
                        path: ca.key.clone(),
                        mode: None,
                    }]),
                    default_mode: Some(0o600),
                    optional: None,
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: "custom-ca".to_string(),
                mount_path: CUSTOM_CA_MOUNT.to_string(),
                ..Default::default()
            });
        }
        (volumes, mounts)
    }

    /// Ensure the mover Job and report whether it has succeeded
    ///
    /// A Job that used up its retries is recorded as failed and deleted; the
    /// next pass starts a fresh one.
    async fn ensure_job(
        &self,
        data_pvc: &PersistentVolumeClaim,
        cache_pvc: &PersistentVolumeClaim,
        sa: &ServiceAccount,
        repository: &Secret,
        custom_ca: Option<&CustomCaSpec>,
        status: &mut OwnerStatus<'_>,
    ) -> Result<Readiness<Job>> {
        let job_name = self.job_name();
        let restic_status = status.source_mut().and_then(|s| s.restic.clone());
        let verbs = self.job_actions(restic_status.as_ref());
        let env = self.job_env(repository, custom_ca);
        let (volumes, mounts) = self.job_volumes(data_pvc, cache_pvc, repository, custom_ca);
        let labels = mover_pod_labels(&self.owner, self.direction.suffix());

        let (job, outcome) = create_or_replace::<Job, _>(
            &self.client,
            &self.owner.namespace,
            &job_name,
            |job| {
                mark_for_cleanup(&mut job.metadata, &self.owner);
                set_owned_by(&mut job.metadata, &self.owner);
                // verbs are fixed at creation
                let new = is_new(job);
                {
                    let spec = job.spec.get_or_insert_with(Default::default);
                    spec.backoff_limit = Some(BACKOFF_LIMIT);
                    spec.parallelism = Some(if self.paused { 0 } else { 1 });
                }
                set_template_labels(job, &labels);

                let pod = pod_spec_mut(job);
                pod.restart_policy = Some("Never".to_string());
                pod.service_account_name = Some(sa.name_any());
                pod.volumes = Some(volumes);
                apply_mover_config(pod, CONTAINER_NAME, &self.mover_config);

                let container = container_mut(pod, CONTAINER_NAME);
                container.image = Some(self.image.clone());
                container.image_pull_policy = Some("Always".to_string());
                container.command = Some(vec![ENTRYPOINT.to_string()]);
                if new {
                    container.args = Some(verbs);
                }
                container.env = Some(env);
                container.volume_mounts = Some(mounts);
                container.security_context = Some(container_security_context(self.privileged));
                Ok(())
            },
        )
        .await?;

        if outcome == EnsureOutcome::Created {
            info!(job = %job_name, namespace = %self.owner.namespace, args = ?container_args(&job), "Started restic job");
            self.events
                .publish(
                    &self.owner.object_reference(),
                    EventType::Normal,
                    reasons::TRANSFER_STARTED,
                    actions::CREATE_JOB,
                    Some(format!("mover Job {} created", job_name)),
                )
                .await;
        }

        if failed(&job) >= backoff_limit(&job) {
            warn!(job = %job_name, "Restic job exhausted its retries, deleting");
            record_mover_status(
                &self.client,
                &job,
                status.sync_mut(),
                JobResult::Failed,
                log_filter,
            )
            .await;
            self.events
                .publish(
                    &self.owner.object_reference(),
                    EventType::Warning,
                    reasons::TRANSFER_FAILED,
                    actions::DELETE_JOB,
                    Some(format!("mover Job {} backoff limit reached", job_name)),
                )
                .await;
            self.client
                .delete::<Job>(&self.owner.namespace, &job_name)
                .await?;
            return Ok(Readiness::Pending);
        }

        if succeeded(&job) == 0 {
            debug!(job = %job_name, "Waiting for restic job to complete");
            return Ok(Readiness::Pending);
        }

        info!(job = %job_name, "Restic job completed");
        record_mover_status(
            &self.client,
            &job,
            status.sync_mut(),
            JobResult::Successful,
            log_filter,
        )
        .await;
        if let (Direction::Source(settings), Some(source_status)) =
            (&self.direction, status.source_mut())
        {
            let ran = container_args(&job);
            let restic_status = source_status.restic.get_or_insert_with(Default::default);
            if ran.iter().any(|a| a == "prune") {
                restic_status.last_pruned = Some(Utc::now());
            }
            if ran.iter().any(|a| a == "unlock") {
                restic_status.last_unlocked = settings.unlock.clone();
            }
        }
        Ok(Readiness::Ready(job))
    }

    async fn run(&self, status: &mut OwnerStatus<'_>) -> Result<MoverResult> {
        let data_pvc = ready_or!(self.ensure_data_pvc().await?, MoverResult::in_progress());
        let cache_pvc = ready_or!(self.ensure_cache(&data_pvc).await?, MoverResult::in_progress());
        let sa = ready_or!(
            ensure_service_account(
                &self.client,
                &self.owner,
                &self.job_name(),
                self.privileged,
                self.mover_config.mover_service_account.as_deref(),
            )
            .await?,
            MoverResult::in_progress()
        );
        let repository = self.validate_repository().await?;
        let custom_ca = self.validate_custom_ca().await?;
        ready_or!(
            self.ensure_job(
                &data_pvc,
                &cache_pvc,
                &sa,
                &repository,
                custom_ca.as_ref(),
                status
            )
            .await?,
            MoverResult::in_progress()
        );

        if self.is_source() {
            return Ok(MoverResult::complete());
        }
        let image = ready_or!(
            self.volume_handler.ensure_image(&data_pvc).await?,
            MoverResult::in_progress()
        );
        Ok(MoverResult::complete_with_image(image))
    }
}

#[async_trait]
impl Mover for ResticMover {
    fn name(&self) -> &str {
        MOVER_NAME
    }

    async fn synchronize(&self, status: &mut OwnerStatus<'_>) -> Result<MoverResult> {
        let result = self.run(status).await;
        match result {
            Err(e) if e.is_copy_trigger_timeout() => {
                Ok(record_copy_trigger_timeout(self.events.as_ref(), &self.owner, status, &e).await)
            }
            other => other,
        }
    }

    async fn cleanup(&self, _status: &mut OwnerStatus<'_>) -> Result<MoverResult> {
        debug!(name = %self.owner.name, "Cleaning up restic objects");
        if !self.is_source() {
            self.volume_handler
                .remove_snapshot_annotation_from_pvc(&self.data_pvc_name())
                .await?;
        }
        cleanup_objects(&self.client, &self.owner).await?;
        Ok(MoverResult::complete())
    }
}
