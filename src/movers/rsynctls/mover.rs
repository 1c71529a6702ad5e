use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ContainerPort, EmptyDirVolumeSource, PersistentVolumeClaim,
    PersistentVolumeClaimVolumeSource, Secret, SecretVolumeSource, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::{log_filter, DEFAULT_PORT, MOVER_NAME, PSK_KEY};
use crate::adapters::{actions, get_and_validate_secret, reasons, EventPublisher, ResourceClient};
use crate::config::OperatorConfig;
use crate::crd::{
    MoverConfig, MoverResult as JobResult, ReplicationDestination,
    ReplicationDestinationRsyncTlsSpec, ReplicationSource, ReplicationSourceRsyncTlsSpec,
    RsyncTlsDestinationStatus,
};
use crate::error::{Error, Result};
use crate::movers::job::{
    apply_mover_config, container_mut, container_security_context, env_var, pod_spec_mut,
    record_copy_trigger_timeout, set_template_labels,
};
use crate::movers::service_account::ensure_service_account;
use crate::movers::{Mover, MoverEnv, MoverResult, OwnerStatus};
use crate::ready_or;
use crate::resources::job_status::{backoff_limit, failed, record_mover_status, succeeded};
use crate::resources::{
    bounded_name, cleanup_objects, create_or_replace, create_or_update, mark_for_cleanup,
    mover_pod_labels, set_owned_by, EnsureOutcome, Owner, Readiness, NAME_PREFIX,
};
use crate::volumehandler::VolumeHandler;

const CONTAINER_NAME: &str = "rsync-tls";
const PORT_NAME: &str = "rsync-tls";
const BACKOFF_LIMIT: i32 = 2;
const DATA_MOUNT: &str = "/data";
const KEYS_MOUNT: &str = "/keys";

#[derive(Clone, Debug)]
enum Direction {
    Source {
        source_pvc: String,
        address: Option<String>,
        port: Option<i32>,
        key_secret: Option<String>,
    },
    Destination {
        destination_pvc: Option<String>,
        key_secret: Option<String>,
        service_type: Option<String>,
        service_annotations: BTreeMap<String, String>,
    },
}

impl Direction {
    fn suffix(&self) -> &'static str {
        match self {
            Direction::Source { .. } => "src",
            Direction::Destination { .. } => "dst",
        }
    }

    fn script(&self) -> &'static str {
        match self {
            Direction::Source { .. } => "/mover-rsync-tls/client.sh",
            Direction::Destination { .. } => "/mover-rsync-tls/server.sh",
        }
    }
}

/// Rsync-TLS mover bound to one ReplicationSource or ReplicationDestination
pub struct RsyncTlsMover {
    client: ResourceClient,
    events: Arc<dyn EventPublisher>,
    config: Arc<OperatorConfig>,
    owner: Owner,
    image: String,
    privileged: bool,
    paused: bool,
    mover_config: MoverConfig,
    volume_handler: VolumeHandler,
    direction: Direction,
}

impl RsyncTlsMover {
    pub fn for_source(
        env: &MoverEnv,
        source: &ReplicationSource,
        spec: &ReplicationSourceRsyncTlsSpec,
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
            mover_config: spec.mover.clone(),
            volume_handler: VolumeHandler::for_source(
                env.client.clone(),
                env.events.clone(),
                owner.clone(),
                &spec.volume,
                env.config.copy_trigger_timeout(),
            ),
            direction: Direction::Source {
                source_pvc: source.spec.source_pvc.clone(),
                address: spec.address.clone(),
                port: spec.port,
                key_secret: spec.key_secret.clone(),
            },
            owner,
        }
    }

    pub fn for_destination(
        env: &MoverEnv,
        destination: &ReplicationDestination,
        spec: &ReplicationDestinationRsyncTlsSpec,
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
            mover_config: spec.mover.clone(),
            volume_handler: VolumeHandler::for_destination(
                env.client.clone(),
                env.events.clone(),
                owner.clone(),
                &spec.volume,
            ),
            direction: Direction::Destination {
                destination_pvc: spec.volume.destination_pvc.clone(),
                key_secret: spec.key_secret.clone(),
                service_type: spec.service_type.clone(),
                service_annotations: spec.service_annotations.clone(),
            },
            owner,
        }
    }

    fn name_with(&self, suffix: &str) -> String {
        bounded_name(&format!("{}rsync-tls-", NAME_PREFIX), &self.owner, suffix)
    }

    /// Name of the Job, and of the ServiceAccount it runs as
    pub fn job_name(&self) -> String {
        bounded_name(
            &format!("{}rsync-tls-{}-", NAME_PREFIX, self.direction.suffix()),
            &self.owner,
            "",
        )
    }

    pub fn service_name(&self) -> String {
        self.job_name()
    }

    fn data_pvc_name(&self) -> String {
        match &self.direction {
            Direction::Destination {
                destination_pvc: Some(name),
                ..
            } => name.clone(),
            _ => bounded_name(NAME_PREFIX, &self.owner, &format!("-{}", self.direction.suffix())),
        }
    }

    fn pod_labels(&self) -> BTreeMap<String, String> {
        mover_pod_labels(&self.owner, &format!("rsync-tls-{}", self.direction.suffix()))
    }

    async fn ensure_data_pvc(&self) -> Result<Readiness<PersistentVolumeClaim>> {
        match &self.direction {
            Direction::Source { source_pvc, .. } => {
                let src = self
                    .client
                    .get_required::<PersistentVolumeClaim>(&self.owner.namespace, source_pvc)
                    .await?;
                self.volume_handler
                    .ensure_pvc_from_src(&src, &self.data_pvc_name(), true)
                    .await
            }
            Direction::Destination {
                destination_pvc, ..
            } => match destination_pvc {
                Some(name) => self.volume_handler.use_provided_pvc(name).await,
                None => self.volume_handler.ensure_new_pvc(&self.data_pvc_name(), false).await,
            },
        }
    }

    /// Name of the Secret holding the pre-shared key, generating one if needed
    async fn ensure_key_secret(&self) -> Result<String> {
        let (provided, generated_name) = match &self.direction {
            Direction::Source { key_secret, .. } => (
                Some(key_secret.clone().ok_or_else(|| {
                    Error::validation("rsyncTLS keySecret must be specified for a source")
                })?),
                None,
            ),
            Direction::Destination { key_secret, .. } => {
                (key_secret.clone(), Some(self.name_with("")))
            }
        };

        if let Some(name) = provided {
            get_and_validate_secret(&self.client, &name, &self.owner.namespace, &[PSK_KEY])
                .await?;
            return Ok(name);
        }

        let name = generated_name.unwrap_or_default();
        let (_, outcome) = create_or_update::<Secret, _>(
            &self.client,
            &self.owner.namespace,
            &name,
            |secret| {
                set_owned_by(&mut secret.metadata, &self.owner);
                let data = secret.data.get_or_insert_with(BTreeMap::new);
                if !data.contains_key(PSK_KEY) {
                    data.insert(PSK_KEY.to_string(), ByteString(generate_psk().into_bytes()));
                }
                Ok(())
            },
        )
        .await?;
        if outcome == EnsureOutcome::Created {
            info!(secret = %name, "Generated rsync-tls pre-shared key");
        }
        Ok(name)
    }

    /// Service in front of the destination Pod and the address it was given
    async fn ensure_service(&self) -> Result<Readiness<String>> {
        let Direction::Destination {
            service_type,
            service_annotations,
            ..
        } = &self.direction
        else {
            return Ok(Readiness::Pending);
        };
        let selector = self.pod_labels();
        let (service, _) = create_or_update::<Service, _>(
            &self.client,
            &self.owner.namespace,
            &self.service_name(),
            |svc| {
                set_owned_by(&mut svc.metadata, &self.owner);
                let annotations = svc.annotations_mut();
                for (k, v) in service_annotations {
                    annotations.insert(k.clone(), v.clone());
                }
                let spec = svc.spec.get_or_insert_with(ServiceSpec::default);
                spec.type_ = Some(service_type.clone().unwrap_or_else(|| "ClusterIP".to_string()));
                spec.selector = Some(selector);
                let ports = spec.ports.get_or_insert_with(Vec::new);
                match ports.iter_mut().find(|p| p.name.as_deref() == Some(PORT_NAME)) {
                    Some(port) => {
                        port.port = DEFAULT_PORT;
                        port.target_port = Some(IntOrString::String(PORT_NAME.to_string()));
                        port.protocol = Some("TCP".to_string());
                    }
                    None => ports.push(ServicePort {
                        name: Some(PORT_NAME.to_string()),
                        port: DEFAULT_PORT,
                        target_port: Some(IntOrString::String(PORT_NAME.to_string())),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }),
                }
                Ok(())
            },
        )
        .await?;

        match service_address(&service) {
            Some(address) => Ok(Readiness::Ready(address)),
            None => {
                debug!(service = %service.name_any(), "Waiting for service address");
                Ok(Readiness::Pending)
            }
        }
    }

    /// Record where sources should connect
    async fn publish_address(&self, status: &mut OwnerStatus<'_>, address: &str, key_secret: &str) {
        let Some(dest) = status.destination_mut() else {
            return;
        };
        let published = RsyncTlsDestinationStatus {
            address: Some(address.to_string()),
            port: Some(DEFAULT_PORT),
            key_secret: Some(key_secret.to_string()),
        };
        if dest.rsync_tls.as_ref() == Some(&published) {
            return;
        }
        dest.rsync_tls = Some(published);
        info!(name = %self.owner.name, address, "Destination address assigned");
        self.events
            .publish(
                &self.owner.object_reference(),
                EventType::Normal,
                reasons::SERVICE_ADDRESS_ASSIGNED,
                actions::PUBLISH_ADDRESS,
                Some(format!("listening on {}:{}", address, DEFAULT_PORT)),
            )
            .await;
    }

    async fn ensure_job(
        &self,
        data_pvc: &PersistentVolumeClaim,
        sa_name: &str,
        key_secret: &str,
        status: &mut OwnerStatus<'_>,
    ) -> Result<Readiness<Job>> {
        let job_name = self.job_name();
        let is_source = matches!(self.direction, Direction::Source { .. });

        let mut env = Vec::new();
        if let Direction::Source { address, port, .. } = &self.direction {
            let address = address.clone().ok_or_else(|| {
                Error::validation("rsyncTLS address must be specified for a source")
            })?;
            env.push(env_var("DESTINATION_ADDRESS", address));
            env.push(env_var(
                "DESTINATION_PORT",
                port.unwrap_or(DEFAULT_PORT).to_string(),
            ));
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

        let volumes = vec![
            Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: data_pvc.name_any(),
                    read_only: Some(is_source),
                }),
                ..Default::default()
            },
            Volume {
                name: "keys".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(key_secret.to_string()),
                    default_mode: Some(0o600),
                    ..Default::default()
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
        let mounts = vec![
            VolumeMount {
                name: "data".to_string(),
                mount_path: DATA_MOUNT.to_string(),
                read_only: Some(is_source),
                ..Default::default()
            },
            VolumeMount {
                name: "keys".to_string(),
                mount_path: KEYS_MOUNT.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "tempdir".to_string(),
                mount_path: "/tmp".to_string(),
                ..Default::default()
            },
        ];
        let labels = self.pod_labels();
        let script = self.direction.script();

        let (job, outcome) = create_or_replace::<Job, _>(
            &self.client,
            &self.owner.namespace,
            &job_name,
            |job| {
                mark_for_cleanup(&mut job.metadata, &self.owner);
                set_owned_by(&mut job.metadata, &self.owner);
                {
                    let spec = job.spec.get_or_insert_with(Default::default);
                    spec.backoff_limit = Some(BACKOFF_LIMIT);
                    spec.parallelism = Some(if self.paused { 0 } else { 1 });
                }
                set_template_labels(job, &labels);

                let pod = pod_spec_mut(job);
                pod.restart_policy = Some("Never".to_string());
                pod.service_account_name = Some(sa_name.to_string());
                pod.volumes = Some(volumes);
                apply_mover_config(pod, CONTAINER_NAME, &self.mover_config);

                let container = container_mut(pod, CONTAINER_NAME);
                container.image = Some(self.image.clone());
                container.image_pull_policy = Some("Always".to_string());
                container.command = Some(vec![
                    "/bin/bash".to_string(),
                    "-c".to_string(),
                    script.to_string(),
                ]);
                container.env = Some(env);
                container.volume_mounts = Some(mounts);
                container.security_context = Some(container_security_context(self.privileged));
                if !is_source {
                    container.ports = Some(vec![ContainerPort {
                        name: Some(PORT_NAME.to_string()),
                        container_port: DEFAULT_PORT,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]);
                }
                Ok(())
            },
        )
        .await?;

        if outcome == EnsureOutcome::Created {
            info!(job = %job_name, namespace = %self.owner.namespace, "Started rsync-tls job");
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
            warn!(job = %job_name, "Rsync-tls job exhausted its retries, deleting");
            record_mover_status(&self.client, &job, status.sync_mut(), JobResult::Failed, log_filter)
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
            return Ok(Readiness::Pending);
        }
        record_mover_status(
            &self.client,
            &job,
            status.sync_mut(),
            JobResult::Successful,
            log_filter,
        )
        .await;
        Ok(Readiness::Ready(job))
    }

    async fn run(&self, status: &mut OwnerStatus<'_>) -> Result<MoverResult> {
        let data_pvc = ready_or!(self.ensure_data_pvc().await?, MoverResult::in_progress());
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
        let key_secret = self.ensure_key_secret().await?;

        if let Direction::Destination { .. } = self.direction {
            let address = ready_or!(self.ensure_service().await?, MoverResult::in_progress());
            self.publish_address(status, &address, &key_secret).await;
        }

        ready_or!(
            self.ensure_job(&data_pvc, &sa.name_any(), &key_secret, status)
                .await?,
            MoverResult::in_progress()
        );

        match self.direction {
            Direction::Source { .. } => Ok(MoverResult::complete()),
            Direction::Destination { .. } => {
                let image = ready_or!(
                    self.volume_handler.ensure_image(&data_pvc).await?,
                    MoverResult::in_progress()
                );
                Ok(MoverResult::complete_with_image(image))
            }
        }
    }
}

/// Address a Service is reachable at: the load balancer ingress for
/// LoadBalancer Services, the cluster IP otherwise
pub fn service_address(service: &Service) -> Option<String> {
    let spec = service.spec.as_ref()?;
    if spec.type_.as_deref() == Some("LoadBalancer") {
        let ingress = service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .and_then(|i| i.first())?;
        return ingress
            .hostname
            .clone()
            .filter(|h| !h.is_empty())
            .or_else(|| ingress.ip.clone().filter(|ip| !ip.is_empty()));
    }
    spec.cluster_ip
        .clone()
        .filter(|ip| !ip.is_empty() && ip != "None")
}

/// A fresh pre-shared key in the `identity:key` form stunnel expects
pub fn generate_psk() -> String {
    format!(
        "volsync:{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

#[async_trait]
impl Mover for RsyncTlsMover {
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
        if let Direction::Destination { .. } = self.direction {
            self.volume_handler
                .remove_snapshot_annotation_from_pvc(&self.data_pvc_name())
                .await?;
        }
        cleanup_objects(&self.client, &self.owner).await?;
        Ok(MoverResult::complete())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};

    use super::*;

    #[test]
    fn test_psk_format() {
        let psk = generate_psk();
        assert!(psk.starts_with("volsync:"));
        assert_eq!(psk.len(), "volsync:".len() + 64);
        assert_ne!(psk, generate_psk());
    }

    #[test]
    fn test_cluster_ip_address() {
        let svc = Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.0.0.7".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(service_address(&svc).as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn test_load_balancer_prefers_hostname() {
        let mut svc = Service {
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".into()),
                cluster_ip: Some("10.0.0.7".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(service_address(&svc), None);

        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    hostname: Some("lb.example.com".into()),
                    ip: Some("203.0.113.9".into()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        assert_eq!(service_address(&svc).as_deref(), Some("lb.example.com"));
    }
}
