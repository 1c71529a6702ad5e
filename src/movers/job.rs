//! Pieces of mover Jobs shared by every backend

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, PodSpec, SecretKeySelector, SecurityContext,
};
use kube::runtime::events::EventType;
use tracing::warn;

use super::{MoverResult, OwnerStatus};
use crate::adapters::{actions, reasons, EventPublisher};
use crate::crd::{MoverConfig, MoverResult as JobResult, MoverStatus};
use crate::error::Error;
use crate::resources::Owner;

pub fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

/// Environment variable read from `key` of Secret `secret`
pub fn secret_env(secret: &str, key: &str, optional: bool) -> EnvVar {
    EnvVar {
        name: key.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(optional),
            }),
            ..Default::default()
        }),
    }
}

/// Container security context for mover containers
///
/// Unprivileged movers drop every capability and run with a read-only root
/// filesystem; privileged movers run as root with the capabilities needed to
/// preserve ownership and permissions of the replicated files.
pub fn container_security_context(privileged: bool) -> SecurityContext {
    if privileged {
        SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(
                    ["DAC_OVERRIDE", "CHOWN", "FOWNER", "SETGID", "SETUID", "MKNOD", "AUDIT_WRITE"]
                        .iter()
                        .map(|c| c.to_string())
                        .collect(),
                ),
                drop: Some(vec!["ALL".to_string()]),
            }),
            privileged: Some(false),
            read_only_root_filesystem: Some(true),
            run_as_user: Some(0),
            ..Default::default()
        }
    } else {
        SecurityContext {
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                add: None,
                drop: Some(vec!["ALL".to_string()]),
            }),
            privileged: Some(false),
            read_only_root_filesystem: Some(true),
            ..Default::default()
        }
    }
}

/// The pod spec of `job`, created on first use
pub fn pod_spec_mut(job: &mut Job) -> &mut PodSpec {
    job.spec
        .get_or_insert_with(JobSpec::default)
        .template
        .spec
        .get_or_insert_with(PodSpec::default)
}

/// The container called `name`, created on first use
///
/// Fields are set one by one on the returned container so that values
/// defaulted by the API server are kept.
pub fn container_mut<'a>(pod: &'a mut PodSpec, name: &str) -> &'a mut Container {
    let index = match pod.containers.iter().position(|c| c.name == name) {
        Some(index) => index,
        None => {
            pod.containers.push(Container {
                name: name.to_string(),
                ..Default::default()
            });
            pod.containers.len() - 1
        }
    };
    &mut pod.containers[index]
}

/// Apply the user's pod overrides
pub fn apply_mover_config(pod: &mut PodSpec, container_name: &str, config: &MoverConfig) {
    pod.security_context = Some(config.mover_security_context.clone().unwrap_or_default());
    pod.affinity = config.mover_affinity.clone();
    let container = container_mut(pod, container_name);
    container.resources = Some(config.mover_resources.clone().unwrap_or_default());
}

/// Add `labels` to the pod template without dropping labels set by the Job controller
pub fn set_template_labels(job: &mut Job, labels: &BTreeMap<String, String>) {
    let meta = job
        .spec
        .get_or_insert_with(JobSpec::default)
        .template
        .metadata
        .get_or_insert_with(Default::default);
    let existing = meta.labels.get_or_insert_with(BTreeMap::new);
    for (k, v) in labels {
        existing.insert(k.clone(), v.clone());
    }
}

/// Arguments of the first container of a Job
pub fn container_args(job: &Job) -> Vec<String> {
    job.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.args.clone())
        .unwrap_or_default()
}

/// Record a copy-trigger timeout as a failed mover run and keep polling
pub async fn record_copy_trigger_timeout(
    events: &dyn EventPublisher,
    owner: &Owner,
    status: &mut OwnerStatus<'_>,
    err: &Error,
) -> MoverResult {
    warn!(name = %owner.name, namespace = %owner.namespace, error = %err, "Copy-trigger timeout");
    status.sync_mut().latest_mover_status = Some(MoverStatus {
        result: JobResult::Failed,
        logs: err.to_string(),
    });
    events
        .publish(
            &owner.object_reference(),
            EventType::Warning,
            reasons::COPY_TRIGGER_TIMEOUT,
            actions::WAIT_FOR_TRIGGER,
            Some(err.to_string()),
        )
        .await;
    MoverResult::in_progress()
}
