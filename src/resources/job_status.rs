//! Mover Job outcome and log capture

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::warn;

use crate::adapters::ResourceClient;
use crate::crd::{MoverResult, MoverStatus, SyncStatus};

/// Selects the log lines worth keeping in `latestMoverStatus`
pub type LogFilter = fn(&str) -> bool;

/// Label the Job controller puts on its Pods
const JOB_NAME_LABEL: &str = "job-name";

pub fn succeeded(job: &Job) -> i32 {
    job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0)
}

pub fn failed(job: &Job) -> i32 {
    job.status.as_ref().and_then(|s| s.failed).unwrap_or(0)
}

pub fn backoff_limit(job: &Job) -> i32 {
    job.spec.as_ref().and_then(|s| s.backoff_limit).unwrap_or(6)
}

/// Keep only the lines accepted by `filter`
pub fn filter_logs(logs: &str, filter: LogFilter) -> String {
    logs.lines()
        .map(str::trim_end)
        .filter(|line| filter(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Tail of the most recent Pod of `job`, preferring Pods in `phase`
async fn latest_pod_logs(client: &ResourceClient, job: &Job, phase: &str) -> Option<String> {
    let namespace = job.namespace().unwrap_or_default();
    let selector = BTreeMap::from([(JOB_NAME_LABEL.to_string(), job.name_any())]);
    let pods: Vec<Pod> = match client.list(&namespace, &selector).await {
        Ok(pods) => pods,
        Err(e) => {
            warn!(job = %job.name_any(), error = %e, "Unable to list mover pods");
            return None;
        }
    };

    let in_phase = |p: &&Pod| {
        p.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|ph| ph == phase)
    };
    let newest = |candidates: Vec<&Pod>| {
        candidates
            .into_iter()
            .max_by_key(|p| p.metadata.creation_timestamp.clone().map(|t| t.0))
            .map(|p| p.name_any())
    };
    let pod = newest(pods.iter().filter(in_phase).collect())
        .or_else(|| newest(pods.iter().collect()))?;

    match client.pod_logs(&namespace, &pod).await {
        Ok(logs) => Some(logs),
        Err(e) => {
            warn!(pod = %pod, error = %e, "Unable to read mover logs");
            None
        }
    }
}

/// Record the Job's result and filtered log tail in `status.latestMoverStatus`
pub async fn record_mover_status(
    client: &ResourceClient,
    job: &Job,
    status: &mut SyncStatus,
    result: MoverResult,
    filter: LogFilter,
) {
    let phase = match result {
        MoverResult::Successful => "Succeeded",
        MoverResult::Failed => "Failed",
    };
    let logs = latest_pod_logs(client, job, phase)
        .await
        .map(|l| filter_logs(&l, filter))
        .unwrap_or_default();
    status.latest_mover_status = Some(MoverStatus { result, logs });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn only_errors(line: &str) -> bool {
        line.contains("ERROR")
    }

    #[test]
    fn test_filter_logs_keeps_matching_lines() {
        let logs = "starting\nERROR one\nok\nERROR two  \n";
        assert_eq!(filter_logs(logs, only_errors), "ERROR one\nERROR two");
    }

    #[test]
    fn test_job_counters_default_to_zero() {
        let job = Job::default();
        assert_eq!(succeeded(&job), 0);
        assert_eq!(failed(&job), 0);
        assert_eq!(backoff_limit(&job), 6);
    }
}
