//! Copy-trigger handshake on the source PVC
//!
//! An external actor quiesces the application, bumps `copy-trigger`, and
//! waits for `latest-copy-status` to reach `Completed` before resuming. The
//! operator only takes a clone or snapshot of the source when the trigger
//! differs from the last one it satisfied.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

pub const USE_COPY_TRIGGER_ANNOTATION: &str = "volsync.backube/use-copy-trigger";
pub const COPY_TRIGGER_ANNOTATION: &str = "volsync.backube/copy-trigger";
pub const LATEST_COPY_TRIGGER_ANNOTATION: &str = "volsync.backube/latest-copy-trigger";
pub const LATEST_COPY_STATUS_ANNOTATION: &str = "volsync.backube/latest-copy-status";
pub const WAITING_SINCE_ANNOTATION: &str = "volsync.backube/latest-copy-trigger-waiting-since";
/// Trigger value the in-flight copy was taken for
pub const PENDING_COPY_TRIGGER_ANNOTATION: &str = "volsync.backube/pending-copy-trigger";

/// Value of the `latest-copy-status` annotation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyStatus {
    WaitingForTrigger,
    InProgress,
    Completed,
    Failed,
}

impl CopyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStatus::WaitingForTrigger => "WaitingForTrigger",
            CopyStatus::InProgress => "InProgress",
            CopyStatus::Completed => "Completed",
            CopyStatus::Failed => "Failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "WaitingForTrigger" => Some(CopyStatus::WaitingForTrigger),
            "InProgress" => Some(CopyStatus::InProgress),
            "Completed" => Some(CopyStatus::Completed),
            "Failed" => Some(CopyStatus::Failed),
            _ => None,
        }
    }
}

/// What the caller may do about the pending clone or snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateDecision {
    /// Take the copy now
    Proceed,
    /// Keep waiting for a new trigger value
    Wait,
    /// Waited longer than the configured timeout
    TimedOut,
}

/// The handshake only runs when the PVC opts in
pub fn copy_trigger_enabled(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(USE_COPY_TRIGGER_ANNOTATION)
        .is_some_and(|v| v == "true")
}

pub fn copy_status(annotations: &BTreeMap<String, String>) -> Option<CopyStatus> {
    annotations
        .get(LATEST_COPY_STATUS_ANNOTATION)
        .and_then(|v| CopyStatus::parse(v))
}

fn set_status(annotations: &mut BTreeMap<String, String>, status: CopyStatus) {
    annotations.insert(
        LATEST_COPY_STATUS_ANNOTATION.to_string(),
        status.as_str().to_string(),
    );
}

/// Advance the handshake for a copy that does not exist yet
///
/// `annotations` are updated in place; the caller persists them when they
/// changed.
pub fn evaluate_gate(
    annotations: &mut BTreeMap<String, String>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> GateDecision {
    match copy_status(annotations) {
        Some(CopyStatus::InProgress) => return GateDecision::Proceed,
        None | Some(CopyStatus::Completed) => {
            set_status(annotations, CopyStatus::WaitingForTrigger);
            annotations.insert(WAITING_SINCE_ANNOTATION.to_string(), now.to_rfc3339());
        }
        Some(CopyStatus::WaitingForTrigger) | Some(CopyStatus::Failed) => {}
    }

    let trigger = annotations.get(COPY_TRIGGER_ANNOTATION);
    let latest = annotations.get(LATEST_COPY_TRIGGER_ANNOTATION);
    if let Some(trigger) = trigger.filter(|t| Some(*t) != latest).cloned() {
        set_status(annotations, CopyStatus::InProgress);
        annotations.remove(WAITING_SINCE_ANNOTATION);
        annotations.insert(PENDING_COPY_TRIGGER_ANNOTATION.to_string(), trigger);
        return GateDecision::Proceed;
    }

    let since = annotations
        .get(WAITING_SINCE_ANNOTATION)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc));
    let Some(since) = since else {
        annotations.insert(WAITING_SINCE_ANNOTATION.to_string(), now.to_rfc3339());
        return GateDecision::Wait;
    };
    if now - since >= timeout {
        set_status(annotations, CopyStatus::Failed);
        return GateDecision::TimedOut;
    }
    GateDecision::Wait
}

/// Record that the copy is bound; the trigger it was taken for becomes the watermark
///
/// A copy is completed once. Trigger values set while it is still in use are
/// left for the next cycle.
pub fn mark_completed(annotations: &mut BTreeMap<String, String>) {
    if copy_status(annotations) == Some(CopyStatus::Completed) {
        return;
    }
    set_status(annotations, CopyStatus::Completed);
    annotations.remove(WAITING_SINCE_ANNOTATION);
    let fired = annotations
        .remove(PENDING_COPY_TRIGGER_ANNOTATION)
        .or_else(|| annotations.get(COPY_TRIGGER_ANNOTATION).cloned());
    if let Some(trigger) = fired {
        annotations.insert(LATEST_COPY_TRIGGER_ANNOTATION.to_string(), trigger);
    }
}
