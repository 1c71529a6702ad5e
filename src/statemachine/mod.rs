//! Replication state machine
//!
//! Drives every mover identically. The machine is idle until a trigger fires
//! (cron schedule, changed manual tag, or immediately when neither is set),
//! then calls `synchronize` on each pass until the mover reports completion,
//! then `cleanup`, then goes idle again. The `Synchronizing` condition is the
//! only persisted state:
//!
//! | condition             | state          |
//! |-----------------------|----------------|
//! | absent                | idle (due)     |
//! | True                  | synchronizing  |
//! | False / CleaningUp    | cleaning up    |
//! | False / Error         | synchronizing  |
//! | False / WaitingFor*   | idle           |

mod destination;
mod source;

pub use destination::DestinationMachine;
pub use source::SourceMachine;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::{debug, info, warn};

use crate::crd::{
    find_condition, reasons, set_condition, SyncStatus, TriggerSpec, CONDITION_SYNCHRONIZING,
};
use crate::error::{Error, Result};
use crate::metrics::SyncMetrics;
use crate::movers::MoverResult;

/// A CR kind plus its mover, as seen by [`run`]
#[async_trait]
pub trait ReplicationMachine: Send {
    fn trigger(&self) -> Option<&TriggerSpec>;

    fn status(&self) -> &SyncStatus;

    fn status_mut(&mut self) -> &mut SyncStatus;

    fn metrics(&self) -> &SyncMetrics;

    async fn synchronize(&mut self) -> Result<MoverResult>;

    async fn cleanup(&mut self) -> Result<MoverResult>;

    /// Cron schedule, ignored when a manual tag is set
    fn cronspec(&self) -> Option<&str> {
        self.trigger()
            .and_then(|t| t.schedule.as_deref())
            .filter(|s| !s.trim().is_empty())
    }

    fn manual_tag(&self) -> Option<&str> {
        self.trigger()
            .and_then(|t| t.manual.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// When the controller should look at the CR again
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    After(Duration),
    /// Nothing happens until the CR changes
    AwaitChange,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Synchronizing,
    CleaningUp,
}

fn current_state(status: &SyncStatus) -> State {
    match find_condition(&status.conditions, CONDITION_SYNCHRONIZING) {
        None => State::Idle,
        Some(c) if c.status == "True" => State::Synchronizing,
        Some(c) if c.reason == reasons::CLEANING_UP => State::CleaningUp,
        Some(c) if c.reason == reasons::ERROR => State::Synchronizing,
        Some(_) => State::Idle,
    }
}

/// Parse a trigger schedule; standard 5-field specs get a leading seconds field
pub fn parse_schedule(spec: &str) -> Result<Schedule> {
    let trimmed = spec.trim();
    let expr = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&expr).map_err(|e| Error::InvalidSchedule {
        schedule: spec.to_string(),
        reason: e.to_string(),
    })
}

/// First fire time strictly after `after`
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

fn is_fire_time(schedule: &Schedule, t: DateTime<Utc>) -> bool {
    next_fire(schedule, t - chrono::Duration::seconds(1)) == Some(t)
}

/// Advance the machine by one reconcile pass
///
/// Status changes are made in place; the caller persists them whether or not
/// an error is returned.
pub async fn run<M: ReplicationMachine + ?Sized>(
    machine: &mut M,
    now: DateTime<Utc>,
    poll_interval: Duration,
) -> Result<Requeue> {
    let outcome = step(machine, now, poll_interval).await;
    if let Err(e) = &outcome {
        warn!(error = %e, "Synchronization failed");
        set_condition(
            &mut machine.status_mut().conditions,
            CONDITION_SYNCHRONIZING,
            false,
            reasons::ERROR,
            e.to_string(),
        );
        machine.metrics().set_out_of_sync(true);
    }
    outcome
}

async fn step<M: ReplicationMachine + ?Sized>(
    machine: &mut M,
    now: DateTime<Utc>,
    poll_interval: Duration,
) -> Result<Requeue> {
    // validate the schedule before anything else touches the cluster
    let schedule = machine.cronspec().map(parse_schedule).transpose()?;

    match current_state(machine.status()) {
        State::Idle => {
            if machine.manual_tag().is_none() {
                if let Some(schedule) = schedule.as_ref() {
                    reschedule_if_changed(machine.status_mut(), schedule, now);
                }
            }
            if !is_due(machine, schedule.as_ref(), now) {
                return Ok(wait_for_trigger(machine, schedule.as_ref(), now));
            }
            start_sync(machine, now);
            synchronize(machine, schedule.as_ref(), now, poll_interval).await
        }
        State::Synchronizing => synchronize(machine, schedule.as_ref(), now, poll_interval).await,
        State::CleaningUp => cleanup(machine, schedule.as_ref(), now, poll_interval).await,
    }
}

/// A stored fire time the schedule no longer produces was computed from an
/// edited schedule; replace it with the next fire of the current one
fn reschedule_if_changed(status: &mut SyncStatus, schedule: &Schedule, now: DateTime<Utc>) {
    if let Some(next) = status.next_sync_time {
        if !is_fire_time(schedule, next) {
            debug!(previous = %next, "Schedule changed, recomputing next sync time");
            status.next_sync_time = next_fire(schedule, now);
        }
    }
}

fn is_due<M: ReplicationMachine + ?Sized>(
    machine: &M,
    schedule: Option<&Schedule>,
    now: DateTime<Utc>,
) -> bool {
    if let Some(tag) = machine.manual_tag() {
        return machine.status().last_manual_sync.as_deref() != Some(tag);
    }
    if schedule.is_some() {
        return machine.status().next_sync_time.map_or(true, |next| now >= next);
    }
    true
}

fn start_sync<M: ReplicationMachine + ?Sized>(machine: &mut M, now: DateTime<Utc>) {
    info!("Starting synchronization");
    let status = machine.status_mut();
    status.last_sync_start_time = Some(now);
    set_condition(
        &mut status.conditions,
        CONDITION_SYNCHRONIZING,
        true,
        reasons::SYNC_IN_PROGRESS,
        "Synchronization in-progress",
    );
}

async fn synchronize<M: ReplicationMachine + ?Sized>(
    machine: &mut M,
    schedule: Option<&Schedule>,
    now: DateTime<Utc>,
    poll_interval: Duration,
) -> Result<Requeue> {
    if machine.status().last_sync_start_time.is_none() {
        machine.status_mut().last_sync_start_time = Some(now);
    }

    let result = machine.synchronize().await?;
    if !result.completed {
        let status = machine.status_mut();
        if find_condition(&status.conditions, CONDITION_SYNCHRONIZING)
            .is_some_and(|c| c.status != "True")
        {
            set_condition(
                &mut status.conditions,
                CONDITION_SYNCHRONIZING,
                true,
                reasons::SYNC_IN_PROGRESS,
                "Synchronization in-progress",
            );
        }
        let overdue = match (schedule, machine.status().last_sync_start_time) {
            (Some(schedule), Some(start)) => next_fire(schedule, start).is_some_and(|t| t <= now),
            _ => false,
        };
        machine.metrics().set_out_of_sync(overdue);
        debug!("Synchronization in progress");
        return Ok(Requeue::After(result.retry_after.unwrap_or(poll_interval)));
    }

    complete_sync(machine, schedule, now);
    cleanup(machine, schedule, now, poll_interval).await
}

fn complete_sync<M: ReplicationMachine + ?Sized>(
    machine: &mut M,
    schedule: Option<&Schedule>,
    now: DateTime<Utc>,
) {
    let manual = machine.manual_tag().map(str::to_string);
    let metrics = machine.metrics().clone();
    let status = machine.status_mut();
    let start = status.last_sync_start_time.unwrap_or(now);
    let elapsed = (now - start).max(chrono::Duration::zero());

    status.last_sync_time = Some(now);
    status.last_sync_duration = Some(format_duration(elapsed));
    if manual.is_some() {
        status.last_manual_sync = manual;
    }
    status.next_sync_time = match schedule {
        Some(schedule) => {
            let mut next = next_fire(schedule, start);
            if next.is_some_and(|t| t <= now) {
                metrics.missed_interval();
                next = next_fire(schedule, now);
            }
            next
        }
        None => None,
    };
    set_condition(
        &mut status.conditions,
        CONDITION_SYNCHRONIZING,
        false,
        reasons::CLEANING_UP,
        "Cleaning up",
    );

    metrics.observe_sync_duration(elapsed.num_milliseconds() as f64 / 1000.0);
    metrics.set_out_of_sync(false);
    info!(duration = %format_duration(elapsed), "Synchronization completed");
}

async fn cleanup<M: ReplicationMachine + ?Sized>(
    machine: &mut M,
    schedule: Option<&Schedule>,
    now: DateTime<Utc>,
    poll_interval: Duration,
) -> Result<Requeue> {
    let result = machine.cleanup().await?;
    if !result.completed {
        return Ok(Requeue::After(result.retry_after.unwrap_or(poll_interval)));
    }
    Ok(wait_for_trigger(machine, schedule, now))
}

/// Record the idle reason and how long until the next trigger
fn wait_for_trigger<M: ReplicationMachine + ?Sized>(
    machine: &mut M,
    schedule: Option<&Schedule>,
    now: DateTime<Utc>,
) -> Requeue {
    let manual = machine.manual_tag().is_some();
    let status = machine.status_mut();

    if !manual {
        if let Some(schedule) = schedule {
            if status.next_sync_time.is_none() {
                status.next_sync_time = next_fire(schedule, now);
            }
            set_condition(
                &mut status.conditions,
                CONDITION_SYNCHRONIZING,
                false,
                reasons::WAITING_FOR_SCHEDULE,
                "Waiting for next scheduled synchronization",
            );
            machine.metrics().set_out_of_sync(false);
            return match machine.status().next_sync_time {
                Some(next) => Requeue::After((next - now).to_std().unwrap_or(Duration::ZERO)),
                None => Requeue::AwaitChange,
            };
        }
    }

    if manual {
        status.next_sync_time = None;
        set_condition(
            &mut status.conditions,
            CONDITION_SYNCHRONIZING,
            false,
            reasons::WAITING_FOR_MANUAL,
            "Waiting for manual trigger",
        );
        machine.metrics().set_out_of_sync(false);
        return Requeue::AwaitChange;
    }

    // no trigger: sync continuously
    status.next_sync_time = None;
    set_condition(
        &mut status.conditions,
        CONDITION_SYNCHRONIZING,
        false,
        reasons::WAITING_FOR_SCHEDULE,
        "Starting next synchronization",
    );
    Requeue::After(Duration::ZERO)
}

/// `lastSyncDuration` rendering, e.g. `1m30.5s`
pub fn format_duration(d: chrono::Duration) -> String {
    let millis = d.num_milliseconds().max(0);
    let hours = millis / 3_600_000;
    let minutes = (millis / 60_000) % 60;
    let seconds = (millis % 60_000) as f64 / 1000.0;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&format!("{}s", seconds));
    out
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_five_field_schedule() {
        let schedule = parse_schedule("*/10 * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 3, 0).unwrap();
        assert_eq!(
            next_fire(&schedule, base),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 10, 0).unwrap())
        );
    }

    #[test]
    fn test_shorthand_schedule() {
        let schedule = parse_schedule("@hourly").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 3, 0).unwrap();
        assert_eq!(
            next_fire(&schedule, base),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_fire_time_membership() {
        let schedule = parse_schedule("*/10 * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert!(is_fire_time(&schedule, base + chrono::Duration::minutes(10)));
        assert!(!is_fire_time(&schedule, base + chrono::Duration::minutes(15)));
    }

    #[test]
    fn test_invalid_schedule() {
        match parse_schedule("every tuesday") {
            Err(Error::InvalidSchedule { schedule, .. }) => assert_eq!(schedule, "every tuesday"),
            other => panic!("expected InvalidSchedule, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_state_from_condition() {
        let mut status = SyncStatus::default();
        assert_eq!(current_state(&status), State::Idle);

        set_condition(&mut status.conditions, CONDITION_SYNCHRONIZING, true, reasons::SYNC_IN_PROGRESS, "");
        assert_eq!(current_state(&status), State::Synchronizing);

        set_condition(&mut status.conditions, CONDITION_SYNCHRONIZING, false, reasons::CLEANING_UP, "");
        assert_eq!(current_state(&status), State::CleaningUp);

        set_condition(&mut status.conditions, CONDITION_SYNCHRONIZING, false, reasons::ERROR, "x");
        assert_eq!(current_state(&status), State::Synchronizing);

        set_condition(&mut status.conditions, CONDITION_SYNCHRONIZING, false, reasons::WAITING_FOR_MANUAL, "");
        assert_eq!(current_state(&status), State::Idle);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::milliseconds(1500)), "1.5s");
        assert_eq!(format_duration(chrono::Duration::seconds(90)), "1m30s");
        assert_eq!(format_duration(chrono::Duration::seconds(3600)), "1h0m0s");
    }
}
