//! Prometheus metrics for the VolSync operator
//!
//! Operator health and reconcile counters, plus the per-object replication
//! metrics (`volsync_volume_out_of_sync`, `volsync_missed_intervals_total`,
//! `volsync_sync_duration_seconds`).

mod prometheus;

pub use self::prometheus::*;
