//! VolSync Kubernetes Operator
//!
//! Replicates persistent volumes by reconciling `ReplicationSource` and
//! `ReplicationDestination` resources into per-mover Jobs, volumes and
//! Services that perform one synchronization at a time.

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod movers;
pub mod resources;
pub mod statemachine;
pub mod volumehandler;

pub use error::{Error, Result};
