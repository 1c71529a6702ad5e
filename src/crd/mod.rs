//! Custom Resource Definitions for the VolSync operator

mod common;
mod replication_destination;
mod replication_source;
mod volume_snapshot;

pub use common::*;
pub use replication_destination::*;
pub use replication_source::*;
pub use volume_snapshot::*;

use kube::CustomResourceExt;

/// Generate all CRD YAML manifests owned by this operator
pub fn generate_crds() -> Vec<String> {
    vec![
        serde_yaml::to_string(&ReplicationSource::crd()).unwrap(),
        serde_yaml::to_string(&ReplicationDestination::crd()).unwrap(),
    ]
}
