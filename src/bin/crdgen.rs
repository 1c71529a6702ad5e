//! CRD YAML Generator
//!
//! This binary generates Kubernetes CRD manifests for the replication
//! resources defined by the volsync-operator.
//!
//! Usage: cargo run --bin crdgen > config/crd/all.yaml

use volsync_operator::crd::generate_crds;

fn main() {
    for crd in generate_crds() {
        println!("---");
        print!("{}", crd);
    }
}
