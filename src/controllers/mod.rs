//! Kubernetes controllers for ReplicationSource and ReplicationDestination
//!
//! Each controller watches its CR kind plus the objects movers create for it,
//! selects the mover through the [`Catalog`], and hands both to the
//! replication state machine. Status is written back on every pass.

mod replication_destination_controller;
mod replication_source_controller;

pub use replication_destination_controller::{
    reconcile_destination, run as run_replication_destination_controller,
};
pub use replication_source_controller::{
    reconcile_source, run as run_replication_source_controller,
};

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::Client;

use crate::adapters::{EventPublisher, KubeEventPublisher, ResourceClient};
use crate::config::OperatorConfig;
use crate::error::Error;
use crate::movers::{Catalog, MoverEnv};
use crate::statemachine::Requeue;

/// Name reported on Events
pub const CONTROLLER_NAME: &str = "volsync";

/// Shared context for all controllers
#[derive(Clone)]
pub struct Context {
    pub kube: ResourceClient,
    pub events: Arc<dyn EventPublisher>,
    pub config: Arc<OperatorConfig>,
    pub catalog: Arc<Catalog>,
}

impl Context {
    pub fn new(
        kube: ResourceClient,
        events: Arc<dyn EventPublisher>,
        config: Arc<OperatorConfig>,
        catalog: Arc<Catalog>,
    ) -> Self {
        Self {
            kube,
            events,
            config,
            catalog,
        }
    }

    /// Context talking to the API server, with the movers the config enables
    pub fn from_client(client: Client, config: OperatorConfig) -> Self {
        let catalog = Catalog::from_config(&config);
        Self::new(
            ResourceClient::from_kube(client.clone()),
            Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            Arc::new(config),
            Arc::new(catalog),
        )
    }

    pub fn mover_env(&self) -> MoverEnv {
        MoverEnv {
            client: self.kube.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        }
    }
}

impl From<Requeue> for Action {
    fn from(requeue: Requeue) -> Self {
        match requeue {
            Requeue::After(delay) => Action::requeue(delay),
            Requeue::AwaitChange => Action::await_change(),
        }
    }
}

/// Retry delay after a failed reconcile
pub fn retry_delay(error: &Error) -> Duration {
    match error {
        Error::Kube(_) => Duration::from_secs(30),
        Error::Config(_)
        | Error::Validation(_)
        | Error::InvalidSchedule { .. }
        | Error::NoMoverFound { .. }
        | Error::MultipleMoversFound { .. } => Duration::from_secs(300),
        // the deleted object is recreated on the next pass
        Error::ImmutableConflict { .. } => Duration::from_secs(1),
        _ => Duration::from_secs(30),
    }
}
