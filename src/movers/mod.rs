//! Data movers and the catalog that selects them
//!
//! A [`Builder`] inspects a ReplicationSource or ReplicationDestination and
//! either declines or returns a [`Mover`] bound to that object. Movers are
//! rebuilt on every reconcile and only touch objects owned by their CR.

pub mod job;
#[cfg(feature = "restic")]
pub mod restic;
#[cfg(feature = "rsync-tls")]
pub mod rsynctls;
pub mod service_account;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, TypedLocalObjectReference};
use kube::ResourceExt;
use tracing::debug;

use crate::adapters::{EventPublisher, ResourceClient};
use crate::config::OperatorConfig;
use crate::crd::{
    ReplicationDestination, ReplicationDestinationStatus, ReplicationSource,
    ReplicationSourceStatus, SyncStatus,
};
use crate::error::{Error, Result};
use crate::resources::PRIVILEGED_MOVERS_ANNOTATION;

/// Outcome of one `synchronize` or `cleanup` pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MoverResult {
    /// The operation finished; otherwise poll again
    pub completed: bool,
    /// Destination data published by a completed synchronization
    pub image: Option<TypedLocalObjectReference>,
    /// Poll sooner than the default interval
    pub retry_after: Option<Duration>,
}

impl MoverResult {
    pub fn in_progress() -> Self {
        Self::default()
    }

    pub fn complete() -> Self {
        Self {
            completed: true,
            ..Default::default()
        }
    }

    pub fn complete_with_image(image: TypedLocalObjectReference) -> Self {
        Self {
            completed: true,
            image: Some(image),
            retry_after: None,
        }
    }

    pub fn retry_after(delay: Duration) -> Self {
        Self {
            retry_after: Some(delay),
            ..Default::default()
        }
    }
}

/// Status of the CR a mover works for, borrowed for the length of one pass
pub enum OwnerStatus<'a> {
    Source(&'a mut ReplicationSourceStatus),
    Destination(&'a mut ReplicationDestinationStatus),
}

impl OwnerStatus<'_> {
    pub fn sync_mut(&mut self) -> &mut SyncStatus {
        match self {
            OwnerStatus::Source(s) => &mut s.sync,
            OwnerStatus::Destination(s) => &mut s.sync,
        }
    }

    pub fn source_mut(&mut self) -> Option<&mut ReplicationSourceStatus> {
        match self {
            OwnerStatus::Source(s) => Some(&mut **s),
            OwnerStatus::Destination(_) => None,
        }
    }

    pub fn destination_mut(&mut self) -> Option<&mut ReplicationDestinationStatus> {
        match self {
            OwnerStatus::Source(_) => None,
            OwnerStatus::Destination(s) => Some(&mut **s),
        }
    }
}

/// One synchronization technique bound to one CR
#[async_trait]
pub trait Mover: Send + Sync {
    fn name(&self) -> &str;

    /// Advance the synchronization by one step
    async fn synchronize(&self, status: &mut OwnerStatus<'_>) -> Result<MoverResult>;

    /// Remove what the finished synchronization left behind
    async fn cleanup(&self, status: &mut OwnerStatus<'_>) -> Result<MoverResult>;
}

/// What builders hand to the movers they construct
#[derive(Clone)]
pub struct MoverEnv {
    pub client: ResourceClient,
    pub events: Arc<dyn EventPublisher>,
    pub config: Arc<OperatorConfig>,
}

/// Constructs a [`Mover`] for the CRs that select its backend
pub trait Builder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Human readable version details, logged at startup
    fn version_info(&self) -> String;

    /// `None` when the source does not use this backend
    fn from_source(
        &self,
        env: &MoverEnv,
        source: &ReplicationSource,
        privileged: bool,
    ) -> Result<Option<Box<dyn Mover>>>;

    /// `None` when the destination does not use this backend
    fn from_destination(
        &self,
        env: &MoverEnv,
        destination: &ReplicationDestination,
        privileged: bool,
    ) -> Result<Option<Box<dyn Mover>>>;
}

/// Ordered registry of builders
#[derive(Clone, Default)]
pub struct Catalog {
    builders: Vec<Arc<dyn Builder>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every compiled-in builder the configuration enables, in a fixed order
    pub fn from_config(config: &OperatorConfig) -> Self {
        let mut catalog = Self::new();
        #[cfg(feature = "restic")]
        {
            if config.mover_enabled(restic::MOVER_NAME) {
                catalog.register(Arc::new(restic::ResticBuilder::new(config)));
            }
        }
        #[cfg(feature = "rsync-tls")]
        {
            if config.mover_enabled(rsynctls::MOVER_NAME) {
                catalog.register(Arc::new(rsynctls::RsyncTlsBuilder::new(config)));
            }
        }
        catalog
    }

    pub fn register(&mut self, builder: Arc<dyn Builder>) {
        self.builders.push(builder);
    }

    pub fn builders(&self) -> &[Arc<dyn Builder>] {
        &self.builders
    }

    pub fn enabled_movers(&self) -> Vec<String> {
        self.builders.iter().map(|b| b.name().to_string()).collect()
    }

    /// The single mover claiming `source`
    ///
    /// `Ok(None)` means an external mover handles it.
    pub fn source_mover(
        &self,
        env: &MoverEnv,
        source: &ReplicationSource,
        privileged: bool,
    ) -> Result<Option<Box<dyn Mover>>> {
        let mut found = Vec::new();
        for builder in &self.builders {
            if let Some(mover) = builder.from_source(env, source, privileged)? {
                found.push(mover);
            }
        }
        self.select(found, source.spec.external.is_some(), &source.name_any())
    }

    /// The single mover claiming `destination`
    pub fn destination_mover(
        &self,
        env: &MoverEnv,
        destination: &ReplicationDestination,
        privileged: bool,
    ) -> Result<Option<Box<dyn Mover>>> {
        let mut found = Vec::new();
        for builder in &self.builders {
            if let Some(mover) = builder.from_destination(env, destination, privileged)? {
                found.push(mover);
            }
        }
        self.select(
            found,
            destination.spec.external.is_some(),
            &destination.name_any(),
        )
    }

    fn select(
        &self,
        mut found: Vec<Box<dyn Mover>>,
        external: bool,
        name: &str,
    ) -> Result<Option<Box<dyn Mover>>> {
        match found.len() {
            0 if external => {
                debug!(name, "Handled by an external mover");
                Ok(None)
            }
            0 => Err(Error::NoMoverFound {
                enabled: self.enabled_movers(),
            }),
            1 => Ok(found.pop()),
            _ => Err(Error::MultipleMoversFound {
                movers: found.iter().map(|m| m.name().to_string()).collect(),
            }),
        }
    }
}

/// Whether the namespace allows movers to run privileged
pub async fn privileged_movers_allowed(client: &ResourceClient, namespace: &str) -> Result<bool> {
    let ns = client.get::<Namespace>("", namespace).await?;
    Ok(ns.is_some_and(|ns| {
        ns.annotations()
            .get(PRIVILEGED_MOVERS_ANNOTATION)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Claims(&'static str, bool);

    struct Named(&'static str);

    #[async_trait]
    impl Mover for Named {
        fn name(&self) -> &str {
            self.0
        }
        async fn synchronize(&self, _: &mut OwnerStatus<'_>) -> Result<MoverResult> {
            Ok(MoverResult::complete())
        }
        async fn cleanup(&self, _: &mut OwnerStatus<'_>) -> Result<MoverResult> {
            Ok(MoverResult::complete())
        }
    }

    impl Builder for Claims {
        fn name(&self) -> &'static str {
            self.0
        }
        fn version_info(&self) -> String {
            format!("{} test", self.0)
        }
        fn from_source(
            &self,
            _: &MoverEnv,
            _: &ReplicationSource,
            _: bool,
        ) -> Result<Option<Box<dyn Mover>>> {
            Ok(self.1.then(|| Box::new(Named(self.0)) as Box<dyn Mover>))
        }
        fn from_destination(
            &self,
            _: &MoverEnv,
            _: &ReplicationDestination,
            _: bool,
        ) -> Result<Option<Box<dyn Mover>>> {
            Ok(None)
        }
    }

    fn env() -> MoverEnv {
        MoverEnv {
            client: ResourceClient::new(Arc::new(crate::adapters::MemoryObjectStore::new())),
            events: Arc::new(crate::adapters::NoopEventPublisher),
            config: Arc::new(OperatorConfig::default()),
        }
    }

    fn source() -> ReplicationSource {
        ReplicationSource::new("src", Default::default())
    }

    #[test]
    fn test_single_match_is_selected() {
        let mut catalog = Catalog::new();
        catalog.register(Arc::new(Claims("a", false)));
        catalog.register(Arc::new(Claims("b", true)));
        let mover = catalog.source_mover(&env(), &source(), false).unwrap().unwrap();
        assert_eq!(mover.name(), "b");
    }

    #[test]
    fn test_multiple_matches_rejected() {
        let mut catalog = Catalog::new();
        catalog.register(Arc::new(Claims("a", true)));
        catalog.register(Arc::new(Claims("b", true)));
        match catalog.source_mover(&env(), &source(), false) {
            Err(Error::MultipleMoversFound { movers }) => assert_eq!(movers, vec!["a", "b"]),
            _ => panic!("expected MultipleMoversFound"),
        }
    }

    #[test]
    fn test_no_match_lists_enabled_movers() {
        let mut catalog = Catalog::new();
        catalog.register(Arc::new(Claims("a", false)));
        match catalog.source_mover(&env(), &source(), false) {
            Err(Error::NoMoverFound { enabled }) => assert_eq!(enabled, vec!["a"]),
            _ => panic!("expected NoMoverFound"),
        }
    }

    #[test]
    fn test_external_mover_is_left_alone() {
        let mut catalog = Catalog::new();
        catalog.register(Arc::new(Claims("a", false)));
        let mut src = source();
        src.spec.external = Some(Default::default());
        assert!(catalog.source_mover(&env(), &src, false).unwrap().is_none());
    }
}
