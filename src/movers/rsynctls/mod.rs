//! Rsync-over-TLS mover: streams a volume directly from a source Pod to a
//! destination Pod exposed through a Service

mod mover;

pub use mover::RsyncTlsMover;

use super::{Builder, Mover, MoverEnv};
use crate::config::OperatorConfig;
use crate::crd::{ReplicationDestination, ReplicationSource};
use crate::error::Result;

pub const MOVER_NAME: &str = "rsync-tls";

/// Port the destination listens on
pub const DEFAULT_PORT: i32 = 8000;

/// Key of the pre-shared key in the key Secret
pub const PSK_KEY: &str = "psk.txt";

/// Keep rsync summaries and errors
pub fn log_filter(line: &str) -> bool {
    const MARKERS: &[&str] = &[
        "sent ",
        "total size is",
        "rsync error",
        "rsync:",
        "Synchronization",
        "ERROR",
        "Fatal",
    ];
    MARKERS.iter().any(|m| line.contains(m))
}

/// Builds [`RsyncTlsMover`]s for CRs with an `rsyncTLS` section
pub struct RsyncTlsBuilder {
    image: String,
}

impl RsyncTlsBuilder {
    pub fn new(config: &OperatorConfig) -> Self {
        Self {
            image: config.rsync_tls_container_image.clone(),
        }
    }
}

impl Builder for RsyncTlsBuilder {
    fn name(&self) -> &'static str {
        MOVER_NAME
    }

    fn version_info(&self) -> String {
        format!("Rsync-TLS container: {}", self.image)
    }

    fn from_source(
        &self,
        env: &MoverEnv,
        source: &ReplicationSource,
        privileged: bool,
    ) -> Result<Option<Box<dyn Mover>>> {
        Ok(source.spec.rsync_tls.as_ref().map(|spec| {
            Box::new(RsyncTlsMover::for_source(env, source, spec, &self.image, privileged))
                as Box<dyn Mover>
        }))
    }

    fn from_destination(
        &self,
        env: &MoverEnv,
        destination: &ReplicationDestination,
        privileged: bool,
    ) -> Result<Option<Box<dyn Mover>>> {
        Ok(destination.spec.rsync_tls.as_ref().map(|spec| {
            Box::new(RsyncTlsMover::for_destination(
                env,
                destination,
                spec,
                &self.image,
                privileged,
            )) as Box<dyn Mover>
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter() {
        assert!(log_filter("sent 1,024 bytes  received 35 bytes  2,118.00 bytes/sec"));
        assert!(log_filter("total size is 4,096  speedup is 3.87"));
        assert!(log_filter("rsync error: some files could not be transferred (code 23)"));
        assert!(!log_filter("file.txt"));
    }
}
