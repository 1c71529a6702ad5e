//! Restic mover: backs a volume up to, and restores it from, a restic repository

mod mover;
pub mod retention;

pub use mover::ResticMover;

use kube::ResourceExt;

use super::{Builder, Mover, MoverEnv};
use crate::config::OperatorConfig;
use crate::crd::{ReplicationDestination, ReplicationSource};
use crate::error::Result;

pub const MOVER_NAME: &str = "restic";

/// Keys of the repository Secret the mover cannot run without
pub const REQUIRED_REPOSITORY_KEYS: [&str; 2] = ["RESTIC_REPOSITORY", "RESTIC_PASSWORD"];

/// Keys of the repository Secret passed through to the mover when present
pub const OPTIONAL_REPOSITORY_KEYS: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AWS_DEFAULT_REGION",
    "AWS_PROFILE",
    "ST_AUTH",
    "ST_USER",
    "ST_KEY",
    "OS_AUTH_URL",
    "OS_REGION_NAME",
    "OS_USERNAME",
    "OS_USER_ID",
    "OS_PASSWORD",
    "OS_TENANT_ID",
    "OS_TENANT_NAME",
    "OS_USER_DOMAIN_NAME",
    "OS_USER_DOMAIN_ID",
    "OS_PROJECT_NAME",
    "OS_PROJECT_DOMAIN_NAME",
    "OS_PROJECT_DOMAIN_ID",
    "OS_TRUST_ID",
    "OS_APPLICATION_CREDENTIAL_ID",
    "OS_APPLICATION_CREDENTIAL_NAME",
    "OS_APPLICATION_CREDENTIAL_SECRET",
    "OS_STORAGE_URL",
    "OS_AUTH_TOKEN",
    "B2_ACCOUNT_ID",
    "B2_ACCOUNT_KEY",
    "AZURE_ACCOUNT_NAME",
    "AZURE_ACCOUNT_KEY",
    "AZURE_ACCOUNT_SAS",
    "AZURE_ENDPOINT_SUFFIX",
    "GOOGLE_PROJECT_ID",
    "RESTIC_COMPRESSION",
    "RESTIC_PACK_SIZE",
];

/// Secret key mounted as a file rather than exposed as a variable
pub const GOOGLE_CREDENTIALS_KEY: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Keep the lines of restic output that summarize a run or explain a failure
pub fn log_filter(line: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "Files:",
        "Dirs:",
        "Added to the repo",
        "processed",
        "snapshot",
        "restoring",
        "created restic repository",
        "Restic completed",
        "no parent snapshot found",
        "Fatal:",
        "ERROR:",
        "error:",
        "unable to",
        "=== ",
    ];
    let line = line.trim_start();
    PREFIXES.iter().any(|p| line.starts_with(p))
}

/// Builds [`ResticMover`]s for CRs with a `restic` section
pub struct ResticBuilder {
    image: String,
}

impl ResticBuilder {
    pub fn new(config: &OperatorConfig) -> Self {
        Self {
            image: config.restic_container_image.clone(),
        }
    }
}

impl Builder for ResticBuilder {
    fn name(&self) -> &'static str {
        MOVER_NAME
    }

    fn version_info(&self) -> String {
        format!("Restic container: {}", self.image)
    }

    fn from_source(
        &self,
        env: &MoverEnv,
        source: &ReplicationSource,
        privileged: bool,
    ) -> Result<Option<Box<dyn Mover>>> {
        let Some(spec) = source.spec.restic.as_ref() else {
            return Ok(None);
        };
        tracing::debug!(name = %source.name_any(), "Restic mover selected");
        Ok(Some(Box::new(ResticMover::for_source(
            env,
            source,
            spec,
            &self.image,
            privileged,
        ))))
    }

    fn from_destination(
        &self,
        env: &MoverEnv,
        destination: &ReplicationDestination,
        privileged: bool,
    ) -> Result<Option<Box<dyn Mover>>> {
        let Some(spec) = destination.spec.restic.as_ref() else {
            return Ok(None);
        };
        tracing::debug!(name = %destination.name_any(), "Restic mover selected");
        Ok(Some(Box::new(ResticMover::for_destination(
            env,
            destination,
            spec,
            &self.image,
            privileged,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter() {
        assert!(log_filter("Files:           3 new,     0 changed"));
        assert!(log_filter("  Fatal: unable to open config file"));
        assert!(log_filter("snapshot 1a2b3c saved"));
        assert!(!log_filter("[0:00] 10.00%  1 files 3.2 MiB, total 32 MiB"));
    }

    #[test]
    fn test_builder_reports_image() {
        let config = OperatorConfig {
            restic_container_image: "example.com/restic:1".into(),
            ..Default::default()
        };
        let builder = ResticBuilder::new(&config);
        assert_eq!(builder.name(), "restic");
        assert!(builder.version_info().contains("example.com/restic:1"));
    }
}
