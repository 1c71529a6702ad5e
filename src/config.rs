//! Operator configuration
//!
//! Every knob resolves as command-line flag, then environment variable, then
//! the compiled-in default.

use std::time::Duration;

use clap::Parser;

/// Default container image for every mover
pub const DEFAULT_MOVER_IMAGE: &str = "quay.io/backube/volsync:latest";

/// VolSync operator - replicates persistent volumes through pluggable data movers
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct OperatorConfig {
    /// Port serving /metrics, /healthz and /readyz
    #[arg(long, env = "METRICS_PORT", default_value = "8080")]
    pub metrics_port: u16,

    /// Upper bound on concurrently reconciled objects per controller
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value = "100")]
    pub max_concurrent_reconciles: u16,

    /// How long a source waits for its copy-trigger before reporting failure
    #[arg(long, env = "COPY_TRIGGER_TIMEOUT_SECS", default_value = "600")]
    pub copy_trigger_timeout_secs: u64,

    /// Requeue delay while a synchronization is in progress
    #[arg(long, env = "SYNC_POLL_INTERVAL_SECS", default_value = "30")]
    pub sync_poll_interval_secs: u64,

    /// Container image of the restic mover
    #[arg(long, env = "RELATED_IMAGE_RESTIC_CONTAINER", default_value = DEFAULT_MOVER_IMAGE)]
    pub restic_container_image: String,

    /// Container image of the rsync-tls mover
    #[arg(long, env = "RELATED_IMAGE_RSYNC_TLS_CONTAINER", default_value = DEFAULT_MOVER_IMAGE)]
    pub rsync_tls_container_image: String,

    /// Movers allowed to run (comma separated); empty enables every compiled-in mover
    #[arg(long, env = "ENABLED_MOVERS", value_delimiter = ',')]
    pub enabled_movers: Vec<String>,

    /// Cluster proxy passed through to mover Pods
    #[arg(long, env = "HTTP_PROXY")]
    pub http_proxy: Option<String>,

    #[arg(long, env = "HTTPS_PROXY")]
    pub https_proxy: Option<String>,

    #[arg(long, env = "NO_PROXY")]
    pub no_proxy: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            metrics_port: 8080,
            max_concurrent_reconciles: 100,
            copy_trigger_timeout_secs: 600,
            sync_poll_interval_secs: 30,
            restic_container_image: DEFAULT_MOVER_IMAGE.to_string(),
            rsync_tls_container_image: DEFAULT_MOVER_IMAGE.to_string(),
            enabled_movers: Vec::new(),
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
        }
    }
}

impl OperatorConfig {
    pub fn copy_trigger_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.copy_trigger_timeout_secs as i64)
    }

    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync_poll_interval_secs)
    }

    /// Whether the named mover may be registered in the catalog
    pub fn mover_enabled(&self, name: &str) -> bool {
        self.enabled_movers.is_empty()
            || self
                .enabled_movers
                .iter()
                .any(|m| m.trim().eq_ignore_ascii_case(name))
    }

    /// Proxy variables to inject into mover containers, both casings
    pub fn proxy_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        for (name, value) in [
            ("HTTP_PROXY", &self.http_proxy),
            ("HTTPS_PROXY", &self.https_proxy),
            ("NO_PROXY", &self.no_proxy),
        ] {
            if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                env.push((name.to_string(), v.to_string()));
                env.push((name.to_lowercase(), v.to_string()));
            }
        }
        env
    }
}
