//! Error types for the VolSync operator

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Secret not found
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// Secret key not found
    #[error("Secret key '{key}' not found in secret '{secret}'")]
    SecretKeyNotFound { secret: String, key: String },

    /// Object not found in the backing store
    #[error("{0} not found")]
    NotFound(String),

    /// Object already exists in the backing store
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// An existing object differs from its desired state in fields that cannot be updated.
    /// The object has been deleted and is recreated on the next pass.
    #[error("{kind} {name} had immutable changes and was deleted; it will be recreated")]
    ImmutableConflict { kind: String, name: String },

    /// The source PVC's copy-trigger was not updated in time
    #[error("Timed out waiting for copy-trigger to be updated on source PVC {pvc}")]
    CopyTriggerTimeout { pvc: String },

    /// No registered mover claims the resource
    #[error("a mover must be specified; enabled movers: {}", .enabled.join(", "))]
    NoMoverFound { enabled: Vec<String> },

    /// More than one registered mover claims the resource
    #[error("only one mover may be specified, found: {}", .movers.join(", "))]
    MultipleMoversFound { movers: Vec<String> },

    /// Unparseable trigger schedule
    #[error("Invalid cron schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Whether the error means the referenced object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) | Error::SecretNotFound(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Whether the error is the copy-trigger wait timeout
    pub fn is_copy_trigger_timeout(&self) -> bool {
        matches!(self, Error::CopyTriggerTimeout { .. })
    }
}
