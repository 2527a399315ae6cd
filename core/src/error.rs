use thiserror::Error;

/// Skiff error types
#[derive(Error, Debug)]
pub enum SkiffError {
    /// Reference, manifest, or layer does not exist
    #[error("Not found: {reference} - {message}")]
    NotFound { reference: String, message: String },

    /// Credentials were rejected by a registry
    #[error("Authentication failed: {registry} - {message}")]
    Auth { registry: String, message: String },

    /// Short write or size mismatch while materializing a blob
    #[error("Integrity error: {digest} expected {expected} bytes, got {actual}")]
    Integrity {
        digest: String,
        expected: i64,
        actual: u64,
    },

    /// Network or filesystem blip worth retrying
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// No candidate node image could host the seed registry
    #[error("Injection exhausted: {0}")]
    Exhaustion(String),

    /// The operation observed the cancellation switch
    #[error("Operation cancelled")]
    Cancelled,

    /// OCI image error
    #[error("OCI image error: {0}")]
    OciImageError(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Kubernetes control-plane error
    #[error("Cluster error: {0}")]
    ClusterError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl SkiffError {
    /// Whether a local retry of the failing operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SkiffError::Integrity { .. }
                | SkiffError::TransientIo(_)
                | SkiffError::RegistryError { .. }
                | SkiffError::IoError(_)
        )
    }

    /// Whether this error only reports that the pipeline was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SkiffError::Cancelled)
    }

    /// Operator-facing hint for recoverable situations.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SkiffError::Integrity { .. } => Some(
                "potential image cache corruption - clear the image cache and retry",
            ),
            SkiffError::Auth { .. } => Some("log in to the registry and retry"),
            SkiffError::Exhaustion(_) => {
                Some("no image already present on the cluster nodes can run the injector")
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SkiffError {
    fn from(err: serde_json::Error) -> Self {
        SkiffError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for SkiffError {
    fn from(err: serde_yaml::Error) -> Self {
        SkiffError::SerializationError(err.to_string())
    }
}

/// Result type alias for Skiff operations
pub type Result<T> = std::result::Result<T, SkiffError>;
