//! Error types for stratos-director.

use stratos_templates::TemplatesError;

use crate::cloud::CloudError;
use crate::types::VmCid;

/// Result type alias using [`DirectorError`].
pub type DirectorResult<T> = Result<T, DirectorError>;

/// Errors that can occur while provisioning instances.
#[derive(Debug, thiserror::Error)]
pub enum DirectorError {
    /// The cloud driver kept failing with retryable errors until the retry bound.
    #[error("VM creation failed after {attempts} attempt(s): {source}")]
    RetryableProvider {
        /// Number of `create_vm` calls made.
        attempts: u32,
        /// Last driver error.
        source: CloudError,
    },

    /// The cloud driver failed with a non-retryable error.
    #[error("VM creation failed: {source}")]
    TerminalProvider {
        /// Driver error.
        source: CloudError,
    },

    /// A step after VM creation failed.
    #[error("failed to bind VM {vm_cid}: {source}")]
    Binding {
        /// The VM that was created.
        vm_cid: VmCid,
        /// The step failure.
        source: Box<DirectorError>,
    },

    /// The instance spec cannot yield a DNS record.
    #[error("malformed instance spec: {0}")]
    MalformedSpec(String),

    /// Uploading compressed templates failed.
    #[error("template delivery failed: {0}")]
    CacheTransport(String),

    /// Cloud driver error outside the create loop.
    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),

    /// Agent communication error.
    #[error("agent error: {0}")]
    Agent(String),

    /// Instance store error.
    #[error("store error: {0}")]
    Store(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Template archive error.
    #[error("template archive error: {0}")]
    Templates(#[from] TemplatesError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DirectorError {
    /// Create an agent error.
    #[must_use]
    pub fn agent(msg: impl Into<String>) -> Self {
        Self::Agent(msg.into())
    }

    /// Create a store error.
    #[must_use]
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a template delivery error.
    #[must_use]
    pub fn cache_transport(msg: impl Into<String>) -> Self {
        Self::CacheTransport(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Category name recorded on audit events.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::RetryableProvider { .. } => "RetryableProviderError",
            Self::TerminalProvider { .. } => "TerminalProviderError",
            Self::Binding { .. } => "BindingFailure",
            Self::MalformedSpec(_) => "MalformedSpec",
            Self::CacheTransport(_) => "CacheTransportFailure",
            Self::Cloud(_) => "CloudError",
            Self::Agent(_) => "AgentError",
            Self::Store(_) => "StoreError",
            Self::Database(_) => "DatabaseError",
            Self::Config(_) => "ConfigError",
            Self::Serialisation(_) => "SerialisationError",
            Self::Templates(_) => "TemplatesError",
            Self::Io(_) => "IoError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// The innermost error, looking through binding failures.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Binding { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for DirectorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialisation(err.to_string())
    }
}
