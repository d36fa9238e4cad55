//! Top-level error types for clusterprofile.

use thiserror::Error;

use crate::backend::BackendError;
use crate::cache::CacheError;
use crate::config::ConfigError;

/// Top-level error type encompassing all clusterprofile errors.
#[derive(Debug, Error)]
pub enum ClusterProfileError {
    /// No profile definition with this name was loaded.
    #[error("profile {profile} is not configured")]
    ConfigNotFound { profile: String },

    /// Removal was requested for a profile with no cached credentials.
    #[error("no cached credentials for profile {profile}")]
    CacheEntryNotFound { profile: String },

    /// The configured auth method is not handled by this component.
    #[error("{component}: method {method:?} is not supported")]
    AuthMethodUnsupported { component: String, method: String },

    /// A call to the secret backend failed.
    #[error("{operation} failed: {source}")]
    BackendCallFailed {
        operation: String,
        #[source]
        source: BackendError,
    },

    /// A backend call succeeded but did not yield the expected credential.
    #[error("{operation} failed: {message}")]
    MissingCredential { operation: String, message: String },

    /// The interactive login process failed.
    #[error("interactive login failed: {message}")]
    LoginFailed { message: String },

    /// Pivot profiles reference each other.
    #[error("pivot cycle detected: {chain}")]
    PivotCycle { chain: String },

    /// A local credential database could not be read.
    #[error("credential database {path}: {message}")]
    Database { path: String, message: String },

    /// A local credential file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Error from the credential cache file.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Error loading profile definitions.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ClusterProfileError {
    pub(crate) fn backend(operation: impl Into<String>, source: BackendError) -> Self {
        Self::BackendCallFailed {
            operation: operation.into(),
            source,
        }
    }

    /// The backend returned a lease duration no expiry can be computed for.
    pub(crate) fn lease_out_of_range(
        operation: impl Into<String>,
        url: impl Into<String>,
        seconds: i64,
    ) -> Self {
        Self::backend(
            operation,
            BackendError::InvalidResponse {
                url: url.into(),
                message: format!("lease duration {}s is out of range", seconds),
            },
        )
    }

    pub(crate) fn unsupported(component: impl Into<String>, method: impl Into<String>) -> Self {
        Self::AuthMethodUnsupported {
            component: component.into(),
            method: method.into(),
        }
    }
}

/// Result alias for clusterprofile operations.
pub type Result<T, E = ClusterProfileError> = std::result::Result<T, E>;
