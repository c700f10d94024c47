//! Error types for the ApplicationSet controller

use thiserror::Error;

use crate::template::TemplateError;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Generator entry with no kind populated
    #[error("generator is empty: exactly one of list, clusters or git must be set")]
    EmptyGenerator,

    /// Invalid ApplicationSet or generator configuration
    #[error("validation error: {0}")]
    Validation(String),

    /// A generator failed to produce parameters
    #[error("{generator} generator failed: {message}")]
    Generator {
        /// Generator kind (list, clusters, git)
        generator: &'static str,
        /// What went wrong
        message: String,
    },

    /// Repository server call failed
    #[error("repository server error: {0}")]
    RepoServer(String),

    /// Template rendering failed
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Two parameter sets rendered the same Application name
    #[error("duplicate application name '{name}': already produced by an earlier parameter set")]
    DuplicateName {
        /// The conflicting Application name
        name: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Reconciliation pass exceeded its time budget
    #[error("reconciliation timed out after {0}s")]
    Timeout(u64),

    /// Resource is missing a field the controller requires
    #[error("missing field: {0}")]
    MissingField(&'static str),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a generator error for the given generator kind
    pub fn generator(generator: &'static str, msg: impl Into<String>) -> Self {
        Self::Generator {
            generator,
            message: msg.into(),
        }
    }

    /// Create a repository server error with the given message
    pub fn repo_server(msg: impl Into<String>) -> Self {
        Self::RepoServer(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Kubernetes API returned 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// Kubernetes API returned 409 (resourceVersion mismatch or already exists)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }

    /// Whether retrying the pass can succeed without a spec change
    ///
    /// Configuration errors stay broken until the user edits the
    /// ApplicationSet; everything else is infrastructure and may recover.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kube(kube::Error::Api(ae)) => ae.code == 409 || ae.code == 429 || ae.code >= 500,
            Self::Kube(_) | Self::RepoServer(_) | Self::Timeout(_) => true,
            Self::EmptyGenerator
            | Self::Generator { .. }
            | Self::Validation(_)
            | Self::Template(_)
            | Self::DuplicateName { .. }
            | Self::Serialization(_)
            | Self::MissingField(_) => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("synthetic {code}"),
        reason: match code {
            404 => "NotFound",
            409 => "Conflict",
            _ => "InternalError",
        }
        .to_string(),
        code,
    }))
}
