//! Error types shared by the resolver, the LRU cache and the resource
//! factory.
//!
//! Application plumbing (config loading, git subprocesses, server start-up)
//! uses `anyhow`; these enums are the typed outcomes callers match on.

use std::time::Duration;

/// Failure constructing a bounded cache.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cache capacity must be greater than zero")]
    ZeroCapacity,
}

/// Failure reported by a [`ResourceBuilder`](crate::factory::ResourceBuilder).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Nothing exists for the requested identifier.
    #[error("repository {0} does not exist")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of a failed [`ResourceFactory::get`](crate::factory::ResourceFactory::get)
/// or identifier resolution.
///
/// `Clone` so that every caller waiting on the same in-flight build receives
/// the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FactoryError {
    /// No repository identifier could be extracted from the request path.
    #[error("no repository identifier in path {path:?}")]
    InvalidIdentifier { path: String },

    /// Building the resource took longer than the configured budget.
    #[error("building {repo} exceeded the {timeout:?} budget")]
    ConstructionTimeout { repo: String, timeout: Duration },

    /// The builder failed for a reason other than the timeout.
    #[error("failed to build {repo}: {reason}")]
    ConstructionFailure {
        repo: String,
        reason: String,
        /// Set when the builder reported the repository does not exist.
        not_found: bool,
    },

    /// `get` was called after the factory was shut down.
    #[error("resource factory is closed")]
    Closed,
}

impl FactoryError {
    pub fn invalid_identifier(path: Option<&str>) -> Self {
        Self::InvalidIdentifier {
            path: path.unwrap_or_default().to_string(),
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConstructionTimeout { .. })
    }
}
