//! Lifecycle-aware resource factory.
//!
//! [`ResourceBuilder`] is the capability a concrete strategy implements to
//! open a resource for one repository.  [`ResourceFactory`] composes a
//! builder with a bounded LRU cache, a build timeout and refresh handling,
//! so callers only ever see fully built, current resources.

pub mod cached;

use crate::error::BuildError;
use crate::resolver::RepositoryIdentifier;

pub use cached::{FactoryOptions, FactoryStats, Phase, ResourceFactory, DEFAULT_BUILD_TIMEOUT};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A value owned by the factory's cache for as long as it is cached.
pub trait ManagedResource: Send + Sync + 'static {
    /// Free whatever the resource holds.
    ///
    /// Called exactly once, when the resource leaves the cache through
    /// eviction, context refresh or shutdown.  Errors are logged by the
    /// factory and never stop eviction.
    fn release(&self) -> anyhow::Result<()>;
}

/// Strategy that builds the resource for one repository.
#[async_trait::async_trait]
pub trait ResourceBuilder: Send + Sync + 'static {
    type Resource: ManagedResource;

    /// Build a ready-to-use resource for `id`.
    ///
    /// The factory bounds this call with its build timeout and drops the
    /// future when the budget runs out.
    async fn build(&self, id: &RepositoryIdentifier) -> Result<Self::Resource, BuildError>;
}
