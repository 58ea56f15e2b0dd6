//! Repository handles cached by the resource factory.
//!
//! [`BareRepoBuilder`] maps a repository identifier onto a directory under
//! the configured repository root and hands out a [`RepositoryHandle`] once
//! the directory checks out as a bare repository.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument};

use crate::error::BuildError;
use crate::factory::{ManagedResource, ResourceBuilder};
use crate::resolver::RepositoryIdentifier;

use super::bare_repo::validate_bare_repo;

// ---------------------------------------------------------------------------
// RepositoryHandle
// ---------------------------------------------------------------------------

/// An opened bare repository, ready to serve smart-HTTP requests.
#[derive(Debug)]
pub struct RepositoryHandle {
    id: RepositoryIdentifier,
    path: PathBuf,
    opened_at: Instant,
    released: AtomicBool,
}

impl RepositoryHandle {
    pub fn new(id: RepositoryIdentifier, path: PathBuf) -> Self {
        Self {
            id,
            path,
            opened_at: Instant::now(),
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &RepositoryIdentifier {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Whether the cache has let go of this handle.  Requests already holding
    /// it may finish; new requests get a fresh handle.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl ManagedResource for RepositoryHandle {
    fn release(&self) -> anyhow::Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            anyhow::bail!("repository handle for {} released twice", self.id);
        }
        debug!(repo = %self.id, age = ?self.age(), "repository handle released");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BareRepoBuilder
// ---------------------------------------------------------------------------

/// Opens bare repositories stored as `{root}/{identifier}`.
#[derive(Debug)]
pub struct BareRepoBuilder {
    root: RwLock<PathBuf>,
}

impl BareRepoBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: RwLock::new(root.into()),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.root
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Point the builder at a new repository root.  Handles that are already
    /// cached keep their old path until the next context refresh.
    pub fn set_root(&self, root: impl Into<PathBuf>) {
        let root = root.into();
        let mut current = self.root.write().unwrap_or_else(PoisonError::into_inner);
        if *current != root {
            info!(old = %current.display(), new = %root.display(), "repository root changed");
            *current = root;
        }
    }

    /// On-disk location for `id`.  Identifiers are a single path segment,
    /// so the result always stays under the root.
    pub fn repo_path(&self, id: &RepositoryIdentifier) -> PathBuf {
        self.root().join(id.as_str())
    }
}

#[async_trait::async_trait]
impl ResourceBuilder for BareRepoBuilder {
    type Resource = RepositoryHandle;

    #[instrument(skip(self), fields(repo = %id))]
    async fn build(&self, id: &RepositoryIdentifier) -> Result<RepositoryHandle, BuildError> {
        let path = self.repo_path(id);
        if !validate_bare_repo(&path).await {
            return Err(BuildError::NotFound(id.to_string()));
        }

        debug!(path = %path.display(), "opened bare repository");
        Ok(RepositoryHandle::new(id.clone(), path))
    }
}
