//! Bare Git repository checks on the local filesystem.

use std::path::Path;

use tracing::{debug, instrument, warn};

/// Check whether `path` looks like a valid bare Git repository.
///
/// A bare repo must be a directory that contains a `HEAD` file.  This is a
/// lightweight heuristic, not a full integrity check.
#[instrument(fields(path = %path.display()))]
pub async fn validate_bare_repo(path: &Path) -> bool {
    let is_dir = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);

    if !is_dir {
        debug!("path does not exist or is not a directory");
        return false;
    }

    let head_exists = tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);

    if !head_exists {
        debug!("HEAD file not found; not a valid bare repo");
        return false;
    }

    let objects_ok = tokio::fs::metadata(path.join("objects"))
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);

    let refs_ok = tokio::fs::metadata(path.join("refs"))
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);

    if !objects_ok || !refs_ok {
        // Still usable: refs may all be packed.
        warn!("HEAD exists but objects/ or refs/ directory is missing");
    }

    true
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Lay out the minimum a bare repository needs on disk.
    pub(crate) fn fake_bare_repo(path: &Path) {
        std::fs::create_dir_all(path.join("objects")).unwrap();
        std::fs::create_dir_all(path.join("refs/heads")).unwrap();
        std::fs::write(path.join("HEAD"), "ref: refs/heads/main\n").unwrap();
    }

    #[tokio::test]
    async fn validate_nonexistent_path() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!validate_bare_repo(&tmp.path().join("missing.git")).await);
    }

    #[tokio::test]
    async fn directory_without_head_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty.git");
        std::fs::create_dir(&path).unwrap();
        assert!(!validate_bare_repo(&path).await);
    }

    #[tokio::test]
    async fn regular_file_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("file.git");
        std::fs::write(&path, "not a repo").unwrap();
        assert!(!validate_bare_repo(&path).await);
    }

    #[tokio::test]
    async fn bare_layout_is_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("widgets.git");
        fake_bare_repo(&path);
        assert!(validate_bare_repo(&path).await);
    }

    #[tokio::test]
    async fn head_only_is_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("packed.git");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        assert!(validate_bare_repo(&path).await);
    }
}
