//! Request path to repository identifier resolution.
//!
//! The identifier is the single path segment that ends in the `.git`
//! marker, e.g. `/org/team/widgets.git/info/refs` resolves to
//! `widgets.git`.  Anything before that segment and anything after it is
//! ignored, so different request paths for the same repository map to the
//! same cache key.

use std::fmt;

use crate::error::FactoryError;

/// Suffix that marks the repository segment of a request path.
pub const REPO_MARKER: &str = ".git";

const SEPARATOR: char = '/';

// ---------------------------------------------------------------------------
// RepositoryIdentifier
// ---------------------------------------------------------------------------

/// Canonical repository token used as the cache key.
///
/// Always a single non-empty segment ending in [`REPO_MARKER`] with at least
/// one character in front of the marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryIdentifier(String);

impl RepositoryIdentifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The repository name without the marker (`widgets` for `widgets.git`).
    pub fn name(&self) -> &str {
        self.0.strip_suffix(REPO_MARKER).unwrap_or(&self.0)
    }
}

impl fmt::Display for RepositoryIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RepositoryIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for RepositoryIdentifier {
    type Err = FactoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        resolve(Some(s))
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Extract the repository identifier from a raw request path.
///
/// Fails with [`FactoryError::InvalidIdentifier`] when the path is absent,
/// empty, made only of separators and the bare marker, or contains no
/// segment of the form `<name>.git`.
pub fn resolve(path: Option<&str>) -> Result<RepositoryIdentifier, FactoryError> {
    let raw = match path {
        Some(p) if !p.is_empty() => p,
        _ => return Err(FactoryError::invalid_identifier(path)),
    };

    raw.split(SEPARATOR)
        .find(|segment| is_repo_segment(segment))
        .map(|segment| RepositoryIdentifier(segment.to_string()))
        .ok_or_else(|| FactoryError::invalid_identifier(path))
}

/// A segment names a repository when it ends with the marker and has a
/// name in front of it.
fn is_repo_segment(segment: &str) -> bool {
    segment
        .strip_suffix(REPO_MARKER)
        .is_some_and(|name| !name.is_empty())
}

/// Split a request path into the part up to and including the repository
/// segment and the remainder after it, e.g.
/// `/org/widgets.git/info/refs` becomes `("/org/widgets.git", "info/refs")`.
///
/// Returns `None` when the path has no repository segment.
pub fn split_service_path(path: &str) -> Option<(&str, &str)> {
    let mut offset = 0;
    for segment in path.split(SEPARATOR) {
        let end = offset + segment.len();
        if is_repo_segment(segment) {
            let rest = path[end..].trim_start_matches(SEPARATOR);
            return Some((&path[..end], rest));
        }
        offset = end + SEPARATOR.len_utf8();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(path: &str) -> String {
        resolve(Some(path)).unwrap().to_string()
    }

    #[test]
    fn resolves_across_prefixes_and_suffixes() {
        let prefixes = ["", "/", "/a/b/c/"];
        let suffixes = ["", "/", "/c/b/a"];

        for name in ["widgets", "my-service", "a"] {
            for prefix in prefixes {
                for suffix in suffixes {
                    let path = format!("{prefix}{name}.git{suffix}");
                    assert_eq!(resolved(&path), format!("{name}.git"), "path {path:?}");
                }
            }
        }
    }

    #[test]
    fn rejects_missing_and_degenerate_paths() {
        for path in [None, Some(""), Some(".git"), Some("/.git"), Some("/.git/"), Some("///")] {
            let err = resolve(path).unwrap_err();
            assert!(
                matches!(err, FactoryError::InvalidIdentifier { .. }),
                "path {path:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn rejects_paths_without_marker() {
        for path in ["widgets", "/org/widgets", "/org/widgets/info/refs", "/widgets.gitx/info"] {
            assert!(resolve(Some(path)).is_err(), "path {path:?}");
        }
    }

    #[test]
    fn marker_must_end_the_segment() {
        assert_eq!(resolved("/widgets.gitx/real.git/info/refs"), "real.git");
    }

    #[test]
    fn first_repo_segment_wins() {
        assert_eq!(resolved("/outer.git/inner.git"), "outer.git");
        assert_eq!(resolved("/.git/inner.git"), "inner.git");
    }

    #[test]
    fn equivalent_paths_share_a_key() {
        let a = resolve(Some("/org/widgets.git/info/refs")).unwrap();
        let b = resolve(Some("widgets.git/git-upload-pack")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.name(), "widgets");
    }

    #[test]
    fn from_str_uses_resolver() {
        let id: RepositoryIdentifier = "/x/widgets.git/".parse().unwrap();
        assert_eq!(id.as_str(), "widgets.git");
        assert!("plain".parse::<RepositoryIdentifier>().is_err());
    }

    #[test]
    fn split_service_path_separates_repo_and_service() {
        assert_eq!(
            split_service_path("/org/widgets.git/info/refs"),
            Some(("/org/widgets.git", "info/refs"))
        );
        assert_eq!(
            split_service_path("widgets.git/git-upload-pack"),
            Some(("widgets.git", "git-upload-pack"))
        );
        assert_eq!(split_service_path("/widgets.git"), Some(("/widgets.git", "")));
        assert_eq!(split_service_path("/org/widgets/info/refs"), None);
    }
}
