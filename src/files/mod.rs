//! File identities
//!
//! Every file the loop tracks is identified by its absolute, lexically
//! normalised path. The kind and critical flag are derived from the
//! project configuration.

use std::path::{Component, Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::{Error, Result};

/// Which configured root a file belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileKind {
    Source,
    Test,
    Unknown,
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileKind::Source => write!(f, "source"),
            FileKind::Test => write!(f, "test"),
            FileKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// A tracked file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileNode {
    /// Absolute, normalised path; the node identity
    pub path: PathBuf,
    pub kind: FileKind,
    /// Matches a configured critical glob (sources only)
    pub critical: bool,
}

impl FileNode {
    pub fn is_source(&self) -> bool {
        self.kind == FileKind::Source
    }

    pub fn is_test(&self) -> bool {
        self.kind == FileKind::Test
    }
}

/// Lexically normalise a path: drop `.`, fold `..`, keep it absolute if it was.
///
/// Does not touch the filesystem, so it works for deleted files too.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Matcher for the operator-supplied critical globs
#[derive(Debug, Clone)]
pub struct CriticalMatcher {
    root: PathBuf,
    globs: Gitignore,
}

impl CriticalMatcher {
    /// Compile gitignore-style patterns relative to `root`
    pub fn new(root: &Path, patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self {
                root: root.to_path_buf(),
                globs: Gitignore::empty(),
            });
        }
        let mut builder = GitignoreBuilder::new(root);
        for pattern in patterns {
            builder
                .add_line(None, pattern)
                .map_err(|e| Error::config(format!("invalid critical pattern '{}': {}", pattern, e)))?;
        }
        let globs = builder
            .build()
            .map_err(|e| Error::config(format!("invalid critical patterns: {}", e)))?;
        Ok(Self {
            root: root.to_path_buf(),
            globs,
        })
    }

    /// Whether the path, or a directory above it, matches a critical pattern
    pub fn is_critical(&self, path: &Path) -> bool {
        if self.globs.is_empty() || !path.starts_with(&self.root) {
            return false;
        }
        self.globs
            .matched_path_or_any_parents(path, false)
            .is_ignore()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_folds_dots() {
        assert_eq!(
            normalize_path(Path::new("/a/b/./c/../d.ts")),
            PathBuf::from("/a/b/d.ts")
        );
        assert_eq!(normalize_path(Path::new("/a/../../b")), PathBuf::from("/b"));
        assert_eq!(normalize_path(Path::new("a/../..")), PathBuf::from(".."));
    }

    #[test]
    fn test_critical_matcher_directory_pattern() {
        let matcher = CriticalMatcher::new(
            Path::new("/p"),
            &["src/config/".to_string(), "*.entry.ts".to_string()],
        )
        .unwrap();
        assert!(matcher.is_critical(Path::new("/p/src/config/env.ts")));
        assert!(matcher.is_critical(Path::new("/p/src/main.entry.ts")));
        assert!(!matcher.is_critical(Path::new("/p/src/util.ts")));
        assert!(!matcher.is_critical(Path::new("/elsewhere/src/config/env.ts")));
    }

    #[test]
    fn test_empty_matcher_never_critical() {
        let matcher = CriticalMatcher::new(Path::new("/p"), &[]).unwrap();
        assert!(!matcher.is_critical(Path::new("/p/src/bootstrap.ts")));
    }

    #[test]
    fn test_file_node_kind_helpers() {
        let node = FileNode {
            path: PathBuf::from("/p/spec/a.spec.ts"),
            kind: FileKind::Test,
            critical: false,
        };
        assert!(node.is_test());
        assert!(!node.is_source());
        assert_eq!(node.kind.to_string(), "test");
    }
}
