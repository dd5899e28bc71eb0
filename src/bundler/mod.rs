//! Bundler contract
//!
//! The loop never looks inside the bundler. It hands over an input map, an
//! output directory and the cache value returned by the previous build, and
//! keeps whatever cache comes back for the next call.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Opaque bundler state reused across incremental builds
#[derive(Clone)]
pub struct BuildCache(Arc<dyn Any + Send + Sync>);

impl BuildCache {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrow the cache as the bundler's own type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for BuildCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BuildCache(..)")
    }
}

/// One bundler invocation
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Logical name → absolute entry path
    pub input: BTreeMap<String, PathBuf>,
    pub out_dir: PathBuf,
    /// Module specifiers left to the runtime
    pub external: Vec<String>,
    /// Cache returned by the previous build
    pub cache: Option<BuildCache>,
}

/// Bundler failures
#[derive(Error, Debug, Clone)]
pub enum BundleError {
    /// An entry could not be found, usually because it was deleted mid-build
    #[error("UNRESOLVED_ENTRY: {}", .0.display())]
    UnresolvedEntry(PathBuf),

    /// Anything else: syntax errors, plugin crashes
    #[error("{0}")]
    Failed(String),
}

/// A module bundler able to build a subset of entries incrementally
#[async_trait]
pub trait Bundler: Send + Sync {
    /// Build every entry in `config.input` into `config.out_dir`,
    /// emitting `<out_dir>/<logical name>.js` per entry.
    async fn build(&self, config: BuildConfig) -> Result<BuildCache, BundleError>;
}

/// Cache kept by [`PassthroughBundler`]
#[derive(Debug, Default, Clone)]
pub struct PassthroughCache {
    /// Number of builds so far
    pub builds: u64,
    /// Entries written by the most recent build
    pub last_entries: Vec<String>,
}

/// Copies every entry to its output location untouched.
///
/// Enough for plain JavaScript projects and for exercising the loop
/// without a real bundler.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughBundler;

#[async_trait]
impl Bundler for PassthroughBundler {
    async fn build(&self, config: BuildConfig) -> Result<BuildCache, BundleError> {
        let previous = config
            .cache
            .as_ref()
            .and_then(|c| c.downcast_ref::<PassthroughCache>())
            .map(|c| c.builds)
            .unwrap_or(0);

        for (name, entry) in &config.input {
            let source = match tokio::fs::read(entry).await {
                Ok(source) => source,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(BundleError::UnresolvedEntry(entry.clone()));
                }
                Err(e) => return Err(BundleError::Failed(format!("{}: {}", entry.display(), e))),
            };
            let out = config.out_dir.join(format!("{}.js", name));
            if let Some(parent) = out.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| BundleError::Failed(format!("{}: {}", parent.display(), e)))?;
            }
            tokio::fs::write(&out, source)
                .await
                .map_err(|e| BundleError::Failed(format!("{}: {}", out.display(), e)))?;
            debug!(entry = %entry.display(), out = %out.display(), "copied entry");
        }

        Ok(BuildCache::new(PassthroughCache {
            builds: previous + 1,
            last_entries: config.input.keys().cloned().collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passthrough_writes_outputs_and_counts_builds() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("a.ts");
        std::fs::write(&entry, "export const a = 1;").unwrap();
        let out_dir = dir.path().join("out");

        let mut input = BTreeMap::new();
        input.insert("src/a".to_string(), entry.clone());
        let config = BuildConfig {
            input,
            out_dir: out_dir.clone(),
            external: vec![],
            cache: None,
        };

        let cache = PassthroughBundler.build(config.clone()).await.unwrap();
        assert_eq!(cache.downcast_ref::<PassthroughCache>().unwrap().builds, 1);
        assert_eq!(
            std::fs::read_to_string(out_dir.join("src/a.js")).unwrap(),
            "export const a = 1;"
        );

        let again = PassthroughBundler
            .build(BuildConfig {
                cache: Some(cache),
                ..config
            })
            .await
            .unwrap();
        let state = again.downcast_ref::<PassthroughCache>().unwrap();
        assert_eq!(state.builds, 2);
        assert_eq!(state.last_entries, vec!["src/a".to_string()]);
    }

    #[tokio::test]
    async fn test_passthrough_missing_entry_is_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        let mut input = BTreeMap::new();
        input.insert("gone".to_string(), dir.path().join("gone.ts"));
        let err = PassthroughBundler
            .build(BuildConfig {
                input,
                out_dir: dir.path().join("out"),
                external: vec![],
                cache: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::UnresolvedEntry(_)));
        assert!(err.to_string().starts_with("UNRESOLVED_ENTRY"));
    }
}
