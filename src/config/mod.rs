//! Configuration
//!
//! Parses the `jasmine-hmr.json` project file and resolves it into a
//! [`Project`]: absolute roots, alias table, critical-file matcher and the
//! reload policy the change classifier runs under.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::files::{normalize_path, CriticalMatcher, FileKind, FileNode};

/// Default configuration file name looked up by the CLI
pub const DEFAULT_CONFIG_FILE: &str = "jasmine-hmr.json";

/// How source modifications are turned into reloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReloadPolicy {
    /// Critical files reload, everything else updates
    #[default]
    Smart,
    /// Every source modification reloads
    AlwaysReload,
    /// Source modifications never reload
    NeverReload,
}

/// Channel used to reach the live test host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransportConfig {
    /// Browser tab connecting back over a websocket
    Websocket { addr: SocketAddr },
    /// Spawned child process speaking JSON lines on stdin/stdout
    Child { command: Vec<String> },
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Websocket {
            addr: SocketAddr::from(([127, 0, 0, 1], 4210)),
        }
    }
}

/// On-disk configuration (`jasmine-hmr.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HmrConfig {
    /// Project root; relative values resolve against the config file's directory
    pub root: Option<String>,
    /// Source roots
    pub src_dirs: Vec<String>,
    /// Test roots
    pub test_dirs: Vec<String>,
    /// Extensions tried during resolution, with leading dot
    pub extensions: Vec<String>,
    /// Bare-specifier prefix to directory
    pub aliases: BTreeMap<String, String>,
    /// Bundler output directory
    pub out_dir: String,
    /// Modules the bundler must leave external
    pub external: Vec<String>,
    /// Gitignore-style globs marking critical files
    pub critical: Vec<String>,
    pub reload_policy: ReloadPolicy,
    /// Quiet period before a rebuild pass drains pending changes
    pub debounce_ms: u64,
    pub transport: TransportConfig,
}

impl Default for HmrConfig {
    fn default() -> Self {
        Self {
            root: None,
            src_dirs: vec!["src".to_string()],
            test_dirs: vec!["spec".to_string()],
            extensions: [".ts", ".tsx", ".js", ".jsx", ".mjs", ".cjs"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            aliases: BTreeMap::new(),
            out_dir: ".hmr".to_string(),
            external: Vec::new(),
            critical: Vec::new(),
            reload_policy: ReloadPolicy::Smart,
            debounce_ms: 10,
            transport: TransportConfig::default(),
        }
    }
}

impl HmrConfig {
    /// Parse a config from JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", DEFAULT_CONFIG_FILE, e)))
    }

    /// Load a config file and resolve it against the file's directory.
    ///
    /// [`validate`](Self::validate) warnings are logged, not returned.
    pub fn load(path: &Path) -> Result<Project> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_json(&text)?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let base = if base.as_os_str().is_empty() {
            std::env::current_dir()?
        } else {
            base
        };
        for warning in config.validate(&base) {
            warn!("{}", warning);
        }
        Project::from_config(config, &base)
    }

    /// Validate the configuration and return a list of warnings
    pub fn validate(&self, base: &Path) -> Vec<String> {
        let mut warnings = Vec::new();
        let root = self.resolve_root(base);

        if self.src_dirs.is_empty() && self.test_dirs.is_empty() {
            warnings.push("no srcDirs or testDirs configured; nothing will be watched".to_string());
        }
        for dir in self.src_dirs.iter().chain(&self.test_dirs) {
            if !root.join(dir).is_dir() {
                warnings.push(format!("root '{}' does not exist under {}", dir, root.display()));
            }
        }
        for ext in &self.extensions {
            if !ext.starts_with('.') {
                warnings.push(format!("extension '{}' should start with '.'", ext));
            }
        }
        let out = normalize_path(&root.join(&self.out_dir));
        for dir in self.src_dirs.iter().chain(&self.test_dirs) {
            let dir = normalize_path(&root.join(dir));
            if out.starts_with(&dir) {
                warnings.push(format!(
                    "outDir {} lies inside watched root {}; its writes are ignored",
                    out.display(),
                    dir.display()
                ));
            }
        }
        warnings
    }

    fn resolve_root(&self, base: &Path) -> PathBuf {
        match &self.root {
            Some(root) => normalize_path(&base.join(root)),
            None => normalize_path(base),
        }
    }
}

/// Fully resolved project settings shared by every component
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub src_dirs: Vec<PathBuf>,
    pub test_dirs: Vec<PathBuf>,
    pub extensions: Vec<String>,
    /// Alias prefixes, longest first
    pub aliases: Vec<(String, PathBuf)>,
    pub out_dir: PathBuf,
    pub external: Vec<String>,
    pub critical: CriticalMatcher,
    pub policy: ReloadPolicy,
    pub debounce: Duration,
    pub transport: TransportConfig,
}

impl Project {
    /// Resolve a config against a base directory
    pub fn from_config(config: HmrConfig, base: &Path) -> Result<Self> {
        let base = if base.is_absolute() {
            base.to_path_buf()
        } else {
            std::env::current_dir()?.join(base)
        };
        let root = config.resolve_root(&base);
        let resolve = |dirs: &[String]| -> Vec<PathBuf> {
            dirs.iter().map(|d| normalize_path(&root.join(d))).collect()
        };

        let mut aliases: Vec<(String, PathBuf)> = config
            .aliases
            .iter()
            .map(|(prefix, target)| {
                let prefix = prefix.trim_end_matches('*').to_string();
                let target = target.trim_end_matches('*');
                (prefix, normalize_path(&root.join(target)))
            })
            .collect();
        aliases.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        let critical = CriticalMatcher::new(&root, &config.critical)?;

        Ok(Self {
            src_dirs: resolve(&config.src_dirs),
            test_dirs: resolve(&config.test_dirs),
            extensions: config.extensions,
            aliases,
            out_dir: normalize_path(&root.join(&config.out_dir)),
            external: config.external,
            critical,
            policy: config.reload_policy,
            debounce: Duration::from_millis(config.debounce_ms),
            transport: config.transport,
            root,
        })
    }

    /// Kind of a path, decided by the deepest configured root containing it
    pub fn file_kind(&self, path: &Path) -> FileKind {
        let deepest = |dirs: &[PathBuf]| {
            dirs.iter()
                .filter(|d| path.starts_with(d))
                .map(|d| d.components().count())
                .max()
        };
        match (deepest(&self.src_dirs), deepest(&self.test_dirs)) {
            (Some(s), Some(t)) if t >= s => FileKind::Test,
            (Some(_), _) => FileKind::Source,
            (None, Some(_)) => FileKind::Test,
            (None, None) => FileKind::Unknown,
        }
    }

    /// Build the file node for a path
    pub fn node(&self, path: &Path) -> FileNode {
        let path = normalize_path(path);
        let kind = self.file_kind(&path);
        // Test files are never critical.
        let critical = kind == FileKind::Source && self.critical.is_critical(&path);
        FileNode { path, kind, critical }
    }

    /// Whether the path carries one of the configured extensions
    pub fn has_source_extension(&self, path: &Path) -> bool {
        let name = path.to_string_lossy();
        self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    /// Whether a path should be tracked by the watcher and the graph
    pub fn is_tracked_file(&self, path: &Path) -> bool {
        !path.starts_with(&self.out_dir)
            && self.file_kind(path) != FileKind::Unknown
            && self.has_source_extension(path)
    }

    /// Every configured root, sources first
    pub fn roots(&self) -> impl Iterator<Item = &PathBuf> {
        self.src_dirs.iter().chain(self.test_dirs.iter())
    }

    /// Logical bundle name: root-relative path without extension, `/` separated
    pub fn logical_name(&self, path: &Path) -> String {
        let rel = match path.strip_prefix(&self.root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => Path::new("__external").join(path.strip_prefix("/").unwrap_or(path)),
        };
        let mut name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if let Some(ext) = self
            .extensions
            .iter()
            .filter(|ext| name.ends_with(ext.as_str()))
            .max_by_key(|ext| ext.len())
        {
            name.truncate(name.len() - ext.len());
        }
        name
    }

    /// Sibling that owns this file's output path.
    ///
    /// `util.ts` and `util.js` share the logical name `src/util`; the file
    /// whose extension comes first in `extensions` (the one an extensionless
    /// import resolves to) wins while it exists.
    pub fn shadowed_by(&self, path: &Path) -> Option<PathBuf> {
        let name = path.to_string_lossy();
        let (rank, ext) = self
            .extensions
            .iter()
            .enumerate()
            .filter(|(_, ext)| name.ends_with(ext.as_str()))
            .max_by_key(|(_, ext)| ext.len())?;
        let stem = &name[..name.len() - ext.len()];
        self.extensions[..rank]
            .iter()
            .map(|earlier| PathBuf::from(format!("{}{}", stem, earlier)))
            .find(|sibling| sibling.is_file())
    }

    /// Where the bundler emits the output for a source path
    pub fn output_path(&self, path: &Path) -> PathBuf {
        if path.starts_with(&self.out_dir) {
            return path.to_path_buf();
        }
        let logical = self.logical_name(path);
        if self.has_source_extension(path) {
            self.out_dir.join(format!("{}.js", logical))
        } else {
            // Directories keep their shape so removals can be matched by prefix.
            self.out_dir.join(logical)
        }
    }
}
