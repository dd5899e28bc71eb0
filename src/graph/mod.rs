//! Module dependency graph
//!
//! Keeps a forward map (file → files it imports) and a reverse map (file →
//! files importing it). The reverse map is always the exact transpose of
//! the forward map; every mutation goes through [`DependencyGraph::set_dependencies`]
//! or [`DependencyGraph::remove_file`], which update both sides together.

pub mod extract;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use tracing::debug;

use crate::config::Project;

pub use extract::{extract_dependencies, resolve_specifier, scan_specifiers};

/// Bidirectional dependency graph keyed by absolute file path
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    dependencies: HashMap<PathBuf, HashSet<PathBuf>>,
    dependents: HashMap<PathBuf, HashSet<PathBuf>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the dependency set of `file`, applying the diff to both maps
    pub fn set_dependencies(&mut self, file: &Path, deps: HashSet<PathBuf>) {
        let old = self.dependencies.remove(file).unwrap_or_default();

        for removed in old.difference(&deps) {
            self.unlink_dependent(removed, file);
        }
        for added in deps.difference(&old) {
            self.dependents
                .entry(added.clone())
                .or_default()
                .insert(file.to_path_buf());
        }

        self.dependencies.insert(file.to_path_buf(), deps);
    }

    /// Recompute the dependency sets of `files` from disk.
    ///
    /// Files that no longer exist are skipped and never enter the graph.
    /// Returns how many files were rescanned.
    pub fn rebuild_entries(&mut self, project: &Project, files: &[PathBuf]) -> usize {
        let mut rescanned = 0;
        for file in files {
            if !file.exists() {
                debug!(file = %file.display(), "skipping graph update for missing file");
                continue;
            }
            let deps = extract_dependencies(project, file);
            self.set_dependencies(file, deps);
            rescanned += 1;
        }
        rescanned
    }

    /// Delete every edge touching `file`, incoming and outgoing
    pub fn remove_file(&mut self, file: &Path) -> bool {
        let outgoing = self.dependencies.remove(file);
        let incoming = self.dependents.remove(file);

        if let Some(deps) = &outgoing {
            for dep in deps {
                self.unlink_dependent(dep, file);
            }
        }
        if let Some(importers) = &incoming {
            for importer in importers {
                if let Some(set) = self.dependencies.get_mut(importer) {
                    set.remove(file);
                }
            }
        }
        outgoing.is_some() || incoming.is_some()
    }

    fn unlink_dependent(&mut self, dep: &Path, importer: &Path) {
        if let Some(set) = self.dependents.get_mut(dep) {
            set.remove(importer);
            if set.is_empty() {
                self.dependents.remove(dep);
            }
        }
    }

    /// Files `file` imports
    pub fn dependencies_of(&self, file: &Path) -> Vec<PathBuf> {
        sorted(self.dependencies.get(file))
    }

    /// Files importing `file`
    pub fn dependents_of(&self, file: &Path) -> Vec<PathBuf> {
        sorted(self.dependents.get(file))
    }

    /// Whether the file has been scanned into the graph
    pub fn contains(&self, file: &Path) -> bool {
        self.dependencies.contains_key(file)
    }

    /// Breadth-first reverse walk from `start`, start files included.
    ///
    /// Every visited file is re-checked against the filesystem; files that
    /// vanished are neither returned nor walked through.
    pub fn affected_closure(&self, start: &[PathBuf]) -> Vec<PathBuf> {
        self.affected_closure_with(start, |p| p.exists())
    }

    /// [`affected_closure`](Self::affected_closure) with an injectable existence check
    pub fn affected_closure_with<F>(&self, start: &[PathBuf], exists: F) -> Vec<PathBuf>
    where
        F: Fn(&Path) -> bool,
    {
        let mut visited: HashSet<PathBuf> = HashSet::default();
        let mut order = Vec::new();
        let mut queue: VecDeque<PathBuf> = VecDeque::new();

        for file in start {
            if visited.insert(file.clone()) {
                queue.push_back(file.clone());
            }
        }

        while let Some(file) = queue.pop_front() {
            if !exists(&file) {
                continue;
            }
            for dependent in self.dependents_of(&file) {
                if visited.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
            order.push(file);
        }
        order
    }

    /// Every file depending on `file` directly or transitively, `file` excluded
    pub fn transitive_dependents(&self, file: &Path) -> Vec<PathBuf> {
        let start: Vec<PathBuf> = self.dependents_of(file);
        let mut closure = self.affected_closure(&start);
        closure.retain(|p| p != file);
        closure
    }

    /// Check that `dependents` is the exact transpose of `dependencies`
    pub fn is_symmetric(&self) -> bool {
        let forward_ok = self.dependencies.iter().all(|(file, deps)| {
            deps.iter()
                .all(|dep| self.dependents.get(dep).is_some_and(|set| set.contains(file)))
        });
        let reverse_ok = self.dependents.iter().all(|(file, importers)| {
            importers.iter().all(|importer| {
                self.dependencies
                    .get(importer)
                    .is_some_and(|set| set.contains(file))
            })
        });
        forward_ok && reverse_ok
    }

    /// Every path mentioned anywhere in the graph
    pub fn referenced_files(&self) -> Vec<PathBuf> {
        let mut all: HashSet<&PathBuf> = HashSet::default();
        for (file, deps) in self.dependencies.iter().chain(self.dependents.iter()) {
            all.insert(file);
            all.extend(deps.iter());
        }
        let mut all: Vec<PathBuf> = all.into_iter().cloned().collect();
        all.sort();
        all
    }

    /// Number of scanned files
    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}

fn sorted(set: Option<&HashSet<PathBuf>>) -> Vec<PathBuf> {
    let mut v: Vec<PathBuf> = set.map(|s| s.iter().cloned().collect()).unwrap_or_default();
    v.sort();
    v
}
