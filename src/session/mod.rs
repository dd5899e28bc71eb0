//! Watch session
//!
//! Owns the file inventory and wires watcher events into the dependency
//! graph, the rebuild scheduler and the transport bridge. Removals never go
//! through a rebuild pass: the removed files are purged from the graph and a
//! single content-less update is sent for them, after which the files that
//! imported them are queued for rebuilding.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::bundler::Bundler;
use crate::classifier::{classify, ChangeKind, UpdateKind, UpdateStrategy};
use crate::config::Project;
use crate::error::Result;
use crate::files::normalize_path;
use crate::graph::DependencyGraph;
use crate::scheduler::RebuildScheduler;
use crate::transport::{now_millis, HmrUpdateMessage, TransportBridge};
use crate::watcher::{EventTranslator, FileWatcher, WatchEvent};

/// One watch-and-rebuild session over a project
#[derive(Debug)]
pub struct HmrSession {
    project: Arc<Project>,
    graph: Arc<Mutex<DependencyGraph>>,
    scheduler: RebuildScheduler,
    bridge: TransportBridge,
    all_files: BTreeSet<PathBuf>,
    dirs: BTreeSet<PathBuf>,
    ready: bool,
}

impl HmrSession {
    pub fn new(project: Arc<Project>, bundler: Arc<dyn Bundler>, bridge: TransportBridge) -> Self {
        let graph = Arc::new(Mutex::new(DependencyGraph::new()));
        let scheduler = RebuildScheduler::new(project.clone(), graph.clone(), bundler, bridge.clone());
        Self {
            project,
            graph,
            scheduler,
            bridge,
            all_files: BTreeSet::new(),
            dirs: BTreeSet::new(),
            ready: false,
        }
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn graph(&self) -> &Arc<Mutex<DependencyGraph>> {
        &self.graph
    }

    pub fn scheduler(&self) -> &RebuildScheduler {
        &self.scheduler
    }

    pub fn bridge(&self) -> &TransportBridge {
        &self.bridge
    }

    /// Every tracked file currently known to exist
    pub fn all_files(&self) -> &BTreeSet<PathBuf> {
        &self.all_files
    }

    /// Whether the watcher reported `ready`
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Walk every root, record tracked files and directories, and scan
    /// their imports into the graph. Returns the number of files found.
    pub fn initial_scan(&mut self) -> usize {
        let roots: Vec<PathBuf> = self.project.roots().cloned().collect();
        let mut found = Vec::new();
        for root in &roots {
            found.extend(self.scan_dir(root));
        }
        let scanned = self.graph.lock().rebuild_entries(&self.project, &found);
        info!(files = found.len(), scanned, dirs = self.dirs.len(), "initial scan finished");
        found.len()
    }

    /// Record everything below `dir`; returns tracked files not seen before
    fn scan_dir(&mut self, dir: &Path) -> Vec<PathBuf> {
        let mut new_files = Vec::new();
        for entry in WalkDir::new(dir).follow_links(false).into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("cannot scan {}: {}", dir.display(), e);
                    continue;
                }
            };
            let path = normalize_path(entry.path());
            if path.starts_with(&self.project.out_dir) {
                continue;
            }
            if entry.file_type().is_dir() {
                self.dirs.insert(path);
            } else if self.project.is_tracked_file(&path) && self.all_files.insert(path.clone()) {
                new_files.push(path);
            }
        }
        new_files
    }

    /// Build every known file once
    pub async fn initial_build(&self) -> Result<usize> {
        let files: Vec<PathBuf> = self.all_files.iter().cloned().collect();
        self.scheduler.initial_build(&files).await
    }

    /// Translator seeded with the directories found so far
    pub fn translator(&self) -> EventTranslator {
        EventTranslator::new(self.dirs.iter().cloned())
    }

    /// React to one watcher event
    pub fn handle_event(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Add(path) => self.handle_file_change(path, ChangeKind::Added),
            WatchEvent::Change(path) => self.handle_file_change(path, ChangeKind::Modified),
            WatchEvent::Unlink(path) => {
                self.handle_file_remove(&normalize_path(&path));
            }
            WatchEvent::AddDir(path) => self.handle_directory_add(&normalize_path(&path)),
            WatchEvent::UnlinkDir(path) => {
                self.handle_directory_remove(&normalize_path(&path));
            }
            WatchEvent::Ready => {
                self.ready = true;
                info!(files = self.all_files.len(), "watcher ready");
            }
        }
    }

    fn handle_file_change(&mut self, path: PathBuf, kind: ChangeKind) {
        let path = normalize_path(&path);
        if !self.project.is_tracked_file(&path) {
            debug!(file = %path.display(), "ignoring untracked file");
            return;
        }
        self.all_files.insert(path.clone());
        self.scheduler.enqueue(path, kind);
    }

    fn handle_directory_add(&mut self, dir: &Path) {
        if dir.starts_with(&self.project.out_dir) {
            return;
        }
        let added = self.scan_dir(dir);
        debug!(dir = %dir.display(), files = added.len(), "directory added");
        for file in added {
            self.scheduler.enqueue(file, ChangeKind::DirectoryAdded);
        }
    }

    /// A tracked file was deleted
    pub fn handle_file_remove(&mut self, path: &Path) -> Option<UpdateStrategy> {
        let known = self.all_files.remove(path);
        if !known && !self.graph.lock().contains(path) {
            debug!(file = %path.display(), "ignoring removal of unknown file");
            return None;
        }
        self.remove_paths(&[path.to_path_buf()], ChangeKind::Removed, path)
    }

    /// A directory was deleted: drop every tracked file below it
    pub fn handle_directory_remove(&mut self, dir: &Path) -> Option<UpdateStrategy> {
        self.dirs.retain(|d| !d.starts_with(dir));
        let removed: Vec<PathBuf> = self
            .all_files
            .iter()
            .filter(|f| f.starts_with(dir))
            .cloned()
            .collect();
        for file in &removed {
            self.all_files.remove(file);
        }
        if removed.is_empty() {
            debug!(dir = %dir.display(), "removed directory held no tracked files");
            return None;
        }
        self.remove_paths(&removed, ChangeKind::DirectoryRemoved, dir)
    }

    fn remove_paths(&mut self, removed: &[PathBuf], kind: ChangeKind, reported: &Path) -> Option<UpdateStrategy> {
        let gone: BTreeSet<&PathBuf> = removed.iter().collect();

        // Dependents must be read before the edges disappear.
        let (direct, transitive) = {
            let mut graph = self.graph.lock();
            let mut direct = BTreeSet::new();
            let mut transitive = BTreeSet::new();
            for file in removed {
                direct.extend(graph.dependents_of(file).into_iter().filter(|d| !gone.contains(d)));
                transitive.extend(
                    graph
                        .transitive_dependents(file)
                        .into_iter()
                        .filter(|d| !gone.contains(d)),
                );
            }
            for file in removed {
                graph.remove_file(file);
            }
            (direct, transitive)
        };
        for file in removed {
            self.scheduler.forget(file);
        }

        let nodes: Vec<_> = removed.iter().map(|f| self.project.node(f)).collect();
        let strategy = classify(&nodes, kind, self.project.policy);
        let affected_tests: Vec<String> = transitive
            .iter()
            .filter(|p| self.project.node(p).is_test())
            .map(|p| self.project.output_path(p).to_string_lossy().into_owned())
            .collect();

        self.bridge.send(&HmrUpdateMessage {
            kind: strategy.kind,
            path: self.project.output_path(reported).to_string_lossy().into_owned(),
            timestamp: now_millis(),
            content: None,
            affected_tests: (!affected_tests.is_empty()).then_some(affected_tests),
            reason: strategy.reason.clone(),
        });
        info!(
            path = %reported.display(),
            files = removed.len(),
            kind = %strategy.kind,
            "{}",
            strategy.reason
        );

        if strategy.kind != UpdateKind::FullReload && !direct.is_empty() {
            self.scheduler.enqueue_dependents(direct);
        }
        Some(strategy)
    }

    /// Consume watcher events until `shutdown` resolves or the stream ends,
    /// then stop the watcher, let the scheduler settle and close the bridge.
    pub async fn run<F>(
        mut self,
        mut events: mpsc::UnboundedReceiver<WatchEvent>,
        watcher: Option<FileWatcher>,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("watcher event stream ended");
                        break;
                    }
                },
            }
        }

        if let Some(watcher) = watcher {
            watcher.stop();
        }
        events.close();
        self.scheduler.idle().await;
        let dropped = self.bridge.close();
        info!(dropped, "session closed");
        Ok(())
    }
}
