//! Filesystem watcher
//!
//! Wraps a `notify` watcher and turns its raw events into the
//! `add` / `change` / `unlink` / `addDir` / `unlinkDir` / `ready` stream the
//! session consumes. A deleted path can no longer be stat'ed, so the
//! translator remembers which paths are directories.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Normalised watcher event; paths are absolute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Add(PathBuf),
    Change(PathBuf),
    Unlink(PathBuf),
    AddDir(PathBuf),
    UnlinkDir(PathBuf),
    /// Every root is being watched
    Ready,
}

impl WatchEvent {
    pub fn path(&self) -> Option<&Path> {
        match self {
            WatchEvent::Add(p)
            | WatchEvent::Change(p)
            | WatchEvent::Unlink(p)
            | WatchEvent::AddDir(p)
            | WatchEvent::UnlinkDir(p) => Some(p),
            WatchEvent::Ready => None,
        }
    }
}

/// Converts `notify` events, tracking known directories
#[derive(Debug, Default, Clone)]
pub struct EventTranslator {
    dirs: BTreeSet<PathBuf>,
}

impl EventTranslator {
    /// Start with the directories found by the initial scan
    pub fn new(dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            dirs: dirs.into_iter().collect(),
        }
    }

    pub fn is_known_dir(&self, path: &Path) -> bool {
        self.dirs.contains(path)
    }

    pub fn translate(&mut self, event: &Event) -> Vec<WatchEvent> {
        let mut out = Vec::new();
        match &event.kind {
            EventKind::Create(kind) => {
                for path in &event.paths {
                    let is_dir = match kind {
                        CreateKind::Folder => true,
                        CreateKind::File => false,
                        _ => path.is_dir(),
                    };
                    out.push(self.added(path, is_dir));
                }
            }
            EventKind::Remove(kind) => {
                for path in &event.paths {
                    let is_dir = match kind {
                        RemoveKind::Folder => true,
                        RemoveKind::File => false,
                        _ => self.is_known_dir(path),
                    };
                    out.push(self.removed(path, is_dir));
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => match (mode, event.paths.as_slice()) {
                (RenameMode::Both, [from, to]) => {
                    let was_dir = self.is_known_dir(from) || to.is_dir();
                    out.push(self.removed(from, was_dir));
                    out.push(self.added(to, to.is_dir()));
                }
                (RenameMode::From, paths) => {
                    for path in paths {
                        let was_dir = self.is_known_dir(path);
                        out.push(self.removed(path, was_dir));
                    }
                }
                (_, paths) => {
                    for path in paths {
                        if path.exists() {
                            out.push(self.added(path, path.is_dir()));
                        } else {
                            let was_dir = self.is_known_dir(path);
                            out.push(self.removed(path, was_dir));
                        }
                    }
                }
            },
            EventKind::Modify(ModifyKind::Metadata(_)) => {}
            EventKind::Modify(_) => {
                for path in event.paths.iter().filter(|p| p.is_file()) {
                    out.push(WatchEvent::Change(path.clone()));
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }
        out
    }

    fn added(&mut self, path: &Path, is_dir: bool) -> WatchEvent {
        if is_dir {
            self.dirs.insert(path.to_path_buf());
            WatchEvent::AddDir(path.to_path_buf())
        } else {
            WatchEvent::Add(path.to_path_buf())
        }
    }

    fn removed(&mut self, path: &Path, is_dir: bool) -> WatchEvent {
        if is_dir {
            self.dirs.retain(|d| !d.starts_with(path));
            WatchEvent::UnlinkDir(path.to_path_buf())
        } else {
            WatchEvent::Unlink(path.to_path_buf())
        }
    }
}

/// Live recursive watch over the project roots
pub struct FileWatcher {
    watcher: RecommendedWatcher,
    roots: Vec<PathBuf>,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher").field("roots", &self.roots).finish()
    }
}

impl FileWatcher {
    /// Watch every existing root and send translated events to `tx`.
    ///
    /// [`WatchEvent::Ready`] is sent once all roots are registered.
    pub fn start(
        roots: &[PathBuf],
        mut translator: EventTranslator,
        tx: mpsc::UnboundedSender<WatchEvent>,
    ) -> Result<Self> {
        let events = tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for translated in translator.translate(&event) {
                        debug!(?translated, "watch event");
                        let _ = events.send(translated);
                    }
                }
                Err(e) => warn!("watcher error: {}", e),
            },
            notify::Config::default(),
        )?;

        let mut watched = Vec::new();
        for root in roots {
            if !root.is_dir() {
                warn!(root = %root.display(), "root does not exist, not watching it");
                continue;
            }
            watcher.watch(root, RecursiveMode::Recursive)?;
            watched.push(root.clone());
        }
        info!(roots = watched.len(), "watching for changes");
        let _ = tx.send(WatchEvent::Ready);

        Ok(Self {
            watcher,
            roots: watched,
        })
    }

    /// Stop delivering events
    pub fn stop(mut self) {
        for root in &self.roots {
            if let Err(e) = self.watcher.unwatch(root) {
                debug!(root = %root.display(), "unwatch failed: {}", e);
            }
        }
        info!("watcher stopped");
    }
}
