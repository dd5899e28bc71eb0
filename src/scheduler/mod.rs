//! Rebuild scheduler
//!
//! Coalesces bursts of file changes into rebuild passes and guarantees that
//! at most one pass, and so one bundler invocation, runs at a time.
//!
//! Every enqueued change gets a ticket. A single driver task drains the
//! pending set, runs a pass, publishes the ticket range the pass covered
//! and loops while more changes arrived in the meantime. Callers waiting on
//! a ticket resume once the pass that drained it settles, and see that
//! pass's outcome.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bundler::{BuildCache, BuildConfig, BundleError, Bundler};
use crate::classifier::{classify, classify_mixed, ChangeKind, UpdateStrategy};
use crate::config::Project;
use crate::error::{Error, Result};
use crate::files::{FileKind, FileNode};
use crate::graph::DependencyGraph;
use crate::transport::{now_millis, HmrUpdateMessage, TransportBridge};

// ---------------------------------------------------------------------------
// PendingChangeSet
// ---------------------------------------------------------------------------

/// Files accumulated between passes, with the directly touched subset
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PendingChangeSet {
    changes: BTreeMap<PathBuf, ChangeKind>,
    direct: BTreeSet<PathBuf>,
}

/// Contents of a drained [`PendingChangeSet`]
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainedChanges {
    pub changes: Vec<(PathBuf, ChangeKind)>,
    pub direct: BTreeSet<PathBuf>,
}

impl PendingChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a file the watcher reported
    pub fn insert_direct(&mut self, path: PathBuf, kind: ChangeKind) {
        let merged = match self.changes.get(&path) {
            Some(earlier) => earlier.merge(kind),
            None => kind,
        };
        self.changes.insert(path.clone(), merged);
        self.direct.insert(path);
    }

    /// Record a file pulled in because something it depends on changed
    pub fn insert_transitive(&mut self, path: PathBuf) {
        self.changes.entry(path).or_insert(ChangeKind::Modified);
    }

    /// Drop a path, e.g. because it was removed before the next pass
    pub fn forget(&mut self, path: &Path) -> bool {
        self.direct.remove(path);
        self.changes.remove(path).is_some()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.changes.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Take everything, leaving the set empty
    pub fn drain(&mut self) -> DrainedChanges {
        DrainedChanges {
            changes: std::mem::take(&mut self.changes).into_iter().collect(),
            direct: std::mem::take(&mut self.direct),
        }
    }
}

// ---------------------------------------------------------------------------
// RebuildScheduler
// ---------------------------------------------------------------------------

/// Failed passes remembered for waiters that have not looked yet
const FAILURE_HISTORY: usize = 64;

/// Tickets drained by one pass that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPass {
    pub first_ticket: u64,
    pub last_ticket: u64,
    pub error: String,
}

impl FailedPass {
    pub fn covers(&self, ticket: u64) -> bool {
        (self.first_ticket..=self.last_ticket).contains(&ticket)
    }
}

/// Progress published after every pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassStatus {
    /// Every ticket up to this one has been handled
    pub settled_through: u64,
    /// Passes that reached the drain step
    pub passes: u64,
    /// Bundler invocations, retries included
    pub builds: u64,
    /// Failure of the most recently settled pass
    pub last_error: Option<String>,
    /// Recent failed passes, oldest first
    pub failures: VecDeque<FailedPass>,
}

#[derive(Default)]
struct SchedulerState {
    pending: PendingChangeSet,
    rebuilding: bool,
    next_ticket: u64,
    /// Highest ticket already taken by a drain
    drained_through: u64,
    cache: Option<BuildCache>,
}

struct Shared {
    project: Arc<Project>,
    graph: Arc<Mutex<DependencyGraph>>,
    bundler: Arc<dyn Bundler>,
    bridge: TransportBridge,
    state: Mutex<SchedulerState>,
    status: watch::Sender<PassStatus>,
}

/// Serialised, coalescing rebuild loop
#[derive(Clone)]
pub struct RebuildScheduler {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RebuildScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("RebuildScheduler")
            .field("pending", &state.pending.len())
            .field("rebuilding", &state.rebuilding)
            .field("next_ticket", &state.next_ticket)
            .finish()
    }
}

impl RebuildScheduler {
    pub fn new(
        project: Arc<Project>,
        graph: Arc<Mutex<DependencyGraph>>,
        bundler: Arc<dyn Bundler>,
        bridge: TransportBridge,
    ) -> Self {
        let (status, _) = watch::channel(PassStatus::default());
        Self {
            shared: Arc::new(Shared {
                project,
                graph,
                bundler,
                bridge,
                state: Mutex::new(SchedulerState::default()),
                status,
            }),
        }
    }

    /// Queue a change and start a pass unless one is already running.
    ///
    /// Returns the change's ticket. Must be called inside a Tokio runtime.
    pub fn enqueue(&self, path: PathBuf, kind: ChangeKind) -> u64 {
        let mut state = self.shared.state.lock();
        debug!(file = %path.display(), %kind, "queued change");
        state.pending.insert_direct(path, kind);
        self.ticket_and_kick(&mut state)
    }

    /// Queue files that must be rebuilt because something they import changed
    pub fn enqueue_dependents(&self, paths: impl IntoIterator<Item = PathBuf>) -> u64 {
        let mut state = self.shared.state.lock();
        for path in paths {
            state.pending.insert_transitive(path);
        }
        self.ticket_and_kick(&mut state)
    }

    fn ticket_and_kick(&self, state: &mut SchedulerState) -> u64 {
        state.next_ticket += 1;
        if !state.rebuilding {
            state.rebuilding = true;
            tokio::spawn(drive(self.shared.clone()));
        }
        state.next_ticket
    }

    /// Queue a change and wait until the pass covering it has settled.
    ///
    /// Fails with [`Error::Rebuild`] when that pass failed.
    pub async fn queue_change(&self, path: PathBuf, kind: ChangeKind) -> Result<()> {
        let ticket = self.enqueue(path, kind);
        self.wait_settled(ticket).await
    }

    /// Wait until `ticket` is covered by a settled pass.
    ///
    /// Fails when the pass that drained this ticket failed, whatever later
    /// passes did.
    pub async fn wait_settled(&self, ticket: u64) -> Result<()> {
        let mut rx = self.shared.status.subscribe();
        let status = rx
            .wait_for(|s| s.settled_through >= ticket)
            .await
            .map_err(|_| Error::Rebuild("scheduler stopped".to_string()))?;
        match status.failures.iter().find(|f| f.covers(ticket)) {
            Some(failed) => Err(Error::Rebuild(failed.error.clone())),
            None => Ok(()),
        }
    }

    /// Wait until everything queued so far has been handled, failures included
    pub async fn idle(&self) {
        let ticket = self.shared.state.lock().next_ticket;
        let _ = self.wait_settled(ticket).await;
    }

    /// Drop a queued path; the removal path handles it instead
    pub fn forget(&self, path: &Path) -> bool {
        self.shared.state.lock().pending.forget(path)
    }

    pub fn is_rebuilding(&self) -> bool {
        self.shared.state.lock().rebuilding
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Latest published pass status
    pub fn status(&self) -> PassStatus {
        self.shared.status.borrow().clone()
    }

    /// Build every file once, without notifying the host.
    ///
    /// Intended for start-up, before the watcher delivers events.
    pub async fn initial_build(&self, files: &[PathBuf]) -> Result<usize> {
        {
            let mut state = self.shared.state.lock();
            if state.rebuilding {
                return Err(Error::Rebuild("initial build while a pass is running".to_string()));
            }
            state.rebuilding = true;
        }

        let nodes = build_entries(&self.shared.project, files);
        let built = nodes.len();
        let result = if nodes.is_empty() {
            Ok(None)
        } else {
            let mut builds = 0;
            build_with_retry(&self.shared, &nodes, None, &mut builds).await
        };

        let mut state = self.shared.state.lock();
        if let Ok(Some(cache)) = &result {
            state.cache = Some(cache.clone());
        }
        state.rebuilding = false;
        if !state.pending.is_empty() {
            state.rebuilding = true;
            tokio::spawn(drive(self.shared.clone()));
        }
        drop(state);

        result?;
        info!(files = built, "initial build finished");
        Ok(built)
    }
}

/// Driver task: runs passes back to back until nothing is pending
async fn drive(shared: Arc<Shared>) {
    loop {
        {
            let mut state = shared.state.lock();
            if state.pending.is_empty() {
                state.rebuilding = false;
                let through = state.next_ticket;
                state.drained_through = through;
                shared.status.send_if_modified(|s| {
                    let moved = s.settled_through < through;
                    s.settled_through = s.settled_through.max(through);
                    moved
                });
                return;
            }
        }

        if !shared.project.debounce.is_zero() {
            tokio::time::sleep(shared.project.debounce).await;
        }

        let (batch, first, through, cache) = {
            let mut state = shared.state.lock();
            if state.pending.is_empty() {
                continue;
            }
            let first = state.drained_through + 1;
            state.drained_through = state.next_ticket;
            (state.pending.drain(), first, state.next_ticket, state.cache.clone())
        };

        let (outcome, builds) = run_pass(&shared, batch, cache).await;
        let last_error = match outcome {
            Ok(Some(cache)) => {
                shared.state.lock().cache = Some(cache);
                None
            }
            Ok(None) => None,
            Err(e) => {
                error!("rebuild failed:\n{}", e);
                Some(e.to_string())
            }
        };

        shared.status.send_modify(|s| {
            s.settled_through = s.settled_through.max(through);
            s.passes += 1;
            s.builds += builds;
            if let Some(error) = &last_error {
                s.failures.push_back(FailedPass {
                    first_ticket: first,
                    last_ticket: through,
                    error: error.clone(),
                });
                if s.failures.len() > FAILURE_HISTORY {
                    s.failures.pop_front();
                }
            }
            s.last_error = last_error;
        });
    }
}

/// One pass over a drained batch. Returns the new cache, if the bundler ran,
/// and how many times the bundler was invoked.
async fn run_pass(
    shared: &Shared,
    batch: DrainedChanges,
    cache: Option<BuildCache>,
) -> (Result<Option<BuildCache>>, u64) {
    let project = &shared.project;

    let existing: Vec<(PathBuf, ChangeKind)> = batch
        .changes
        .into_iter()
        .filter(|(path, _)| {
            let exists = path.exists();
            if !exists {
                warn!(file = %path.display(), "skipping deleted file");
            }
            exists
        })
        .collect();
    if existing.is_empty() {
        debug!("nothing left to rebuild");
        return (Ok(None), 0);
    }

    let roots: Vec<PathBuf> = existing.iter().map(|(p, _)| p.clone()).collect();
    let affected = {
        let mut graph = shared.graph.lock();
        let affected = graph.affected_closure(&roots);
        graph.rebuild_entries(project, &affected);
        affected
    };

    let nodes = build_entries(project, &affected);
    if nodes.is_empty() {
        debug!("no buildable files in affected set");
        return (Ok(None), 0);
    }
    info!(
        changed = existing.len(),
        affected = nodes.len(),
        "rebuilding"
    );

    let mut builds = 0;
    let cache = match build_with_retry(shared, &nodes, cache, &mut builds).await {
        Ok(Some(cache)) => cache,
        Ok(None) => return (Ok(None), builds),
        Err(e) => return (Err(e), builds),
    };

    let strategy = strategy_for(project, &existing, &batch.direct);
    let affected_tests: Vec<String> = nodes
        .iter()
        .filter(|n| n.is_test() && n.path.exists())
        .map(|n| project.output_path(&n.path).to_string_lossy().into_owned())
        .collect();

    let mut sent = 0;
    for node in nodes.iter().filter(|n| n.path.exists()) {
        let out = project.output_path(&node.path);
        let content = match tokio::fs::read_to_string(&out).await {
            Ok(content) => content,
            Err(e) => {
                warn!(out = %out.display(), "cannot read build output: {}", e);
                continue;
            }
        };
        shared.bridge.send(&HmrUpdateMessage {
            kind: strategy.kind,
            path: out.to_string_lossy().into_owned(),
            timestamp: now_millis(),
            content: Some(content),
            affected_tests: (!affected_tests.is_empty()).then(|| affected_tests.clone()),
            reason: strategy.reason.clone(),
        });
        sent += 1;
    }
    info!(kind = %strategy.kind, sent, "{}", strategy.reason);

    (Ok(Some(cache)), builds)
}

/// Invoke the bundler, retrying once with re-filtered entries when one
/// vanished mid-build. `Ok(None)` means every entry vanished.
async fn build_with_retry(
    shared: &Shared,
    nodes: &[FileNode],
    cache: Option<BuildCache>,
    builds: &mut u64,
) -> Result<Option<BuildCache>> {
    let mut config = build_config(&shared.project, nodes.iter().map(|n| n.path.as_path()), cache);
    *builds += 1;
    match shared.bundler.build(config.clone()).await {
        Ok(cache) => Ok(Some(cache)),
        Err(BundleError::UnresolvedEntry(entry)) => {
            warn!(entry = %entry.display(), "entry vanished during build, retrying");
            config.input.retain(|_, path| path.exists());
            if config.input.is_empty() {
                info!("every entry vanished, abandoning pass");
                return Ok(None);
            }
            *builds += 1;
            Ok(Some(shared.bundler.build(config).await?))
        }
        Err(e) => Err(e.into()),
    }
}

/// Existing source and test files among `files`, first occurrence kept.
///
/// A file whose output path belongs to a sibling with an earlier extension
/// is left out so the two never overwrite each other's output.
fn build_entries(project: &Project, files: &[PathBuf]) -> Vec<FileNode> {
    let mut seen = BTreeSet::new();
    let nodes: Vec<FileNode> = files
        .iter()
        .filter(|p| p.exists() && seen.insert(p.to_path_buf()))
        .filter(|p| match project.shadowed_by(p) {
            Some(owner) => {
                warn!(
                    file = %p.display(),
                    owner = %owner.display(),
                    "output name taken by sibling, not building"
                );
                false
            }
            None => true,
        })
        .map(|p| project.node(p))
        .filter(|n| n.kind != FileKind::Unknown)
        .collect();
    let tests = nodes.iter().filter(|n| n.is_test()).count();
    debug!(sources = nodes.len() - tests, tests, "build entries");
    nodes
}
fn build_config<'a>(
    project: &Project,
    entries: impl Iterator<Item = &'a Path>,
    cache: Option<BuildCache>,
) -> BuildConfig {
    BuildConfig {
        input: entries
            .map(|p| (project.logical_name(p), p.to_path_buf()))
            .collect(),
        out_dir: project.out_dir.clone(),
        external: project.external.clone(),
        cache,
    }
}

/// Classify the directly changed files of a pass, grouped by change kind.
///
/// A pass holding only transitively queued files is classified as a whole.
fn strategy_for(
    project: &Project,
    existing: &[(PathBuf, ChangeKind)],
    direct: &BTreeSet<PathBuf>,
) -> UpdateStrategy {
    let mut direct_only: Vec<&(PathBuf, ChangeKind)> =
        existing.iter().filter(|(p, _)| direct.contains(p)).collect();
    if direct_only.is_empty() {
        direct_only = existing.iter().collect();
    }

    let mut groups: BTreeMap<ChangeKind, Vec<FileNode>> = BTreeMap::new();
    for (path, kind) in direct_only {
        groups.entry(*kind).or_default().push(project.node(path));
    }
    let groups: Vec<(ChangeKind, Vec<FileNode>)> = groups.into_iter().collect();
    classify_mixed(&groups, project.policy)
        .unwrap_or_else(|| classify(&[], ChangeKind::Modified, project.policy))
}
