//! Change classification
//!
//! Maps a batch of changed files and the kind of change to the cheapest
//! update strategy that is still safe. The decision is a pure function of
//! the file kinds, their critical flags, the change kind and the policy.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ReloadPolicy;
use crate::files::FileNode;

/// What happened to the changed paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
    DirectoryAdded,
    DirectoryRemoved,
}

impl ChangeKind {
    pub fn is_removal(self) -> bool {
        matches!(self, ChangeKind::Removed | ChangeKind::DirectoryRemoved)
    }

    pub fn is_addition(self) -> bool {
        matches!(self, ChangeKind::Added | ChangeKind::DirectoryAdded)
    }

    /// Combine two kinds reported for the same path within one batch.
    ///
    /// An addition stays an addition even if it was then modified.
    pub fn merge(self, later: ChangeKind) -> ChangeKind {
        if self.is_addition() && later == ChangeKind::Modified {
            self
        } else {
            later
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "add"),
            ChangeKind::Modified => write!(f, "change"),
            ChangeKind::Removed => write!(f, "unlink"),
            ChangeKind::DirectoryAdded => write!(f, "addDir"),
            ChangeKind::DirectoryRemoved => write!(f, "unlinkDir"),
        }
    }
}

/// Update strategy, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateKind {
    TestUpdate,
    Update,
    FullReload,
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateKind::TestUpdate => write!(f, "test-update"),
            UpdateKind::Update => write!(f, "update"),
            UpdateKind::FullReload => write!(f, "full-reload"),
        }
    }
}

/// A strategy decision with its human-readable reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStrategy {
    pub kind: UpdateKind,
    pub reason: String,
}

impl UpdateStrategy {
    fn new(kind: UpdateKind, reason: &str) -> Self {
        Self {
            kind,
            reason: reason.to_string(),
        }
    }

    /// Keep whichever of the two is more severe; ties keep `self`
    pub fn most_severe(self, other: UpdateStrategy) -> UpdateStrategy {
        if other.kind > self.kind {
            other
        } else {
            self
        }
    }
}

pub const REASON_TEST_ONLY: &str = "test files changed - incremental update";
pub const REASON_CRITICAL_REMOVED: &str = "critical source file/directory removed";
pub const REASON_REMOVED: &str = "non-critical removal - updating dependents";
pub const REASON_ADDED: &str = "new files added - building";
pub const REASON_CRITICAL_MODIFIED: &str = "critical source file changed";
pub const REASON_MODIFIED: &str = "source files changed - updating";
pub const REASON_ALWAYS_RELOAD: &str = "source files changed (always-reload policy)";
pub const REASON_NEVER_RELOAD: &str = "source files changed (never-reload policy)";

/// Decide the update strategy for one batch of changes
pub fn classify(changed: &[FileNode], kind: ChangeKind, policy: ReloadPolicy) -> UpdateStrategy {
    let any_source = changed.iter().any(FileNode::is_source);
    let any_test = changed.iter().any(FileNode::is_test);
    let any_critical = changed.iter().any(|f| f.is_source() && f.critical);

    if !any_source && any_test {
        return UpdateStrategy::new(UpdateKind::TestUpdate, REASON_TEST_ONLY);
    }

    if kind.is_removal() {
        return if any_critical {
            UpdateStrategy::new(UpdateKind::FullReload, REASON_CRITICAL_REMOVED)
        } else {
            UpdateStrategy::new(UpdateKind::Update, REASON_REMOVED)
        };
    }

    if kind.is_addition() {
        return UpdateStrategy::new(UpdateKind::Update, REASON_ADDED);
    }

    match policy {
        ReloadPolicy::AlwaysReload if any_source => {
            UpdateStrategy::new(UpdateKind::FullReload, REASON_ALWAYS_RELOAD)
        }
        ReloadPolicy::NeverReload if any_source => {
            UpdateStrategy::new(UpdateKind::Update, REASON_NEVER_RELOAD)
        }
        ReloadPolicy::Smart if any_critical => {
            UpdateStrategy::new(UpdateKind::FullReload, REASON_CRITICAL_MODIFIED)
        }
        _ => UpdateStrategy::new(UpdateKind::Update, REASON_MODIFIED),
    }
}

/// Classify a batch holding several change kinds: each kind group is
/// classified on its own and the most severe decision wins.
pub fn classify_mixed(groups: &[(ChangeKind, Vec<FileNode>)], policy: ReloadPolicy) -> Option<UpdateStrategy> {
    groups
        .iter()
        .filter(|(_, files)| !files.is_empty())
        .map(|(kind, files)| classify(files, *kind, policy))
        .reduce(UpdateStrategy::most_severe)
}
