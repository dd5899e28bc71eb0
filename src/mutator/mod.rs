//! Live suite mutation
//!
//! The running test framework owns a single root suite. After a module is
//! imported, every suite and spec it registered is tagged with the module's
//! path; a hot update detaches exactly the nodes carrying that tag and then
//! re-imports the module, so sibling suites and their results survive.
//!
//! Per tracked file the mutator walks
//! `Untracked -> Tagged -> Detached -> Tagged (next generation) -> ...`
//! and ends in `Removed` once the file itself is deleted.

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;
use tracing::{debug, warn};

use crate::reporter::SpecStatus;

/// Leaf test case
#[derive(Debug, Clone, PartialEq)]
pub struct SpecNode {
    pub id: String,
    pub description: String,
    /// Path of the module that registered this spec
    pub origin: Option<String>,
    /// Outcome of the last execution, if any
    pub result: Option<SpecStatus>,
}

impl SpecNode {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            origin: None,
            result: None,
        }
    }
}

/// Child of a suite, in registration order
#[derive(Debug, Clone, PartialEq)]
pub enum SuiteChild {
    Suite(SuiteNode),
    Spec(SpecNode),
}

impl SuiteChild {
    fn origin(&self) -> Option<&str> {
        match self {
            SuiteChild::Suite(s) => s.origin.as_deref(),
            SuiteChild::Spec(s) => s.origin.as_deref(),
        }
    }
}

/// Grouping node
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SuiteNode {
    pub id: String,
    pub description: String,
    pub origin: Option<String>,
    pub children: Vec<SuiteChild>,
    /// Ids of the specs directly inside this suite, kept in step with `children`
    pub specs: Vec<String>,
}

impl SuiteNode {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    /// Single entry point for growing the tree
    pub fn add_child(&mut self, child: SuiteChild) {
        if let SuiteChild::Spec(spec) = &child {
            self.specs.push(spec.id.clone());
        }
        self.children.push(child);
    }

    pub fn add_suite(&mut self, suite: SuiteNode) {
        self.add_child(SuiteChild::Suite(suite));
    }

    pub fn add_spec(&mut self, spec: SpecNode) {
        self.add_child(SuiteChild::Spec(spec));
    }

    /// Visit every spec in the subtree, depth first
    pub fn for_each_spec<F: FnMut(&SpecNode)>(&self, f: &mut F) {
        for child in &self.children {
            match child {
                SuiteChild::Suite(s) => s.for_each_spec(f),
                SuiteChild::Spec(s) => f(s),
            }
        }
    }

    /// Mutable spec lookup by id
    pub fn spec_mut(&mut self, id: &str) -> Option<&mut SpecNode> {
        for child in &mut self.children {
            let found = match child {
                SuiteChild::Suite(s) => s.spec_mut(id),
                SuiteChild::Spec(s) if s.id == id => Some(s),
                SuiteChild::Spec(_) => None,
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }
}

/// Tag every untagged suite and spec below `root` with `path`.
///
/// The root suite itself is never tagged. Returns the number of nodes tagged.
pub fn tag_suite_tree(root: &mut SuiteNode, path: &str) -> usize {
    let mut tagged = 0;
    for child in &mut root.children {
        match child {
            SuiteChild::Suite(suite) => {
                if suite.origin.is_none() {
                    suite.origin = Some(path.to_string());
                    tagged += 1;
                }
                tagged += tag_suite_tree(suite, path);
            }
            SuiteChild::Spec(spec) => {
                if spec.origin.is_none() {
                    spec.origin = Some(path.to_string());
                    tagged += 1;
                }
            }
        }
    }
    tagged
}

/// Remove every suite or spec tagged with `path`, bottom-up.
///
/// Returns the number of nodes removed, nested ones included.
pub fn detach_by_file(root: &mut SuiteNode, path: &str) -> usize {
    let mut removed = 0;
    for child in &mut root.children {
        if let SuiteChild::Suite(suite) = child {
            removed += detach_by_file(suite, path);
        }
    }

    let mut gone_specs: HashSet<String> = HashSet::new();
    root.children.retain(|child| {
        if child.origin() != Some(path) {
            return true;
        }
        if let SuiteChild::Spec(spec) = child {
            gone_specs.insert(spec.id.clone());
        }
        removed += 1;
        false
    });
    if !gone_specs.is_empty() {
        root.specs.retain(|id| !gone_specs.contains(id));
    }
    removed
}

/// Number of nodes carrying `path` as origin
pub fn count_tagged(root: &SuiteNode, path: &str) -> usize {
    root.children
        .iter()
        .map(|child| {
            let own = usize::from(child.origin() == Some(path));
            match child {
                SuiteChild::Suite(s) => own + count_tagged(s, path),
                SuiteChild::Spec(_) => own,
            }
        })
        .sum()
}

/// Ids of the specs registered by `path`
pub fn specs_for(root: &SuiteNode, path: &str) -> Vec<String> {
    let mut ids = Vec::new();
    root.for_each_spec(&mut |spec| {
        if spec.origin.as_deref() == Some(path) {
            ids.push(spec.id.clone());
        }
    });
    ids
}

/// Capability the running framework exposes to the mutator
pub trait SuiteHost {
    /// The framework's root suite
    fn top_suite(&mut self) -> &mut SuiteNode;

    /// Evaluate a module afresh. `cache_bust` differs on every call so the
    /// module loader cannot hand back a cached instance.
    fn import_module(&mut self, path: &str, content: Option<&str>, cache_bust: &str) -> Result<(), String>;
}

/// Per-file tracking state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Untracked,
    Tagged { generation: u64 },
    Detached { generation: u64 },
    Removed,
}

/// Suite mutation failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MutatorError {
    /// Module evaluation threw; its old suites are already gone
    #[error("re-import of {path} failed: {message}")]
    ImportFailed { path: String, message: String },
}

/// Result of one hot swap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotSwapReport {
    pub detached: usize,
    pub tagged: usize,
    pub generation: u64,
}

/// Drives detach / re-import / tag cycles against a [`SuiteHost`]
#[derive(Debug, Default)]
pub struct LiveSuiteMutator {
    files: BTreeMap<String, TrackState>,
    generation: u64,
}

impl LiveSuiteMutator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, path: &str) -> TrackState {
        self.files.get(path).copied().unwrap_or(TrackState::Untracked)
    }

    /// Detach the file's suites, re-import it, then tag what it registered.
    ///
    /// Detach always completes before the import starts. If the import
    /// fails the file stays `Detached` with no suites in the tree.
    pub fn hot_swap<H: SuiteHost>(
        &mut self,
        host: &mut H,
        path: &str,
        content: Option<&str>,
    ) -> Result<HotSwapReport, MutatorError> {
        let detached = detach_by_file(host.top_suite(), path);
        self.generation += 1;
        let generation = self.generation;
        self.files
            .insert(path.to_string(), TrackState::Detached { generation });

        let cache_bust = format!("hmr={}", generation);
        if let Err(message) = host.import_module(path, content, &cache_bust) {
            warn!(path, "hot swap import failed: {}", message);
            return Err(MutatorError::ImportFailed {
                path: path.to_string(),
                message,
            });
        }

        let tagged = tag_suite_tree(host.top_suite(), path);
        self.files
            .insert(path.to_string(), TrackState::Tagged { generation });
        debug!(path, detached, tagged, generation, "hot swapped");
        Ok(HotSwapReport {
            detached,
            tagged,
            generation,
        })
    }

    /// The file was deleted: detach its suites for good
    pub fn remove_file<H: SuiteHost>(&mut self, host: &mut H, path: &str) -> usize {
        let detached = detach_by_file(host.top_suite(), path);
        self.files.insert(path.to_string(), TrackState::Removed);
        debug!(path, detached, "detached removed file");
        detached
    }

    /// Live tracked files equal to `prefix` or inside it
    pub fn tracked_under(&self, prefix: &str) -> Vec<String> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        self.files
            .iter()
            .filter(|(path, state)| {
                **state != TrackState::Removed && (path.as_str() == prefix || path.starts_with(&dir))
            })
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Every file that currently has suites attached
    pub fn tagged_files(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|(_, state)| matches!(state, TrackState::Tagged { .. }))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Forget all tracking, after the framework was rebuilt from scratch
    pub fn reset(&mut self) {
        self.files.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> SpecNode {
        SpecNode::new(id, format!("spec {}", id))
    }

    /// Host whose modules are `(suite id, [spec ids])` lists.
    #[derive(Default)]
    struct TableHost {
        root: SuiteNode,
        modules: BTreeMap<String, Vec<(String, Vec<String>)>>,
        fail: bool,
        tagged_at_import: Vec<usize>,
        imports: usize,
    }

    impl SuiteHost for TableHost {
        fn top_suite(&mut self) -> &mut SuiteNode {
            &mut self.root
        }

        fn import_module(&mut self, path: &str, _content: Option<&str>, _bust: &str) -> Result<(), String> {
            self.tagged_at_import.push(count_tagged(&self.root, path));
            self.imports += 1;
            if self.fail {
                return Err("SyntaxError: unexpected token".to_string());
            }
            for (suite_id, specs) in self.modules.get(path).cloned().unwrap_or_default() {
                let mut suite = SuiteNode::new(format!("{}#{}", suite_id, self.imports), suite_id);
                for s in specs {
                    suite.add_spec(spec(&format!("{}#{}", s, self.imports)));
                }
                self.root.add_suite(suite);
            }
            Ok(())
        }
    }

    fn host() -> TableHost {
        let mut host = TableHost::default();
        host.modules.insert("/a.js".into(), vec![("A".into(), vec!["a1".into(), "a2".into()])]);
        host.modules.insert("/b.js".into(), vec![("B".into(), vec!["b1".into()])]);
        host
    }

    #[test]
    fn test_tag_only_untagged_nodes() {
        let mut root = SuiteNode::new("root", "");
        let mut s = SuiteNode::new("s1", "first");
        s.add_spec(spec("x"));
        root.add_suite(s);
        assert_eq!(tag_suite_tree(&mut root, "/a.js"), 2);

        root.add_suite(SuiteNode::new("s2", "second"));
        assert_eq!(tag_suite_tree(&mut root, "/b.js"), 1);
        assert_eq!(count_tagged(&root, "/a.js"), 2);
        assert_eq!(count_tagged(&root, "/b.js"), 1);
        assert!(root.origin.is_none());
    }

    #[test]
    fn test_detach_removes_nested_and_flat_specs() {
        let mut root = SuiteNode::new("root", "");
        let mut outer = SuiteNode::new("outer", "outer");
        outer.origin = Some("/a.js".into());
        let mut inner_b = SuiteNode::new("inner", "inner");
        inner_b.origin = Some("/b.js".into());
        let mut stray = spec("stray");
        stray.origin = Some("/b.js".into());
        inner_b.add_spec(stray.clone());
        outer.add_suite(inner_b);
        root.add_suite(outer);
        let mut top_b = stray.clone();
        top_b.id = "top".into();
        root.add_spec(top_b);
        let mut keep = spec("keep");
        keep.origin = Some("/a.js".into());
        root.add_spec(keep);

        let removed = detach_by_file(&mut root, "/b.js");
        assert_eq!(removed, 3);
        assert_eq!(count_tagged(&root, "/b.js"), 0);
        assert_eq!(root.specs, vec!["keep".to_string()]);
        assert_eq!(count_tagged(&root, "/a.js"), 2);
    }

    #[test]
    fn test_hot_swap_replaces_only_own_suites() {
        let mut host = host();
        let mut mutator = LiveSuiteMutator::new();
        mutator.hot_swap(&mut host, "/a.js", None).unwrap();
        mutator.hot_swap(&mut host, "/b.js", None).unwrap();
        let b_before: Vec<SuiteChild> = host
            .root
            .children
            .iter()
            .filter(|c| c.origin() == Some("/b.js"))
            .cloned()
            .collect();

        let report = mutator.hot_swap(&mut host, "/a.js", None).unwrap();
        assert_eq!(report.detached, 3);
        assert_eq!(report.tagged, 3);
        assert_eq!(mutator.state("/a.js"), TrackState::Tagged { generation: 3 });

        let b_after: Vec<SuiteChild> = host
            .root
            .children
            .iter()
            .filter(|c| c.origin() == Some("/b.js"))
            .cloned()
            .collect();
        assert_eq!(b_before, b_after);
        assert_eq!(specs_for(&host.root, "/a.js"), vec!["a1#3", "a2#3"]);
    }

    #[test]
    fn test_detach_happens_before_import() {
        let mut host = host();
        let mut mutator = LiveSuiteMutator::new();
        for _ in 0..3 {
            mutator.hot_swap(&mut host, "/a.js", None).unwrap();
        }
        assert_eq!(host.tagged_at_import, vec![0, 0, 0]);
        assert_eq!(count_tagged(&host.root, "/a.js"), 3);
    }

    #[test]
    fn test_failed_import_leaves_file_detached() {
        let mut host = host();
        let mut mutator = LiveSuiteMutator::new();
        mutator.hot_swap(&mut host, "/a.js", None).unwrap();
        host.fail = true;

        let err = mutator.hot_swap(&mut host, "/a.js", None).unwrap_err();
        assert!(matches!(err, MutatorError::ImportFailed { .. }));
        assert_eq!(count_tagged(&host.root, "/a.js"), 0);
        assert_eq!(mutator.state("/a.js"), TrackState::Detached { generation: 2 });
    }

    #[test]
    fn test_remove_file_is_terminal_and_filtered() {
        let mut host = host();
        let mut mutator = LiveSuiteMutator::new();
        mutator.hot_swap(&mut host, "/a.js", None).unwrap();
        mutator.hot_swap(&mut host, "/b.js", None).unwrap();

        assert_eq!(mutator.remove_file(&mut host, "/a.js"), 3);
        assert_eq!(mutator.state("/a.js"), TrackState::Removed);
        assert_eq!(count_tagged(&host.root, "/a.js"), 0);
        assert_eq!(mutator.tagged_files(), vec!["/b.js".to_string()]);
        assert!(mutator.tracked_under("/a.js").is_empty());
    }

    #[test]
    fn test_tracked_under_prefix() {
        let mut host = TableHost::default();
        let mut mutator = LiveSuiteMutator::new();
        for path in ["/out/spec/a.js", "/out/spec/deep/b.js", "/out/specs.js"] {
            mutator.hot_swap(&mut host, path, None).unwrap();
        }
        assert_eq!(
            mutator.tracked_under("/out/spec"),
            vec!["/out/spec/a.js".to_string(), "/out/spec/deep/b.js".to_string()]
        );
    }

    #[test]
    fn test_spec_mut_finds_nested() {
        let mut root = SuiteNode::new("root", "");
        let mut s = SuiteNode::new("s", "s");
        s.add_spec(spec("deep"));
        root.add_suite(s);
        root.spec_mut("deep").unwrap().result = Some(SpecStatus::Passed);
        let mut seen = Vec::new();
        root.for_each_spec(&mut |sp| seen.push(sp.result.clone()));
        assert_eq!(seen, vec![Some(SpecStatus::Passed)]);
    }
}
