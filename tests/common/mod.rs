//! Shared test helpers for integration tests

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use jasmine_hmr::mutator::{SpecNode, SuiteHost, SuiteNode};
use jasmine_hmr::{HmrConfig, HmrSession, HmrUpdateMessage, PassthroughBundler, Project, TransportBridge};
use tempfile::TempDir;

/// A throwaway project on disk with `src/` and `spec/` roots
pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("spec")).unwrap();
        Self { dir }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, text: &str) -> PathBuf {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, text).unwrap();
        path
    }

    pub fn project(&self, config: &str) -> Arc<Project> {
        let config = HmrConfig::from_json(config).unwrap();
        Arc::new(Project::from_config(config, self.dir.path()).unwrap())
    }

    /// Session over the fixture using the passthrough bundler, already scanned
    pub fn session(&self, config: &str) -> HmrSession {
        let mut session = HmrSession::new(self.project(config), Arc::new(PassthroughBundler), TransportBridge::new());
        session.initial_scan();
        session
    }
}

/// Output path of a source file as a message path
#[allow(dead_code)]
pub fn out(project: &Project, path: &Path) -> String {
    project.output_path(path).to_string_lossy().into_owned()
}

/// Take every frame queued on the bridge, leaving it disconnected
pub fn drain(bridge: &TransportBridge) -> Vec<HmrUpdateMessage> {
    let mut link = bridge.connect();
    let mut messages = Vec::new();
    while let Some(frame) = link.try_recv() {
        messages.push(serde_json::from_str(&frame).unwrap());
    }
    let id = link.id;
    bridge.disconnect(id, link.into_unsent(None));
    messages
}

/// In-memory framework: a module is a list of `suite:<name>` / `spec:<name>`
/// lines inside `describe`-style comments, e.g. `// spec:adds`.
#[derive(Default)]
pub struct CommentHost {
    pub root: SuiteNode,
    pub imports: Vec<String>,
}

impl SuiteHost for CommentHost {
    fn top_suite(&mut self) -> &mut SuiteNode {
        &mut self.root
    }

    fn import_module(&mut self, path: &str, content: Option<&str>, cache_bust: &str) -> Result<(), String> {
        self.imports.push(format!("{}?{}", path, cache_bust));
        let mut suite: Option<SuiteNode> = None;
        for line in content.unwrap_or_default().lines() {
            let line = line.trim().trim_start_matches("//").trim();
            if line == "throw" {
                return Err(format!("ReferenceError while evaluating {}", path));
            }
            if let Some(name) = line.strip_prefix("suite:") {
                if let Some(done) = suite.take() {
                    self.root.add_suite(done);
                }
                suite = Some(SuiteNode::new(name, name));
            } else if let Some(name) = line.strip_prefix("spec:") {
                let spec = SpecNode::new(name, name);
                match suite.as_mut() {
                    Some(s) => s.add_spec(spec),
                    None => self.root.add_spec(spec),
                }
            }
        }
        if let Some(done) = suite {
            self.root.add_suite(done);
        }
        Ok(())
    }
}
