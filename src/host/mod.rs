//! Host-side update agent
//!
//! Applies [`HmrUpdateMessage`]s to a running framework instance through the
//! [`LiveSuiteMutator`], answers with the `hmr:*` messages the orchestrator
//! expects, and works out which specs need to run again.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::classifier::UpdateKind;
use crate::mutator::{specs_for, HotSwapReport, LiveSuiteMutator, SuiteHost, SuiteNode};
use crate::reporter::SpecStatus;
use crate::transport::{HmrUpdateMessage, HostMessage};

/// Spec ordering for the host's runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOrder {
    pub random: bool,
    /// Fixed seed; drawn once when absent
    pub seed: Option<u64>,
}

impl Default for RunOrder {
    fn default() -> Self {
        Self {
            random: true,
            seed: None,
        }
    }
}

/// What applying one update did
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The module was detached and re-imported
    Swapped(HotSwapReport),
    /// Every tracked module under the path was detached for good
    Removed { files: usize, detached: usize },
    /// The tree was rebuilt from scratch by re-importing every module
    Reloaded { modules: usize },
    /// Re-import threw; the module's old suites are gone
    Failed(String),
}

/// Result of [`HostAgent::apply`]
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedUpdate {
    pub outcome: ApplyOutcome,
    /// Reply for the orchestrator (`hmr:ready` or `hmr:error`)
    pub reply: HostMessage,
    /// Spec ids to execute next, in run order
    pub rerun: Vec<String>,
}

/// Drives a [`SuiteHost`] from update messages
#[derive(Debug)]
pub struct HostAgent<H: SuiteHost> {
    host: H,
    mutator: LiveSuiteMutator,
    /// Last content seen per module, replayed on full reload
    modules: BTreeMap<String, Option<String>>,
    order: RunOrder,
    seed: u64,
}

impl<H: SuiteHost> HostAgent<H> {
    pub fn new(host: H, order: RunOrder) -> Self {
        let seed = order.seed.unwrap_or_else(|| rand::thread_rng().gen());
        info!(random = order.random, seed, "host agent ready");
        Self {
            host,
            mutator: LiveSuiteMutator::new(),
            modules: BTreeMap::new(),
            order,
            seed,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn mutator(&self) -> &LiveSuiteMutator {
        &self.mutator
    }

    /// Seed used for random ordering
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Import a module for the first time (or again) and tag its suites
    pub fn load(&mut self, path: &str, content: Option<&str>) -> ApplyOutcome {
        self.modules
            .insert(path.to_string(), content.map(str::to_string));
        match self.mutator.hot_swap(&mut self.host, path, content) {
            Ok(report) => ApplyOutcome::Swapped(report),
            Err(e) => ApplyOutcome::Failed(e.to_string()),
        }
    }

    /// Apply one update from the orchestrator
    pub fn apply(&mut self, message: &HmrUpdateMessage) -> AppliedUpdate {
        debug!(path = %message.path, kind = %message.kind, "applying update");

        let outcome = if message.kind == UpdateKind::FullReload {
            let gone = match &message.content {
                Some(content) => {
                    self.modules
                        .insert(message.path.clone(), Some(content.clone()));
                    Vec::new()
                }
                None => self.forget_under(&message.path),
            };
            let outcome = self.reload();
            for file in &gone {
                self.mutator.remove_file(&mut self.host, file);
            }
            outcome
        } else if message.is_removal() {
            self.remove(&message.path)
        } else {
            self.load(&message.path, message.content.as_deref())
        };

        let reply = match &outcome {
            ApplyOutcome::Failed(error) => {
                warn!(path = %message.path, "update failed: {}", error);
                HostMessage::Error {
                    error: error.clone(),
                }
            }
            _ => HostMessage::Ready,
        };

        let rerun = match &outcome {
            ApplyOutcome::Reloaded { .. } => self.run_plan(),
            _ => self.rerun_for(message),
        };
        AppliedUpdate {
            outcome,
            reply,
            rerun,
        }
    }

    fn remove(&mut self, path: &str) -> ApplyOutcome {
        let files = self.mutator.tracked_under(path);
        let mut detached = 0;
        for file in &files {
            detached += self.mutator.remove_file(&mut self.host, file);
            self.modules.remove(file);
        }
        ApplyOutcome::Removed {
            files: files.len(),
            detached,
        }
    }

    /// Drop known modules equal to `path` or below it so a reload skips them
    fn forget_under(&mut self, path: &str) -> Vec<String> {
        let dir = format!("{}/", path.trim_end_matches('/'));
        let gone: Vec<String> = self
            .modules
            .keys()
            .filter(|p| p.as_str() == path || p.starts_with(&dir))
            .cloned()
            .collect();
        for file in &gone {
            self.modules.remove(file);
        }
        gone
    }

    /// Discard the tree and re-import every known module in load order
    fn reload(&mut self) -> ApplyOutcome {
        let root = self.host.top_suite();
        *root = SuiteNode::new(root.id.clone(), root.description.clone());
        self.mutator.reset();

        let modules: Vec<(String, Option<String>)> =
            self.modules.iter().map(|(p, c)| (p.clone(), c.clone())).collect();
        for (path, content) in &modules {
            if let Err(e) = self.mutator.hot_swap(&mut self.host, path, content.as_deref()) {
                return ApplyOutcome::Failed(e.to_string());
            }
        }
        info!(modules = modules.len(), "suite tree reloaded");
        ApplyOutcome::Reloaded {
            modules: modules.len(),
        }
    }

    /// Specs of the updated module plus those of every affected test
    fn rerun_for(&mut self, message: &HmrUpdateMessage) -> Vec<String> {
        let mut paths = vec![message.path.as_str()];
        if let Some(tests) = &message.affected_tests {
            paths.extend(tests.iter().map(String::as_str));
        }
        let root = self.host.top_suite();
        let mut ids: Vec<String> = Vec::new();
        for path in paths {
            for id in specs_for(root, path) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        self.ordered(ids)
    }

    /// Every spec in the tree, in run order
    pub fn run_plan(&mut self) -> Vec<String> {
        let mut ids = Vec::new();
        self.host.top_suite().for_each_spec(&mut |spec| ids.push(spec.id.clone()));
        self.ordered(ids)
    }

    fn ordered(&self, mut ids: Vec<String>) -> Vec<String> {
        if self.order.random {
            let mut rng = StdRng::seed_from_u64(self.seed);
            ids.shuffle(&mut rng);
        }
        ids
    }

    /// Store a `specDone` result on the matching spec
    pub fn record_result(&mut self, result: &Value) -> bool {
        let Some(id) = result.get("id").and_then(Value::as_str) else {
            return false;
        };
        let status = SpecStatus::from_result(result);
        match self.host.top_suite().spec_mut(id) {
            Some(spec) => {
                spec.result = Some(status);
                true
            }
            None => false,
        }
    }
}
