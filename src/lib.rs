//! jasmine-hmr: incremental rebuild and hot suite update for Jasmine specs
//!
//! Watches a project's source and spec roots, keeps a bidirectional module
//! dependency graph, classifies every change into an update strategy,
//! rebuilds only the affected files and pushes the result to a running test
//! host, which detaches and re-attaches just the suites of the changed
//! modules.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use jasmine_hmr::{HmrConfig, HmrSession, PassthroughBundler, TransportBridge};
//!
//! # async fn run() -> jasmine_hmr::Result<()> {
//! let project = Arc::new(HmrConfig::load(Path::new("jasmine-hmr.json"))?);
//! let mut session = HmrSession::new(project, Arc::new(PassthroughBundler), TransportBridge::new());
//! session.initial_scan();
//! session.initial_build().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Module Overview
//!
//! The pipeline flows: [`watcher`] → [`graph`] → [`classifier`] → [`scheduler`] → [`transport`] → [`host`] / [`mutator`] → [`reporter`]
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Core** | [`graph`], [`classifier`], [`scheduler`], [`mutator`], [`transport`] |
//! | **Project** | [`config`], [`files`], [`bundler`], [`error`](Error) |
//! | **Runtime** | [`watcher`], [`session`], [`host`], [`reporter`] |

pub mod bundler;
pub mod classifier;
pub mod config;
pub mod files;
pub mod graph;
pub mod host;
pub mod mutator;
pub mod reporter;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod watcher;

mod error;

pub use bundler::{BuildCache, BuildConfig, BundleError, Bundler, PassthroughBundler};
pub use classifier::{classify, ChangeKind, UpdateKind, UpdateStrategy};
pub use config::{HmrConfig, Project, ReloadPolicy, TransportConfig};
pub use error::{Error, Result};
pub use files::{FileKind, FileNode};
pub use graph::DependencyGraph;
pub use mutator::{LiveSuiteMutator, SuiteHost, SuiteNode};
pub use scheduler::RebuildScheduler;
pub use session::HmrSession;
pub use transport::{HmrUpdateMessage, HostMessage, TransportBridge};

/// jasmine-hmr version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
