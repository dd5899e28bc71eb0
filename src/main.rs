//! jasmine-hmr CLI
//!
//! Watches a project and keeps a running Jasmine host up to date.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use jasmine_hmr::config::DEFAULT_CONFIG_FILE;
use jasmine_hmr::reporter::{self, ConsoleReporter};
use jasmine_hmr::transport::{ipc::ChildProcessChannel, websocket};
use jasmine_hmr::watcher::FileWatcher;
use jasmine_hmr::{HmrConfig, HmrSession, PassthroughBundler, TransportBridge, TransportConfig, VERSION};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "jasmine-hmr")]
#[command(author, version, about = "Dependency-aware hot rebuild loop for Jasmine specs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Build once, then watch and push updates to the test host
    Watch {
        /// Configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },

    /// Validate a configuration file and print the resolved project
    Check {
        /// Configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let result = match cli.command {
        Commands::Watch { config } => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start runtime")
            .and_then(|rt| rt.block_on(run_watch(&config))),
        Commands::Check { config } => run_check(&config),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn setup_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_target(false)
        .init();
}

fn run_check(path: &Path) -> anyhow::Result<()> {
    let project = HmrConfig::load(path)?;
    println!("jasmine-hmr {}", VERSION);
    println!("  root:      {}", project.root.display());
    for dir in &project.src_dirs {
        println!("  source:    {}", dir.display());
    }
    for dir in &project.test_dirs {
        println!("  tests:     {}", dir.display());
    }
    println!("  output:    {}", project.out_dir.display());
    println!("  policy:    {:?}", project.policy);
    println!("  transport: {:?}", project.transport);
    Ok(())
}

enum Channel {
    Socket {
        stop: oneshot::Sender<()>,
        server: tokio::task::JoinHandle<jasmine_hmr::Result<()>>,
    },
    Child(ChildProcessChannel),
}

impl Channel {
    fn open(bridge: &TransportBridge, transport: &TransportConfig) -> anyhow::Result<Self> {
        Ok(match transport {
            TransportConfig::Websocket { addr } => {
                let (stop, stopped) = oneshot::channel::<()>();
                let server = tokio::spawn(websocket::serve(bridge.clone(), *addr, async move {
                    let _ = stopped.await;
                }));
                Channel::Socket { stop, server }
            }
            TransportConfig::Child { command } => Channel::Child(ChildProcessChannel::spawn(bridge.clone(), command)?),
        })
    }

    async fn close(self) -> anyhow::Result<()> {
        match self {
            Channel::Socket { stop, server } => {
                let _ = stop.send(());
                server.await.context("websocket task panicked")??;
            }
            Channel::Child(child) => {
                child.shutdown().await?;
            }
        }
        Ok(())
    }
}

async fn run_watch(config: &Path) -> anyhow::Result<()> {
    let project = Arc::new(HmrConfig::load(config)?);
    let bridge = TransportBridge::new();
    let console = Arc::new(Mutex::new(ConsoleReporter::new(true)));
    reporter::attach(&bridge, console.clone());

    let mut session = HmrSession::new(project.clone(), Arc::new(PassthroughBundler), bridge.clone());
    session.initial_scan();
    session.initial_build().await.context("initial build failed")?;

    let channel = Channel::open(&bridge, &project.transport)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let roots: Vec<PathBuf> = project.roots().cloned().collect();
    let watcher = FileWatcher::start(&roots, session.translator(), tx)?;

    info!("press Ctrl-C to stop");
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    session.run(rx, Some(watcher), shutdown).await?;
    channel.close().await?;

    let console = console.lock();
    info!(runs = console.runs().len(), errors = console.hmr_errors.len(), "stopped");
    Ok(())
}
