//! shipyardd: the Shipyard daemon.
//!
//! Assembles the release-target engine in one process:
//! - Entity store, restored from the changelog on start
//! - Orchestrator tick loop (indexes, taint, reconcile enqueue)
//! - Worker pool running the desired-release reconciler
//!
//! # Usage
//!
//! ```text
//! shipyardd --config shipyard.toml run --seed changes.json
//! shipyardd --config shipyard.toml replay
//! shipyardd config
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use shipyard_changelog::{ChangelogLog, ChangelogReader, ChangelogWriter, MemoryChangelog, RedbChangelog};
use shipyard_core::{
    ChangeSet, ChangelogSection, QueueSection, SharedClock, ShipyardConfig, StorageBackend,
    SystemClock,
};
use shipyard_engine::{DESIRED_RELEASE_KIND, Orchestrator};
use shipyard_queue::{MemoryWorkQueue, RedbWorkQueue, WorkQueue, Worker, WorkerConfig};
use shipyard_state::Store;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shipyardd", about = "Shipyard release-target engine daemon")]
struct Cli {
    /// Configuration file; built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator and the worker pool until Ctrl-C.
    Run {
        /// JSON change set applied once after start-up.
        #[arg(long)]
        seed: Option<PathBuf>,
    },
    /// Rebuild the store from the changelog and print per-kind counts.
    Replay,
    /// Print the effective configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Run { seed } => run(config, seed).await,
        Command::Replay => replay(config).await,
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,shipyard=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ShipyardConfig> {
    let config = match path {
        Some(path) => ShipyardConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ShipyardConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn open_changelog(section: &ChangelogSection) -> anyhow::Result<Arc<dyn ChangelogLog>> {
    Ok(match section.backend {
        StorageBackend::Memory => Arc::new(MemoryChangelog::new(section.partitions)),
        StorageBackend::Redb => {
            ensure_parent(&section.path)?;
            let log = RedbChangelog::open(&section.path, section.partitions)?;
            info!(path = ?section.path, partitions = section.partitions, "changelog opened");
            Arc::new(log)
        }
    })
}

fn open_queue(section: &QueueSection, clock: SharedClock) -> anyhow::Result<Arc<dyn WorkQueue>> {
    Ok(match section.backend {
        StorageBackend::Memory => Arc::new(MemoryWorkQueue::new(clock)),
        StorageBackend::Redb => {
            ensure_parent(&section.path)?;
            let queue = RedbWorkQueue::open(&section.path, clock)?;
            info!(path = ?section.path, "work queue opened");
            Arc::new(queue)
        }
    })
}

async fn run(config: ShipyardConfig, seed: Option<PathBuf>) -> anyhow::Result<()> {
    info!(workspace = %config.engine.workspace_id, "Shipyard daemon starting");
    let clock = SystemClock::shared();
    let cancel = CancellationToken::new();

    // ── Subsystems ─────────────────────────────────────────────

    let log = open_changelog(&config.changelog)?;
    let queue = open_queue(&config.queue, Arc::clone(&clock))?;
    let orchestrator = Orchestrator::new(
        &config.engine,
        Arc::new(Store::new()),
        Arc::clone(&queue),
        Arc::clone(&clock),
    );
    let loaded = orchestrator
        .restore(&ChangelogReader::new(Arc::clone(&log)), &cancel)
        .await?;
    info!(loaded, "store restored");
    let orchestrator =
        Arc::new(orchestrator.with_changelog(ChangelogWriter::new(log, Arc::clone(&clock))));

    if let Some(path) = seed {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading seed {}", path.display()))?;
        let changes: ChangeSet = serde_json::from_str(&raw)
            .with_context(|| format!("parsing seed {}", path.display()))?;
        let applied = orchestrator.apply_changeset(changes)?;
        info!(applied, path = %path.display(), "seed change set applied");
    }

    let worker = Worker::new(
        WorkerConfig::from_section(DESIRED_RELEASE_KIND, &config.worker),
        queue,
        Arc::new(orchestrator.reconciler()),
        clock,
    )?;
    info!(
        worker_id = %worker.config().worker_id,
        concurrency = worker.config().max_concurrency,
        "worker initialized"
    );

    // ── Background tasks ───────────────────────────────────────

    let tick_handle = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        let cancel = cancel.clone();
        async move { orchestrator.run(cancel).await }
    });
    let worker_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    // Graceful shutdown on Ctrl-C.
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C; shutting down");
    }
    info!("shutdown signal received");
    cancel.cancel();

    let orchestrator_clean = join_task("orchestrator", tick_handle).await;
    let worker_clean = join_task("worker", worker_handle).await;
    info!(clean = orchestrator_clean && worker_clean, "Shipyard daemon stopped");
    Ok(())
}

/// Waits for a background task, logging how it ended. Returns whether it
/// finished without panicking.
async fn join_task(name: &str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            error!(task = name, error = %e, "background task failed");
            false
        }
    }
}

async fn replay(config: ShipyardConfig) -> anyhow::Result<()> {
    let clock = SystemClock::shared();
    let log = open_changelog(&config.changelog)?;
    let store = Arc::new(Store::new());
    let orchestrator = Orchestrator::new(
        &config.engine,
        Arc::clone(&store),
        Arc::new(MemoryWorkQueue::new(Arc::clone(&clock))),
        clock,
    );
    let loaded = orchestrator
        .restore(&ChangelogReader::new(log), &CancellationToken::new())
        .await?;

    println!("workspace {} ({loaded} entities)", config.engine.workspace_id);
    for (kind, count) in store.counts() {
        if count > 0 {
            println!("  {:<26} {count}", kind.as_str());
        }
    }
    println!("  {:<26} {}", "releaseTarget", store.release_target_count());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_task_reports_panics() {
        assert!(join_task("quiet", tokio::spawn(async {})).await);
        let panicking: JoinHandle<()> = tokio::spawn(async { panic!("orchestrator blew up") });
        assert!(!join_task("loud", panicking).await);
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["shipyardd", "--log-format", "json", "run", "--seed", "s.json"])
            .unwrap();
        assert!(cli.log_format == LogFormat::Json);
        assert!(matches!(cli.command, Command::Run { seed: Some(_) }));

        let cli = Cli::try_parse_from(["shipyardd", "replay", "--config", "x.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(matches!(cli.command, Command::Replay));
    }

    #[test]
    fn missing_config_uses_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config, ShipyardConfig::default());
    }

    #[test]
    fn config_file_is_loaded_and_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shipyard.toml");
        std::fs::write(&path, "[engine]\nworkspace_id = \"acme\"\n").unwrap();
        assert_eq!(load_config(Some(&path)).unwrap().engine.workspace_id, "acme");

        std::fs::write(&path, "[worker]\nlease_duration_ms = 10\nlease_heartbeat_ms = 20\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn bundled_demo_files_parse() {
        let changes: ChangeSet = serde_json::from_str(include_str!("../../../demos/seed.json")).unwrap();
        assert_eq!(changes.len(), 6);
        let config: ShipyardConfig =
            toml::from_str(include_str!("../../../demos/shipyard.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.queue.backend, StorageBackend::Redb);
    }

    #[test]
    fn redb_backends_create_their_directories() {
        let dir = tempfile::tempdir().unwrap();
        let section = ChangelogSection {
            backend: StorageBackend::Redb,
            partitions: 4,
            path: dir.path().join("nested/changelog.redb"),
        };
        let log = open_changelog(&section).unwrap();
        assert_eq!(log.partitions(), 4);
        assert!(section.path.exists());
    }
}
