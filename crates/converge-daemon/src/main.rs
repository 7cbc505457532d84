//! converge-daemon: Headless vault sync daemon.
//!
//! Watches a vault directory, polls a directory-backed remote store, and runs
//! convergence cycles until interrupted.

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use converge_core::clock::{Clock, SystemClock};
use converge_core::config::{DEFAULT_QUOTA, SyncConfig};
use converge_core::entity::Provenance;
use converge_core::filter::PathFilter;
use converge_core::fold::TouchedPaths;
use converge_core::persist::StateCodec;
use converge_core::remote::{RemoteStore, TracedRemote};
use converge_core::{DeviceId, SyncEngine};

use converge_daemon::persistence::{StateStorage, load_or_create_device_id};
use converge_daemon::{DirRemote, FileEvent, FileWatcher, NativeFs};

/// Cycles to run back to back while the quota leaves work deferred.
const MAX_CATCH_UP_CYCLES: usize = 100;

#[derive(Parser, Debug)]
#[command(name = "converge-daemon")]
#[command(about = "Vault sync daemon")]
struct Args {
    /// Path to the vault directory
    #[arg(short, long)]
    vault: PathBuf,

    /// Directory holding the shared remote store
    #[arg(short, long, env = "CONVERGE_REMOTE")]
    remote: PathBuf,

    /// Device ID, 16 hex chars (generated and saved in the vault if not provided)
    #[arg(long, env = "CONVERGE_DEVICE_ID")]
    device_id: Option<DeviceId>,

    #[arg(long, env = "CONVERGE_USER_ID", default_value = "local")]
    user_id: String,

    #[arg(long, env = "CONVERGE_VAULT_ID", default_value = "default")]
    vault_id: String,

    /// Vault path prefix to leave out of sync (repeatable)
    #[arg(long = "exclude", value_name = "PREFIX")]
    excludes: Vec<String>,

    /// Maximum actions executed per cycle
    #[arg(long, default_value_t = DEFAULT_QUOTA)]
    quota: usize,

    /// Seconds between remote polls
    #[arg(long, default_value_t = 30)]
    interval_secs: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

type Remote = Arc<TracedRemote<DirRemote>>;

/// Daemon state holding all components.
struct Daemon {
    engine: SyncEngine<NativeFs, Remote, Remote>,
    storage: StateStorage,
    watcher: FileWatcher,
    /// Paths changed since the last successful cycle.
    touched: TouchedPaths,
}

impl Daemon {
    /// Record a file change for the next cycle.
    fn on_file_event(&mut self, event: FileEvent) {
        let observed = self.touched.entry(event.path).or_insert(0);
        *observed = (*observed).max(event.observed_at);
    }

    /// Run cycles until nothing is deferred, then persist.
    async fn sync(&mut self) {
        let mut touched = mem::take(&mut self.touched);

        for _ in 0..MAX_CATCH_UP_CYCLES {
            match self.engine.run_cycle(&touched).await {
                Ok(report) => {
                    touched.clear();
                    for (path, kind, e) in &report.failures {
                        warn!("{} {} will be retried: {}", kind, path, e);
                    }
                    if report.deferred == 0 {
                        break;
                    }
                    debug!("{} action(s) deferred, running another cycle", report.deferred);
                }
                Err(e) => {
                    error!("Sync cycle failed: {}", e);
                    // Keep the observations for the next attempt.
                    for (path, time) in touched {
                        let observed = self.touched.entry(path).or_insert(0);
                        *observed = (*observed).max(time);
                    }
                    break;
                }
            }
        }

        if let Err(e) = self
            .storage
            .save(self.engine.state(), self.engine.watermark())
        {
            error!("Failed to save state: {:#}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,converge_daemon=debug,converge_core=debug"
    } else {
        "info,converge_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting converge-daemon");
    info!("Vault path: {:?}", args.vault);
    info!("Remote path: {:?}", args.remote);

    let device_id = match args.device_id {
        Some(id) => id,
        None => load_or_create_device_id(&args.vault)?,
    };
    info!("Device ID: {}", device_id);

    let path_filter = args
        .excludes
        .iter()
        .fold(PathFilter::new(), |filter, prefix| filter.exclude_prefix(prefix.as_str()));
    if !args.excludes.is_empty() {
        info!("Excluding: {:?}", args.excludes);
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let config = SyncConfig::new(Provenance {
        device_id,
        user_id: args.user_id,
        vault_id: args.vault_id,
        sync_config_id: "default".into(),
    })
    .with_quota(args.quota)
    .with_filter(path_filter.clone());

    let remote: Remote = Arc::new(TracedRemote::new(
        DirRemote::open(&args.remote, Arc::clone(&clock)).await?,
    ));
    let fs = NativeFs::with_filter(args.vault.clone(), path_filter.clone());

    let storage = StateStorage::new(&args.vault, StateCodec::default());
    let mut engine = SyncEngine::new(fs, Arc::clone(&remote), remote, clock, config);
    if let Some(saved) = storage.load()? {
        info!(
            "Loaded state: {} path(s), watermark {}",
            saved.entities.len(),
            saved.watermark
        );
        engine = engine.with_state(saved.entities, saved.watermark);
    } else {
        info!("No saved state, starting fresh");
    }

    let touched = engine.startup_touched().await?;
    let watcher = FileWatcher::new(args.vault.clone(), path_filter)?;
    info!("File watcher started");

    let mut daemon = Daemon {
        engine,
        storage,
        watcher,
        touched,
    };
    daemon.sync().await;

    let mut feed = daemon.engine.remote().subscribe();
    let mut poll = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    info!("Daemon running. Press Ctrl+C to stop.");

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = daemon.watcher.event_rx().recv() => {
                daemon.on_file_event(event);
                // Drain whatever else the debouncer delivered in the same batch.
                while let Ok(event) = daemon.watcher.event_rx().try_recv() {
                    daemon.on_file_event(event);
                }
                daemon.sync().await;
            }

            // Stores without a change feed yield nothing here and rely on polling.
            Some(record) = feed.next() => {
                daemon.engine.ingest_remote(record);
                daemon.sync().await;
            }

            _ = poll.tick() => {
                daemon.sync().await;
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    if let Err(e) = daemon
        .storage
        .save(daemon.engine.state(), daemon.engine.watermark())
    {
        error!("Failed to save state on shutdown: {:#}", e);
    }
    info!("Shutting down");
    Ok(())
}
