use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use patrol::accounts::{
    load_accounts, partition_accounts, AccountQueue, AccountRegistry, CredentialRotator,
};
use patrol::config::Config;
use patrol::dispatch::{DispatchError, Dispatcher, LaunchOptions};
use patrol::spawns::{FileSpawnRepository, SpawnSource};
use patrol::stats::StatsAggregator;
use patrol::store::{MemorySightingStore, SightingStore};
use patrol::worker::{FieldSimulator, VisitHandler, Worker};

#[derive(Parser)]
#[command(
    name = "patrol",
    version,
    about = "Field-agent dispatch simulator with travel-time scheduling and credential rotation",
    long_about = None
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "patrol.toml")]
    config: PathBuf,

    /// Run the bootstrap procedure even if spawn data is known
    #[arg(long)]
    bootstrap: bool,

    /// Do not load spawns or accounts from snapshots
    #[arg(long)]
    no_snapshot: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, default_value = "text")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        Config::from_env()
    };
    config.validate()?;

    setup_tracing(&config.logging.level, &cli.log_format, cli.verbose)?;
    tracing::info!("patrol starting up");

    std::fs::create_dir_all(&config.paths.data_dir).with_context(|| {
        format!(
            "failed to create data directory {}",
            config.paths.data_dir.display()
        )
    })?;

    // Collaborators: the sighting store and the simulated field protocol.
    let store: Arc<dyn SightingStore> = Arc::new(MemorySightingStore::new());
    let handler: Arc<dyn VisitHandler> = Arc::new(FieldSimulator::new(&config.sim));

    // Account pool: registry plus the two work queues.
    let registry = Arc::new(AccountRegistry::new());
    let available = Arc::new(AccountQueue::new("available"));
    let verification = Arc::new(AccountQueue::new("verification"));

    let accounts = load_accounts(
        &config.paths.accounts_file,
        &config.paths.accounts_snapshot(),
        !cli.no_snapshot,
    )?;
    let (ready, pending, retired) =
        partition_accounts(accounts, &registry, &available, &verification);
    tracing::info!(ready, pending, retired, "account pool loaded");

    // Worker pool, one slot per grid cell, each seeded with a credential
    // while they last.
    let pool_size = config.area.pool_size();
    let workers: Arc<Vec<Arc<Worker>>> = Arc::new(
        (0..pool_size)
            .map(|i| Worker::new(i, handler.clone(), store.clone(), available.try_pop()))
            .collect(),
    );
    tracing::info!(workers = pool_size, "worker pool created");

    let paused = Arc::new(AtomicBool::new(false));
    let rotator = CredentialRotator::new(
        available.clone(),
        verification.clone(),
        registry.clone(),
        workers.clone(),
        config.rotation.clone(),
        paused.clone(),
    );

    // Shutdown signal: ctrl-c or SIGTERM flips the watch.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    spawn_signal_listener(shutdown_tx.clone());

    let rotation_handles = rotator.spawn_timers(shutdown_rx.clone());

    let spawns = SpawnSource::new(
        Arc::new(FileSpawnRepository::new(&config.paths.spawn_db)),
        config.paths.spawn_snapshot(),
    );

    let mut dispatcher = Dispatcher::new(
        &config,
        workers.clone(),
        store.clone(),
        rotator,
        registry.clone(),
        spawns,
        paused,
        shutdown_rx.clone(),
    );

    let stats = StatsAggregator::new(
        dispatcher.handle(),
        workers,
        available,
        verification,
        store,
        config.area.grid_cols,
    );
    let stats_handle = stats.spawn(Duration::from_secs(30), shutdown_rx);

    // Run until the stop signal or the fault limit.
    let opts = LaunchOptions {
        force_bootstrap: cli.bootstrap,
        load_snapshot: !cli.no_snapshot,
    };
    let run_result = dispatcher.run(opts).await;

    // Whatever ended the run, bring everything else down with it.
    let _ = shutdown_tx.send(true);

    let outcome = match run_result {
        Err(DispatchError::Cancelled) => {
            tracing::info!("stop signal received, shutting down");
            Ok(())
        }
        Err(e) => Err(e),
        Ok(()) => Ok(()),
    };

    let abandoned = dispatcher.drain().await;
    if abandoned > 0 {
        tracing::warn!(abandoned, "some visit tasks did not finish in time");
    }

    tracing::info!("writing shutdown snapshots");
    if let Err(e) = dispatcher.spawns().write_snapshot().await {
        tracing::warn!("spawn snapshot write failed: {e}");
    }
    write_account_snapshot(&registry, &config.paths.accounts_snapshot()).await;

    for handle in rotation_handles {
        let _ = handle.await;
    }
    let _ = stats_handle.await;

    outcome?;
    tracing::info!("patrol shut down cleanly");
    Ok(())
}

async fn write_account_snapshot(registry: &Arc<AccountRegistry>, path: &Path) {
    let registry = registry.clone();
    let path = path.to_path_buf();
    let written = tokio::task::spawn_blocking(move || registry.snapshot_to(&path)).await;
    match written {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("account snapshot write failed: {e}"),
        Err(e) => tracing::warn!("account snapshot task failed: {e}"),
    }
}

fn spawn_signal_listener(shutdown_tx: Arc<watch::Sender<bool>>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::warn!("stop signal caught");
        let _ = shutdown_tx.send(true);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::error!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn setup_tracing(level: &str, format: &str, verbose: bool) -> Result<()> {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("patrol=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_new(format!("patrol={level},warn"))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("patrol=info,warn"))
    };

    match format {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
