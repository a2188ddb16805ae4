//! # Concordance Archive Manager CLI (`conarc`)
//!
//! | Command | Description |
//! |---------|-------------|
//! | `conarc start [config.json]` | Run the full service (archiver, cleaner, indexer, history GC, HTTP API) |
//! | `conarc init-query-history [config.json]` | One chunk of the initial history index import |
//! | `conarc gc-query-history [config.json]` | One chunk of ad-hoc per-user history garbage collection |
//! | `conarc version` | Print version/build information |
//!
//! Distinct exit codes signal distinct startup failure classes: database
//! open failure = 1, reporting initialization failure = 1, fulltext index
//! open timeout = 10.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use conarc::archiver::ArchKeeper;
use conarc::archstore::{ConcArchiveDryRun, ConcArchiveStore, MySqlConcArchive};
use conarc::cleaner::Cleaner;
use conarc::config::{self, Config, LoggingConfig};
use conarc::db;
use conarc::dedup::Deduplicator;
use conarc::error::ArchiveError;
use conarc::histgc::GarbageCollector;
use conarc::histinit::DataInitializer;
use conarc::histstore::{MySqlQueryHistory, QueryHistoryDryRun, QueryHistoryStore};
use conarc::indexer::{Indexer, IndexerService};
use conarc::kvstore::RedisAdapter;
use conarc::reporting::{LogWriter, Reporting, StatusReporter};
use conarc::server::{self, AppState};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_DATE: &str = match option_env!("BUILD_DATE") {
    Some(v) => v,
    None => "unknown",
};
const GIT_COMMIT: &str = match option_env!("GIT_COMMIT") {
    Some(v) => v,
    None => "unknown",
};

/// Budget for the graceful shutdown of all services.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit code signalling a fulltext index open timeout (stale lock).
const EXIT_INDEX_OPEN_TIMEOUT: u8 = 10;

/// Capacity of the fan-out streams between the archiver and its consumers.
const FANOUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(
    name = "conarc",
    about = "Concordance archive manager - archival, deduplication and query history indexing",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the service.
    Start {
        /// Path to the JSON configuration file.
        #[arg(default_value = "./conarc.json")]
        config: PathBuf,

        /// Instead of writing to the database, report archiver operations
        /// to the log.
        #[arg(long)]
        dry_run: bool,

        /// The cleaner service reports operations to the log without
        /// writing them to the database.
        #[arg(long)]
        dry_run_cleaner: bool,
    },

    /// Run one pass of the initial query history import.
    ///
    /// Can be run multiple times; processing state is preserved between
    /// runs in the key-value store.
    InitQueryHistory {
        /// Path to the JSON configuration file.
        #[arg(default_value = "./conarc.json")]
        config: PathBuf,

        /// How many users to process per run.
        #[arg(long, default_value_t = 100)]
        chunk_size: usize,

        /// Log to console even if a file is specified in the config.
        #[arg(long)]
        console_log: bool,
    },

    /// Run one pass of ad-hoc query history garbage collection.
    GcQueryHistory {
        /// Path to the JSON configuration file.
        #[arg(default_value = "./conarc.json")]
        config: PathBuf,

        /// How many users to process per run.
        #[arg(long, default_value_t = 100)]
        chunk_size: usize,

        /// Log to console even if a file is specified in the config.
        #[arg(long)]
        console_log: bool,
    },

    /// Print version information.
    Version,
}

fn setup_logging(conf: &LoggingConfig, force_console: bool) {
    let level = if conf.level.is_empty() {
        "info".to_owned()
    } else {
        conf.level.clone()
    };
    let filter = tracing_subscriber::EnvFilter::try_new(&level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if conf.path.is_empty() || force_console {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return;
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&conf.path)
    {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(move || file.try_clone().expect("log file handle"))
                .init();
        }
        Err(err) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            tracing::error!(error = %err, path = %conf.path, "cannot open log file, using stderr");
        }
    }
}

fn load_validated_config(path: &PathBuf) -> Result<Config> {
    let mut conf = config::load_config(path)?;
    conf.validate_and_defaults()?;
    Ok(conf)
}

/// Maps a fatal startup error to its exit code.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<ArchiveError>() {
        Some(ArchiveError::IndexOpenTimeout) => EXIT_INDEX_OPEN_TIMEOUT,
        _ => 1,
    }
}

/// Watches for Ctrl-C / SIGTERM and flips the shutdown flag.
fn spawn_signal_watcher(tx: watch::Sender<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::warn!("shutdown signal received");
        let _ = tx.send(true);
    })
}

async fn run_start(conf: Config, dry_run: bool, dry_run_cleaner: bool) -> Result<()> {
    tracing::info!("starting concordance archive manager");

    let pool = db::connect(&conf.mysql)
        .await
        .context("failed to open SQL database")?;
    let redis = Arc::new(
        RedisAdapter::new(&conf.redis)
            .await
            .context("failed to open Redis connection")?,
    );
    let reporting: Arc<dyn Reporting> = Arc::new(LogWriter);

    let arch_store_raw: Arc<dyn ConcArchiveStore> = Arc::new(MySqlConcArchive::new(pool.clone()));
    let hist_store_raw: Arc<dyn QueryHistoryStore> = Arc::new(MySqlQueryHistory::new(pool));
    let arch_store: Arc<dyn ConcArchiveStore> = if dry_run {
        Arc::new(ConcArchiveDryRun::new(arch_store_raw.clone()))
    } else {
        arch_store_raw.clone()
    };
    let hist_store: Arc<dyn QueryHistoryStore> = if dry_run {
        Arc::new(QueryHistoryDryRun::new(hist_store_raw.clone()))
    } else {
        hist_store_raw.clone()
    };
    let cleaner_store: Arc<dyn ConcArchiveStore> = if dry_run_cleaner {
        Arc::new(ConcArchiveDryRun::new(arch_store_raw.clone()))
    } else {
        arch_store.clone()
    };

    let (history_tx, history_rx) = mpsc::channel(FANOUT_CHANNEL_CAPACITY);
    let (stats_tx, stats_rx) = mpsc::channel(FANOUT_CHANNEL_CAPACITY);

    let ft_indexer = Arc::new(
        Indexer::open(&conf.indexer, arch_store.clone(), redis.clone())
            .await
            .context("failed to initialize index")?,
    );

    let dedup = Arc::new(
        Deduplicator::new(arch_store.clone(), &conf.archiver)
            .context("failed to initialize deduplicator")?,
    );
    if conf.archiver.preload_last_n_items > 0 {
        if let Err(err) = dedup.preload_last_n_items().await {
            tracing::warn!(error = %err, "deduplicator preload failed, starting cold");
        }
    }

    let arch = Arc::new(ArchKeeper::new(
        redis.clone(),
        arch_store.clone(),
        dedup,
        history_tx,
        stats_tx,
        reporting.clone(),
        &conf.archiver,
        &conf.redis,
    ));
    let cleaner = Arc::new(Cleaner::new(
        cleaner_store,
        redis.clone(),
        reporting.clone(),
        &conf.cleaner,
    ));
    let fulltext = IndexerService::new(
        ft_indexer.clone(),
        redis.clone(),
        &conf.redis.doc_remove_channel,
    );
    let gc = Arc::new(GarbageCollector::new(
        hist_store,
        redis.clone(),
        ft_indexer.clone(),
        reporting.clone(),
        &conf.indexer,
    ));
    let status_reporter = StatusReporter::new(reporting);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    handles.push(fulltext.start(history_rx, shutdown_rx.clone()).await?);
    handles.push(arch.start(shutdown_rx.clone()));
    handles.push(cleaner.start(shutdown_rx.clone()));
    handles.push(gc.start(shutdown_rx.clone()));
    handles.push(status_reporter.start(stats_rx, shutdown_rx.clone()));
    let state = Arc::new(AppState {
        arch: arch.clone(),
        indexer: ft_indexer,
        version: VERSION,
    });
    handles.push(
        server::start(
            &conf.listen_address,
            conf.listen_port,
            state,
            shutdown_rx.clone(),
        )
        .await?,
    );

    let signal_task = spawn_signal_watcher(shutdown_tx);
    let mut shutdown_rx_main = shutdown_rx;
    shutdown_rx_main
        .changed()
        .await
        .context("shutdown channel closed unexpectedly")?;
    signal_task.abort();

    // stop order: the archiver flushes deduplicator state and closes its
    // fan-out streams; consumers drain and stop on their own
    if let Err(err) = arch.stop() {
        tracing::error!(error = %err, "error shutting down ArchKeeper");
    }
    cleaner.stop();

    let drain_all = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, drain_all).await {
        Ok(()) => tracing::info!("graceful shutdown completed"),
        Err(_) => tracing::warn!("shutdown timed out"),
    }
    Ok(())
}

async fn run_init_query_history(conf: Config, chunk_size: usize) -> Result<()> {
    let pool = db::connect(&conf.mysql)
        .await
        .context("failed to open SQL database")?;
    tracing::info!(
        database = %conf.mysql.name,
        host = %conf.mysql.host,
        "using database"
    );
    let redis = Arc::new(
        RedisAdapter::new(&conf.redis)
            .await
            .context("failed to open Redis connection")?,
    );
    let arch_store: Arc<dyn ConcArchiveStore> = Arc::new(MySqlConcArchive::new(pool.clone()));
    let hist_store: Arc<dyn QueryHistoryStore> = Arc::new(MySqlQueryHistory::new(pool));
    let ft_indexer = Arc::new(
        Indexer::open(&conf.indexer, arch_store.clone(), redis.clone())
            .await
            .context("failed to init query history")?,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_watcher(shutdown_tx);
    let exec = DataInitializer::new(
        arch_store,
        hist_store,
        redis,
        ft_indexer,
        conf.indexer.query_history_num_preserve,
    );
    exec.run(chunk_size, shutdown_rx).await
}

async fn run_gc_query_history(conf: Config, chunk_size: usize) -> Result<()> {
    let pool = db::connect(&conf.mysql)
        .await
        .context("failed to open SQL database")?;
    tracing::info!(
        database = %conf.mysql.name,
        host = %conf.mysql.host,
        "using database"
    );
    let redis = Arc::new(
        RedisAdapter::new(&conf.redis)
            .await
            .context("failed to open Redis connection")?,
    );
    let arch_store: Arc<dyn ConcArchiveStore> = Arc::new(MySqlConcArchive::new(pool.clone()));
    let hist_store: Arc<dyn QueryHistoryStore> = Arc::new(MySqlQueryHistory::new(pool));
    let ft_indexer = Arc::new(
        Indexer::open(&conf.indexer, arch_store, redis.clone())
            .await
            .context("failed to garbage collect query history")?,
    );
    let reporting: Arc<dyn Reporting> = Arc::new(LogWriter);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_watcher(shutdown_tx);
    let gc = GarbageCollector::new(hist_store, redis, ft_indexer, reporting, &conf.indexer);
    gc.run_ad_hoc(chunk_size, shutdown_rx).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let ans = match cli.command {
        Commands::Version => {
            println!(
                "conarc {}\nbuild date: {}\nlast commit: {}",
                VERSION, BUILD_DATE, GIT_COMMIT
            );
            return ExitCode::SUCCESS;
        }
        Commands::Start {
            config,
            dry_run,
            dry_run_cleaner,
        } => {
            let conf = match load_validated_config(&config) {
                Ok(conf) => conf,
                Err(err) => {
                    eprintln!("failed to load configuration: {:#}", err);
                    return ExitCode::FAILURE;
                }
            };
            setup_logging(&conf.logging, false);
            run_start(conf, dry_run, dry_run_cleaner).await
        }
        Commands::InitQueryHistory {
            config,
            chunk_size,
            console_log,
        } => {
            let conf = match load_validated_config(&config) {
                Ok(conf) => conf,
                Err(err) => {
                    eprintln!("failed to load configuration: {:#}", err);
                    return ExitCode::FAILURE;
                }
            };
            setup_logging(&conf.logging, console_log);
            run_init_query_history(conf, chunk_size).await
        }
        Commands::GcQueryHistory {
            config,
            chunk_size,
            console_log,
        } => {
            let conf = match load_validated_config(&config) {
                Ok(conf) => conf,
                Err(err) => {
                    eprintln!("failed to load configuration: {:#}", err);
                    return ExitCode::FAILURE;
                }
            };
            setup_logging(&conf.logging, console_log);
            run_gc_query_history(conf, chunk_size).await
        }
    };

    match ans {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = format!("{:#}", err), "fatal error");
            ExitCode::from(exit_code_for(&err))
        }
    }
}
