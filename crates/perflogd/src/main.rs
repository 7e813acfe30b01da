//! MPTCP Subflow Performance Logger Daemon
//!
//! Samples the subflows of an already open MPTCP socket (inherited by file
//! descriptor) until interrupted, an optional duration elapses, or the
//! sampling loop fails.

use anyhow::Context;
use clap::Parser;
use mptcp_perflogd::config_file::PerflogConfig;
use mptcp_perflogd::metrics_server;
use mptcp_perflogd::{
    FeatureSelection, LogReporter, MemoryStoreFactory, MptcpSockopt, SamplerMetrics,
    SamplingEngine, SocketHandle, SqliteStoreFactory, StoreFactory,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How often the daemon checks whether the sampling loop died on its own
const LOOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// MPTCP subflow performance logger
#[derive(Parser, Debug)]
#[command(name = "perflogd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// File descriptor of the MPTCP socket to sample
    sockfd: SocketHandle,

    /// TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Sampling interval in milliseconds
    #[arg(short = 'i', long)]
    interval: Option<u64>,

    /// Features to log: "all" or a comma-separated list
    #[arg(short = 'f', long)]
    features: Option<FeatureSelection>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    log: Option<String>,

    /// SQLite database file
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Delete the database file when sampling stops
    #[arg(long)]
    delete_db_on_exit: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Sample without writing to the database
    #[arg(long)]
    dry_run: bool,
}

impl Args {
    /// Load the config file (if any) and apply command line overrides
    fn resolve_config(&self) -> anyhow::Result<PerflogConfig> {
        let mut config = match &self.config {
            Some(path) => PerflogConfig::load_or_default(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => PerflogConfig::default(),
        };

        if let Some(interval) = self.interval {
            config.sampler.interval_ms = interval;
        }
        if let Some(features) = &self.features {
            config.sampler.features = features.clone();
        }
        if let Some(level) = &self.log {
            config.logging.level = level.to_ascii_lowercase();
        }
        if let Some(path) = &self.db_path {
            config.database.path = path.clone();
        }
        if self.delete_db_on_exit {
            config.database.delete_on_exit = true;
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics.enabled = true;
            config.metrics.listen_addr = addr;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.resolve_config()?;

    init_logging(&config.logging.level)?;

    info!(fd = args.sockfd, "perflogd: Starting performance logger");

    match run_daemon(&args, config).await {
        Ok(()) => {
            info!("perflogd: Exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "perflogd: Exiting with error");
            Err(e)
        }
    }
}

/// Initialize structured logging
///
/// `RUST_LOG`, when set, takes precedence over the configured level.
fn init_logging(level: &str) -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .compact(),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))
}

async fn run_daemon(args: &Args, config: PerflogConfig) -> anyhow::Result<()> {
    let metrics = SamplerMetrics::new().context("creating metrics registry")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = if config.metrics.enabled {
        let listener = metrics_server::bind(config.metrics.listen_addr).await?;
        let mut rx = shutdown_rx.clone();
        Some(tokio::spawn(metrics_server::serve(
            listener,
            metrics.clone(),
            async move {
                let _ = rx.changed().await;
            },
        )))
    } else {
        None
    };

    let store_factory: Arc<dyn StoreFactory> = if args.dry_run {
        info!("perflogd: Dry run, samples are kept in memory only");
        Arc::new(MemoryStoreFactory::new())
    } else {
        let factory = SqliteStoreFactory::new(&config.database.path)
            .delete_on_exit(config.database.delete_on_exit);
        info!(path = %factory.path().display(), "perflogd: Logging to database");
        Arc::new(factory)
    };

    let mut engine = SamplingEngine::new(
        args.sockfd,
        Arc::new(MptcpSockopt::new()),
        store_factory,
        &LogReporter::with_label(format!("fd {}", args.sockfd)),
    )
    .with_metrics(metrics.clone());

    engine.run(config.sampler.interval_ms, config.sampler.features.clone())?;

    let reason = wait_for_shutdown(&engine, args.duration.map(Duration::from_secs)).await;
    info!(reason, "perflogd: Stopping sampling");

    // stop() joins the loop thread
    let outcome = tokio::task::spawn_blocking(move || engine.stop())
        .await
        .context("stop task failed")?;

    let _ = shutdown_tx.send(true);
    if let Some(server) = server {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "perflogd: Metrics endpoint failed"),
            Err(e) => warn!(error = %e, "perflogd: Metrics task failed"),
        }
    }

    info!(
        samples = metrics.samples_recorded(),
        "perflogd: Graceful shutdown complete"
    );
    outcome.context("sampling loop failed")
}

/// Wait for ctrl-c, the optional deadline, or an early loop exit
async fn wait_for_shutdown(engine: &SamplingEngine, duration: Option<Duration>) -> &'static str {
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut poll = tokio::time::interval(LOOP_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => return "signal",
            _ = &mut deadline => return "duration elapsed",
            _ = poll.tick() => {
                if engine.loop_exited() {
                    return "sampling loop exited";
                }
            }
        }
    }
}
