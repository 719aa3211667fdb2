//! s3bd daemon - read-only NBD server backed by S3 objects.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use s3bd::{Config, Daemon, ListenConfig};

#[derive(Parser)]
#[command(
    name = "s3bd",
    about = "Expose immutable S3 objects as read-only NBD block devices"
)]
struct Cli {
    /// Path to config file.
    #[arg(short, long)]
    config: PathBuf,

    /// Cache directory. Overrides config file if specified.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Additional listen target, e.g. tcp://127.0.0.1:10809 or
    /// unix:///run/s3bd/nbd.sock. May be repeated.
    #[arg(long)]
    listen: Vec<ListenConfig>,

    /// Log level.
    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,

    /// Shortcut for --log-level debug.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { cli.log_level };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config: {}", cli.config.display()))?;

    // CLI overrides
    if let Some(cache_dir) = cli.cache_dir {
        config.cache.dir = cache_dir;
    }
    config.listen.extend(cli.listen);

    let daemon = Arc::new(Daemon::from_config(config).context("Failed to create daemon")?);
    info!(
        cache_dir = %daemon.cache_dir().display(),
        listeners = daemon.config().listen.len(),
        "s3bd started"
    );

    let mut running = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.run().await })
    };

    let shutdown = async {
        let ctrl_c = signal::ctrl_c();
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        anyhow::Ok(())
    };

    let finished = tokio::select! {
        result = shutdown => {
            result?;
            None
        }
        result = &mut running => Some(result),
    };

    daemon.shutdown().await.context("Failed to shut down")?;
    let result = match finished {
        Some(result) => result,
        None => running.await,
    };
    result.context("Daemon task failed")?.context("Daemon failed")?;
    info!("s3bd stopped");
    Ok(())
}
