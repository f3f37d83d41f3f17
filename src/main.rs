use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use remote_agent::archive::ZipExtractor;
use remote_agent::config::GlobalConfig;
use remote_agent::mail::ImapSmtpMailer;
use remote_agent::{AgentConfig, Daemon, DaemonHandle};

#[derive(Debug, Parser)]
#[command(name = "remote-agent", version, about = "Runs job bundles received by mail")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config = AgentConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let _log_guard = init_logging(&config.global)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        endpoint = %config.global.endpoint,
        accounts = config.accounts.len(),
        "Remote agent starting"
    );

    let config = Arc::new(config);
    let mailer = Arc::new(ImapSmtpMailer::new(
        config.global.work_dir.clone(),
        config.global.network_timeout(),
    ));
    let daemon = Daemon::new(Arc::clone(&config), mailer, Arc::new(ZipExtractor));

    tokio::spawn(stop_on_signal(daemon.handle()));
    daemon.start().await?;

    info!("Remote agent exited");
    Ok(())
}

/// Stderr plus a daily file under `<work_dir>/logs`. `RUST_LOG` overrides the
/// configured level.
fn init_logging(global: &GlobalConfig) -> anyhow::Result<WorkerGuard> {
    let log_dir = global.work_dir.join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;

    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&global.log_level));
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "remote-agent.log"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(filter()),
        )
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(filter()),
        )
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(guard)
}

async fn stop_on_signal(handle: DaemonHandle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
    handle.stop();
}
