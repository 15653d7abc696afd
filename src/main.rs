use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::fmt::format::{DefaultFields, Format};
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::EnvFilter;

use fencer::config::{self, ListenType};
use fencer::hitcounter::{AuditLog, FileAuditLog, HitCounter, SystemClock, TracingAuditLog};
use fencer::server::{ControlServer, Listener};

/// Brute-force detection service.
#[derive(Debug, Parser)]
#[command(name = "fencer", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value = "config.json")]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.json_logs);

    info!("Starting Fencer");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Refuse to start on any configuration problem, reporting all of them
    let config = match config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            for message in e.messages() {
                error!("configuration error: {}", message);
                eprintln!("configuration error: {}", message);
            }
            std::process::exit(1);
        }
    };
    info!(
        listen_type = ?config.listen_type,
        listen_address = %config.listen_address,
        directions = config.directions.len(),
        "Configuration loaded"
    );

    let audit: Arc<dyn AuditLog> = match &config.log {
        Some(path) => {
            info!(path = %path.display(), "Writing audit log to file");
            Arc::new(FileAuditLog::open(path)?)
        }
        None => Arc::new(TracingAuditLog),
    };

    let hit_counter = Arc::new(HitCounter::with_parts(
        config.directions.clone(),
        Arc::new(SystemClock),
        audit,
    )?);

    let listener = Listener::bind(config.listen_type, &config.listen_address).await?;
    let server = ControlServer::new(hit_counter.clone(), config.max_connections);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serving = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });

    info!("The server is running");
    shutdown_signal().await;

    shutdown_tx.send_replace(true);
    serving.await??;
    hit_counter.shutdown().await;

    if config.listen_type == ListenType::Unix {
        let _ = std::fs::remove_file(&config.listen_address);
    }

    let stats = hit_counter.stats();
    info!(
        requests_last_24h = stats.requests_last_24h,
        stats = %serde_json::to_string(&stats).unwrap_or_default(),
        "Fencer stopped"
    );
    Ok(())
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let builder = log_format(filter);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Shared log line layout. Targets stay on so `fencer::audit` records can
/// be told apart from operational logs.
fn log_format(filter: EnvFilter) -> SubscriberBuilder<DefaultFields, Format, EnvFilter> {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
