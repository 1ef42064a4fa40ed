//! Log Broadcast - tails a JSON log file and ships new events to a collector
//!
//! ## Usage
//!
//! ```text
//! log-broadcast -c broadcast.json
//! ```
//!
//! The config file is a JSON object with `url` and `log` (required) and the
//! optional `interval`, `newOnly`, `resumePath`, `wait`, `attempts`,
//! `maxEvents`, `maxSize`, `requestTimeout` and `retryOnStatus`.
//!
//! `RUST_LOG` controls the logging filter (default: info).
//!
//! The process exits 0 on SIGINT, SIGTERM or SIGUSR2, and 1 when the config is
//! invalid or a batch cannot be delivered.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use log_broadcast::config::Config;
use log_broadcast::pipeline::Tailer;

#[derive(Debug, Parser)]
#[command(name = "log-broadcast", version, about)]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args = CliArgs::parse();

    let config = match Config::from_file(&args.config) {
        Ok(config) => {
            info!(
                url = %config.url,
                log = %config.log_path.display(),
                interval_ms = config.interval.as_millis(),
                attempts = config.attempts,
                max_events = config.max_events,
                max_size = config.max_size,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, path = %args.config.display(), "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let tailer = match Tailer::new(config) {
        Ok(tailer) => tailer,
        Err(e) => {
            error!(error = %e, "Failed to create broadcaster");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    match StopSignals::install() {
        Ok(signals) => {
            tokio::spawn(signals.cancel_on_stop(cancel.clone()));
        }
        Err(e) => {
            error!(error = %e, "Failed to install shutdown signal handlers");
            std::process::exit(1);
        }
    }

    match tailer.run(cancel).await {
        Ok(()) => info!("Log broadcast stopped"),
        Err(e) => {
            error!(error = %e, "Log broadcast failed");
            std::process::exit(1);
        }
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Stop signal handlers, registered before the first cycle runs so that a
/// signal arriving early is not lost.
#[cfg(unix)]
struct StopSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    user2: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl StopSignals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            user2: signal(SignalKind::user_defined2())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => {}
            _ = self.terminate.recv() => {}
            _ = self.user2.recv() => {}
        }
    }

    /// Cancel `token` when a graceful stop signal arrives.
    async fn cancel_on_stop(mut self, token: CancellationToken) {
        self.recv().await;
        info!("Shutdown signal received, stopping after current cycle");
        token.cancel();
    }
}

#[cfg(not(unix))]
struct StopSignals;

#[cfg(not(unix))]
impl StopSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn cancel_on_stop(self, token: CancellationToken) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, stopping after current cycle");
                token.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    }
}
