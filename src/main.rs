use clap::{Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use quotaguard::config::{LogFormat, LoggingConfig, QuotaGuardConfig};
use quotaguard::ratelimit::{presets, ClientIdentity, RateLimiter};

#[derive(Parser)]
#[command(name = "quotaguard", version, about = "Sliding-window request admission control")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format; overrides the configured one
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check and record a single request
    Check {
        /// Policy name, e.g. strict or email
        #[arg(long)]
        policy: String,

        /// Caller identifier such as a user id or API key
        #[arg(long)]
        identifier: Option<String>,

        /// Caller address, used when no identifier is given
        #[arg(long)]
        addr: Option<IpAddr>,
    },

    /// Read `policy identifier` lines from stdin and print one decision per line
    Replay,

    /// Connect to the distributed store and print limiter status
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = QuotaGuardConfig::load(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting quotaguard");
    info!(
        config = ?cli.config,
        distributed = config.store.url().is_some(),
        "Configuration loaded"
    );

    let limiter = RateLimiter::from_config(&config)?;

    let result = run(cli.command, &limiter, &config).await;

    limiter.shutdown().await;
    info!("quotaguard stopped");
    result
}

async fn run(command: Command, limiter: &RateLimiter, config: &QuotaGuardConfig) -> anyhow::Result<()> {
    match command {
        Command::Check {
            policy,
            identifier,
            addr,
        } => {
            let identity = ClientIdentity {
                identifier,
                origin: addr,
            };
            let decision = presets::named(limiter, &policy, &identity).await?;
            println!("{}", serde_json::to_string(&decision)?);
        }
        Command::Replay => {
            if config.local.sweep_interval_secs > 0 {
                limiter.spawn_sweeper(Duration::from_secs(config.local.sweep_interval_secs));
            }
            replay(limiter).await?;
        }
        Command::Status => {
            let connected = limiter.connect().await;
            debug!(connected = connected, "Connection attempt finished");
            println!("{}", serde_json::to_string_pretty(&limiter.status())?);
        }
    }
    Ok(())
}

/// Logs go to stderr so stdout carries only decisions.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn replay(limiter: &RateLimiter) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut processed = 0u64;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut shutdown => break,
        };
        let Some(line) = line else {
            debug!("End of input");
            break;
        };

        let mut fields = line.split_whitespace();
        let (policy, identifier) = match (fields.next(), fields.next()) {
            (Some(policy), identifier) => (policy, identifier),
            (None, _) => continue,
        };

        let identity = ClientIdentity {
            identifier: identifier.map(str::to_string),
            origin: None,
        };
        match presets::named(limiter, policy, &identity).await {
            Ok(decision) => println!("{}", serde_json::to_string(&decision)?),
            Err(e) => {
                warn!(line = %line, error = %e, "Skipping request");
                println!("{}", serde_json::json!({ "error": e.to_string() }));
            }
        }
        processed += 1;
    }

    info!(processed = processed, "Replay finished");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
