//! chatlink - resilient line-protocol client
//!
//! Opens a supervised connection, relays stdin lines through the rate limiter
//! and prints every received line to stdout.

use chatlink::client::{ChatClient, Notification};
use chatlink::config::ClientConfig;
use chatlink::observability::{init_default_logging, metrics::metrics};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Resilient line-protocol client
#[derive(Parser)]
#[command(name = "chatlink")]
#[command(about = "Long-lived chat connection with reconnects, keepalives and throttling")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CHATLINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and relay stdin to the server until Ctrl-C or end of input
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting chatlink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_client(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for path_str in ["chatlink.toml", "config/chatlink.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults");
    Ok(ClientConfig::default())
}

async fn run_client(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = ChatClient::from_config(config)?;
    let lost = CancellationToken::new();

    let printer = tokio::spawn(print_notifications(client.clone(), lost.clone()));

    info!(url = %client.config().connection.url, "Connecting");
    if !client.open().await {
        printer.abort();
        return Err("could not connect".into());
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            _ = lost.cancelled() => {
                error!("Connection permanently lost, shutting down...");
                break;
            }
            line = stdin.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    client.enqueue(line);
                }
                None => {
                    info!("End of input, shutting down...");
                    break;
                }
            },
        }
    }

    client.close().await;
    printer.abort();

    let snapshot = metrics().snapshot();
    info!(
        sent = snapshot.traffic.messages_sent,
        received = snapshot.traffic.messages_received,
        throttled = snapshot.traffic.messages_throttled,
        reconnects = snapshot.connection.reconnects,
        "Session summary"
    );
    match serde_json::to_string(&snapshot) {
        Ok(json) => debug!(metrics = %json, "Final metrics snapshot"),
        Err(e) => warn!(error = %e, "Could not serialize metrics snapshot"),
    }
    Ok(())
}

/// Print received lines and log everything else; cancels `lost` on Fatal
async fn print_notifications(client: ChatClient, lost: CancellationToken) {
    let mut rx = client.subscribe();
    loop {
        match rx.recv().await {
            Ok(Notification::Message { line }) => println!("{line}"),
            Ok(Notification::Fatal { reason, error }) => {
                match error {
                    Some(e) => error!(reason = %reason, error = %e, "Fatal"),
                    None => error!(reason = %reason, "Fatal"),
                }
                lost.cancel();
            }
            Ok(Notification::Throttled(notice)) => warn!(
                item = %notice.item_not_sent,
                sent = notice.sent_count,
                allowed = notice.allowed_in_period,
                "Line throttled"
            ),
            Ok(Notification::SendFailed { error, message }) => {
                warn!(error = %error, line = %message, "Send failed")
            }
            Ok(Notification::Error { error }) => warn!(error = %error, "Connection error"),
            Ok(other) => info!(event = other.kind(), "Connection event"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Notification subscriber lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn handle_config_command(config: ClientConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let endpoint = config.endpoint()?;
    info!(endpoint = ?endpoint, "Endpoint resolved");

    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
