use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use voice_relay::core::realtime::ClientEvent;
use voice_relay::core::tools::{HttpToolClient, ToolDispatcher, ToolRegistry};
use voice_relay::{RelayConfig, VoiceRelay};

/// Voice Relay - bridges a voice channel to a realtime speech endpoint
#[derive(Parser, Debug)]
#[command(name = "voice-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run (defaults to `run`)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the relay. Lines typed on stdin are sent as user text.
    Run,

    /// Print the session.update event the relay would declare
    SessionConfig {
        /// Skip fetching tools from the remote tool server
        #[arg(long)]
        offline: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Must be installed before the first TLS connection
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let config = if let Some(config_path) = cli.config {
        info!("Loading configuration from {}", config_path.display());
        RelayConfig::from_file(&config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        RelayConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::SessionConfig { offline } => print_session_config(config, offline).await,
    }
}

async fn run(config: RelayConfig) -> anyhow::Result<()> {
    info!(
        "Starting relay: model={}, voice={}, channel={}",
        config.model, config.voice, config.channel_id
    );

    let mut relay = VoiceRelay::builder(config).build().await?;
    let cancel = relay.cancellation_token();

    let session = relay.session().clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Err(e) = session.send_text(line) {
                tracing::warn!("Failed to send text: {}", e);
            }
        }
    });

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    relay.run().await?;
    info!("Relay stopped");
    Ok(())
}

async fn print_session_config(config: RelayConfig, offline: bool) -> anyhow::Result<()> {
    let mut dispatcher = ToolDispatcher::new(ToolRegistry::with_builtins(), config.tool_timeout());
    if let (false, Some(url)) = (offline, config.remote_tools_url.as_deref()) {
        let client = HttpToolClient::new(url, config.tool_timeout())?;
        dispatcher = dispatcher.with_remote(Arc::new(client));
        let loaded = dispatcher.load_remote_tools().await?;
        info!("Loaded {} remote tool(s) from {}", loaded, url);
    }

    let session = config.declared_session(config.load_instructions(), dispatcher.declared_tools());
    let event = ClientEvent::SessionUpdate { session };
    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }

    // A second signal during shutdown exits immediately
    tokio::spawn(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::warn!("Forced exit");
        std::process::exit(130);
    });
}
