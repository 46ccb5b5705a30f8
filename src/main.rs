use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shaper::config::ShaperConfig;
use shaper::ratelimit::LimiterRegistry;
use shaper::relay::RelayServer;

#[derive(Parser)]
#[command(name = "shaper", version, about = "Bandwidth shaping for proxied connections")]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a configuration file and report every limiter entry
    Check {
        /// Path to a YAML or JSON configuration file
        config: PathBuf,
    },
    /// Relay TCP connections to an upstream, shaping the client side
    Relay {
        /// Path to a YAML or JSON configuration file
        config: PathBuf,

        /// Override the listen address
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Override the upstream address
        #[arg(long)]
        upstream: Option<SocketAddr>,

        /// Override the inbound name
        #[arg(long)]
        inbound: Option<String>,

        /// Override the user name
        #[arg(long)]
        user: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Check { config } => check(config),
        Command::Relay {
            config,
            listen,
            upstream,
            inbound,
            user,
        } => {
            let config = ShaperConfig::from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let mut relay_config = config.relay;
            relay_config.listen = listen.unwrap_or(relay_config.listen);
            relay_config.upstream = upstream.or(relay_config.upstream);
            relay_config.inbound = inbound.unwrap_or(relay_config.inbound);
            relay_config.user = user.or(relay_config.user);

            let upstream = relay_config
                .upstream
                .context("no upstream configured; set relay.upstream or pass --upstream")?;
            let registry = Arc::new(LimiterRegistry::from_options(&config.limiters));
            info!(keys = registry.len(), "Limiter registry built");

            let listener = TcpListener::bind(relay_config.listen)
                .await
                .with_context(|| format!("binding {}", relay_config.listen))?;

            RelayServer::new(upstream, registry, relay_config.inbound)
                .with_user(relay_config.user)
                .with_tags(relay_config.tags)
                .serve_with_shutdown(listener, shutdown_signal())
                .await?;

            info!("Relay stopped");
            Ok(())
        }
    }
}

fn check(path: PathBuf) -> anyhow::Result<()> {
    let config = ShaperConfig::from_file(&path).with_context(|| format!("loading {}", path.display()))?;
    let (registry, errors) = LimiterRegistry::load(&config.limiters);

    info!(
        entries = config.limiters.len(),
        keys = registry.len(),
        skipped = errors.len(),
        "Configuration checked"
    );
    if !errors.is_empty() {
        anyhow::bail!("{} of {} limiter entries are invalid", errors.len(), config.limiters.len());
    }
    Ok(())
}

fn init_tracing(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
