use clap::Parser;
use relayd::config;
use relayd::RelayDaemon;
use std::path::PathBuf;
use tracing::error;

/// Local multi-agent message broker daemon.
#[derive(Debug, Parser)]
#[command(name = "relayd", version)]
struct Args {
    /// Path to the TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Unix socket path (overrides config and RELAY_SOCKET).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Root directory (overrides config and RELAY_ROOT).
    #[arg(long)]
    root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let filter = std::env::var("RELAY_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let args = Args::parse();
    let mut config = match config::load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load config");
            return std::process::ExitCode::FAILURE;
        }
    };
    if let Some(root) = args.root {
        config.socket_path = root.join("relay.sock");
        config.root_dir = root;
    }
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    let daemon = match RelayDaemon::start(config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "daemon failed to start");
            return std::process::ExitCode::FAILURE;
        }
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => {}
        Err(e) => error!(error = %e, "signal handler failed"),
    }
    daemon.stop().await;
    std::process::ExitCode::SUCCESS
}
