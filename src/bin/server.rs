//! tunnelmux server
//!
//! Accepts encrypted tunnel connections, authenticates them and connects
//! every multiplexed stream to its requested destination.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tunnelmux::{
    config::{generate_example_config, Config, ConfigError},
    tunnel::TunnelServer,
};

/// tunnelmux server - far end of the multiplexed tunnels
#[derive(Parser, Debug)]
#[command(name = "tunnelmux-server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level or filter directive (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to render example configuration")?;
        print!("{}", example);
        return Ok(());
    }

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;
    tunnelmux::logging::init(&config.logging, args.log_level.as_deref())
        .context("Failed to initialize logging")?;

    let server_config = config.server.ok_or(ConfigError::MissingSection("server"))?;
    info!("tunnelmux server v{}", tunnelmux::VERSION);
    if server_config.users.is_empty() {
        info!("No users configured - any credentials are accepted");
    }

    let server = TunnelServer::new(&server_config).context("Invalid server configuration")?;
    let listener = TcpListener::bind(&server_config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", server_config.listen))?;

    tokio::select! {
        result = server.serve(listener) => {
            result.context("Tunnel server stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
