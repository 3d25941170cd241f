//! tunnelmux client
//!
//! Runs the local front-ends (SOCKS5, HTTP, transparent, port maps, DNS) and
//! forwards their connections through a pool of encrypted tunnel sessions.

use anyhow::{Context, Result};
use clap::Parser;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};
use tunnelmux::{
    config::{generate_example_config, ClientConfig, Config, ConfigError},
    dns::{DnsServer, Resolver, SystemResolver, TcpDnsClient},
    filter::FilteredDialer,
    pool::Pool,
    proxy::{PortMapper, TransparentServer},
    transport::{Dialer, TcpDialer, TransportConfig},
};

/// tunnelmux client - local proxies over multiplexed encrypted tunnels
#[derive(Parser, Debug)]
#[command(name = "tunnelmux-client")]
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

    let client = config.client.ok_or(ConfigError::MissingSection("client"))?;
    client.validate().context("Invalid client configuration")?;

    run(client).await
}

/// Run a listener in the background, logging how it ended
fn spawn_listener<F>(name: &'static str, listener: F)
where
    F: Future<Output = tunnelmux::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = listener.await {
            error!("{} stopped: {}", name, e);
        }
    });
}

async fn run(config: ClientConfig) -> Result<()> {
    info!("tunnelmux client v{}", tunnelmux::VERSION);

    let pool = Pool::from_config(&config).context("Failed to set up server pool")?;
    for (index, server) in config.servers.iter().enumerate() {
        info!("Server {}: {} ({})", index + 1, server.server, server.crypt_mode);
    }
    let pool_dialer: Arc<dyn Dialer> = Arc::new(pool.clone());

    let dns_client = Arc::new(TcpDnsClient::new(
        pool_dialer.clone(),
        config.dns_upstream.clone(),
        config.timeouts.connect() + config.timeouts.handshake(),
    ));
    let resolver: Arc<dyn Resolver> = if config.internal_dns() {
        info!("Resolving names through the tunnel via {}", config.dns_upstream);
        dns_client.clone()
    } else {
        Arc::new(SystemResolver)
    };

    // port maps always go through the tunnel
    for map in &config.portmaps {
        let mapper = PortMapper::bind(map, pool_dialer.clone())
            .await
            .with_context(|| format!("Failed to bind port map on {}", map.listen))?;
        spawn_listener("Port map", mapper.run());
    }

    let direct: Arc<dyn Dialer> = Arc::new(TcpDialer::new(TransportConfig::from(&config.timeouts)));
    let dialer: Arc<dyn Dialer> =
        match FilteredDialer::from_config(&config, pool_dialer.clone(), direct, resolver)
            .context("Failed to load route rules")?
        {
            Some(filter) => Arc::new(filter),
            None => pool_dialer.clone(),
        };

    if let Some(addr) = &config.dns_server {
        let server = DnsServer::bind(addr, dns_client.clone())
            .await
            .with_context(|| format!("Failed to bind DNS server on {}", addr))?;
        spawn_listener("DNS server", server.run());
    }

    #[cfg(feature = "socks5")]
    if let Some(addr) = &config.socks {
        let mut server = tunnelmux::proxy::Socks5Server::bind(addr, dialer.clone())
            .await
            .with_context(|| format!("Failed to bind SOCKS5 proxy on {}", addr))?;
        if let (Some(user), Some(pwd)) = (&config.socks_user, &config.socks_pwd) {
            server = server.with_auth(user.clone(), pwd.clone());
        }
        spawn_listener("SOCKS5 proxy", server.run());
    }

    if let Some(addr) = &config.transparent {
        let server = TransparentServer::bind(addr, dialer.clone())
            .await
            .with_context(|| format!("Failed to bind transparent proxy on {}", addr))?;
        spawn_listener("Transparent proxy", server.run());
    }

    #[cfg(feature = "http-proxy")]
    if let Some(addr) = &config.http {
        let mut server = tunnelmux::proxy::HttpProxyServer::bind(addr, dialer.clone())
            .await
            .with_context(|| format!("Failed to bind HTTP proxy on {}", addr))?;
        if let (Some(user), Some(pwd)) = (&config.http_user, &config.http_pwd) {
            server = server.with_auth(user.clone(), pwd.clone());
        }
        spawn_listener("HTTP proxy", server.run());
    }

    let maintenance = pool.spawn_maintenance();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down...");

    maintenance.abort();
    let stats = pool.stats();
    info!(
        "Closing {} sessions ({} open streams)",
        stats.sessions.len(),
        stats.total_streams
    );
    pool.close();
    Ok(())
}
