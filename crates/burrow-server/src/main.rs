//! burrow relay binary.
//!
//! Binds the public listener, wires the client registry to the shared port
//! allocator and runs until interrupted.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use burrow_core::{ClientRegistry, PortAllocator, RegistryConfig, DEFAULT_GRACE_PERIOD};
use burrow_server::{admin_router, ApiState, IngressServer};

/// Expose local servers on public subdomains over reverse TCP tunnels.
#[derive(Parser, Debug)]
#[command(name = "burrow", version, about, long_about = None)]
struct Cli {
    /// Base domain; tunnels are exposed as {id}.{domain}
    #[arg(long, env = "BURROW_DOMAIN")]
    domain: String,

    /// Where bare-domain browsers are redirected
    #[arg(long, default_value = "https://burrow.dev")]
    landing: String,

    /// Advertise https tunnel URLs (when a TLS terminator fronts the relay)
    #[arg(long)]
    secure: bool,

    /// Maximum concurrent tunnel sockets per client
    #[arg(long, default_value_t = burrow_core::DEFAULT_MAX_TCP_SOCKETS)]
    max_tcp_sockets: usize,

    /// Port range for tunnel acceptors, "first:last" (OS-assigned if unset)
    #[arg(long)]
    range: Option<String>,

    /// JWT whose name claim authorizes the kill endpoint
    #[arg(long, env = "BURROW_SECRET")]
    secret: Option<String>,

    /// Public HTTP port
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Bind address for the public listener and tunnel acceptors
    #[arg(long, default_value = "0.0.0.0")]
    address: IpAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let ports = Arc::new(PortAllocator::new(cli.range.as_deref())?);
    if let Some(range) = ports.range() {
        info!(%range, "tunnel port range configured");
    }

    let registry = ClientRegistry::new(
        ports,
        RegistryConfig {
            max_tcp_sockets: cli.max_tcp_sockets,
            secret: cli.secret.clone(),
            bind_ip: cli.address,
            grace: DEFAULT_GRACE_PERIOD,
        },
    );

    let admin = admin_router(ApiState {
        registry: registry.clone(),
        domain: cli.domain.clone(),
        landing: cli.landing.clone(),
        secure: cli.secure,
    });

    let addr = SocketAddr::new(cli.address, cli.port);
    let ingress = IngressServer::bind(addr, cli.domain.clone(), registry, admin).await?;
    info!(domain = %cli.domain, %addr, "burrow relay ready");

    let server = tokio::spawn(async move {
        if let Err(e) = ingress.run().await {
            error!(error = %e, "ingress server failed");
        }
    });

    signal::ctrl_c().await?;
    info!("shutdown signal received, stopping");
    server.abort();

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
