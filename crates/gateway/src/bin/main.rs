//! lockrpc Gateway Server
//!
//! A caching JSON-RPC batching gateway that sits between clients and the
//! per-network upstream RPC endpoints of a lock protocol deployment.

use clap::Parser;
use eyre::Result;
use lockrpc_common::init_logging;
use lockrpc_gateway::{
    forward::resolve_redirects,
    networks::Networks,
    proxy::ProxyServerBuilder,
    rate_limit::RateLimiterConfig,
};
use std::{
    net::{IpAddr, SocketAddr},
    str::FromStr,
    time::Duration,
};
use tracing::{info, warn};

/// lockrpc JSON-RPC Gateway Server
#[derive(Parser, Debug)]
#[command(name = "lockrpc-gateway")]
#[command(about = "Caching JSON-RPC batching gateway for lock protocol networks")]
#[command(version)]
struct Args {
    // ========== General Configuration ==========
    /// Address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value = "8787")]
    port: u16,

    /// Upstream overrides as `<network_id>=<url>` pairs (repeatable)
    /// Example: --upstream 1=https://eth.example.com --upstream 137=https://polygon.example.com
    #[arg(long = "upstream")]
    upstreams: Vec<String>,

    // ========== Cache Configuration ==========
    /// Edge cache TTL in seconds (falls back to CACHE_DURATION_SECONDS, then 3600)
    #[arg(long)]
    cache_ttl: Option<u64>,

    /// Maximum number of edge cache entries
    #[arg(long, default_value = "10240")]
    edge_max_items: usize,

    /// Resolver cache file (omit to disable persistence)
    #[arg(long)]
    resolver_cache_file: Option<String>,

    /// Resolver cache save interval in minutes (0 = save only on shutdown)
    #[arg(long, default_value = "5")]
    cache_save_interval: u64,

    // ========== Rate Limiter Configuration ==========
    /// Requests allowed per identity+resource in the fine window
    #[arg(long, default_value = "10")]
    fine_limit: u32,

    /// Fine window length in seconds
    #[arg(long, default_value = "10")]
    fine_window: u64,

    /// Requests allowed per identity in the coarse window
    #[arg(long, default_value = "600")]
    coarse_limit: u32,

    /// Coarse window length in seconds
    #[arg(long, default_value = "60")]
    coarse_window: u64,

    /// Trusted-caller shared secret (falls back to GATEWAY_SECRET)
    #[arg(long)]
    gateway_secret: Option<String>,

    /// Skip the startup upstream reachability pass
    #[arg(long)]
    skip_upstream_check: bool,

    /// Verbosity level (repeat for more: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set RUST_LOG based on verbosity
    if std::env::var("RUST_LOG").is_err() {
        let level = match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    init_logging("lockrpc-gateway", true)?;

    let mut networks = Networks::defaults().apply_env_overrides();
    for pair in &args.upstreams {
        match pair.split_once('=') {
            Some((id, url)) if !url.is_empty() => {
                networks.set_upstream(id.trim(), url.trim().to_string());
            }
            _ => warn!("Ignoring malformed --upstream value: {}", pair),
        }
    }

    if !args.skip_upstream_check {
        check_upstreams(&networks).await;
    }

    let mut builder = ProxyServerBuilder::new()
        .networks(networks)
        .edge_max_items(args.edge_max_items)
        .cache_save_interval(args.cache_save_interval)
        .limiter_config(RateLimiterConfig {
            fine_limit: args.fine_limit,
            fine_window: Duration::from_secs(args.fine_window),
            coarse_limit: args.coarse_limit,
            coarse_window: Duration::from_secs(args.coarse_window),
        });

    if let Some(ttl) = args.cache_ttl {
        builder = builder.cache_ttl_seconds(ttl);
    }
    if let Some(secret) = args.gateway_secret {
        builder = builder.gateway_secret(secret);
    }
    if let Some(path) = args.resolver_cache_file {
        builder = builder.resolver_cache_path(path);
    }

    let proxy = builder.build().await?;
    let resolver_cache = proxy.rpc_handler.resolver_cache().clone();

    let ip = IpAddr::from_str(&args.host)?;
    let addr = SocketAddr::from((ip, args.port));

    info!("Starting lockrpc gateway on {}", addr);

    tokio::select! {
        result = proxy.serve(addr) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    // Save the resolver cache before exiting
    if let Err(e) = resolver_cache.save_to_disk().await {
        warn!("Failed to save resolver cache to disk: {}", e);
    }

    Ok(())
}

/// Resolves redirects on each configured upstream and reports the outcome
///
/// Purely advisory: a failing upstream is logged, not fatal, since networks
/// can come and go independently of the gateway process.
async fn check_upstreams(networks: &Networks) {
    for network in networks.iter() {
        match resolve_redirects(&network.upstream_url, 5, Duration::from_secs(5)).await {
            Ok(resolved) if resolved != network.upstream_url => {
                info!(
                    "Upstream for network {} redirects: {} -> {}",
                    network.id, network.upstream_url, resolved
                );
            }
            Ok(_) => {
                info!("Upstream for network {} is reachable", network.id);
            }
            Err(e) => {
                warn!("Upstream check failed for network {}: {}", network.id, e);
            }
        }
    }
}
