//! gatedns daemon entry point.

use std::sync::Arc;

use anyhow::Context;
use log::{error, info};
use tokio::signal;

mod config;
mod dns_server;
mod hosts;
mod http;
mod resolver;
mod types;
mod upstream;
mod zones;

use config::Config;
use dns_server::run_dns_server;
use hosts::{HostsFile, ReloadPolicy};
use http::run_http_server;
use resolver::Resolver;
use upstream::Upstream;
use zones::ZoneStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting gatedns with config: {:?}", cfg);

    // Shared zone state
    let zones = Arc::new(ZoneStore::new(cfg.zones.clone()));

    // Hosts file
    let hosts = if cfg.hosts.enabled {
        let hosts = HostsFile::open(cfg.hosts.path.as_deref(), cfg.hosts.reload)
            .context("Failed to load hosts file")?;
        Some(Arc::new(hosts))
    } else {
        None
    };
    let hosts_watcher = hosts
        .as_ref()
        .filter(|h| h.policy() == ReloadPolicy::Watch)
        .map(|h| h.watch());

    // Upstream
    let upstream_addr = match cfg.upstream {
        Some(addr) => addr,
        None => upstream::system_nameserver()?,
    };
    info!("Forwarding unclaimed queries to {}", upstream_addr);
    let upstream = Arc::new(Upstream::new(upstream_addr, cfg.upstream_timeout()));

    let resolver = Arc::new(Resolver::new(
        Arc::clone(&zones),
        hosts,
        upstream,
        cfg.upstream_protocol,
    ));

    // DNS Server
    let dns_bind = cfg.dns_bind;
    let dns_handle = tokio::spawn(async move {
        if let Err(e) = run_dns_server(dns_bind, resolver).await {
            error!("DNS server failed: {}", e);
        }
    });

    // Management API
    let http_handle = cfg.http_bind.map(|http_bind| {
        let zones = Arc::clone(&zones);
        tokio::spawn(async move {
            if let Err(e) = run_http_server(http_bind, zones).await {
                error!("Management API failed: {}", e);
            }
        })
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    dns_handle.abort();
    if let Some(handle) = http_handle {
        handle.abort();
    }
    if let Some(watcher) = hosts_watcher {
        watcher.shutdown().await;
    }

    info!("Shutdown complete.");
    Ok(())
}
