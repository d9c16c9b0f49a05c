//! tribler-tunnel: anonymous tunnel node.
//!
//! Single process on a Tokio runtime: the tunnel loop on the overlay UDP
//! socket, the SOCKS5 listener, and the optional crawler writer.

mod cli;
mod config;
mod crawler;
mod events;
mod identity;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::UdpSocket;
use tracing::{error, info};
use tribler_socks::SocksServer;
use tribler_tunnel::overlay::PeerList;
use tribler_tunnel::TunnelRuntime;

use crate::cli::Cli;
use crate::config::DaemonConfig;
use crate::events::{BusObserver, Event, EventBus};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    config.apply(&cli)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.advanced.log_level))?,
        )
        .init();

    info!("tribler-tunnel starting");

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let secret = identity::load_or_create(&data_dir)?;
    let settings = config.tunnel_settings()?;
    let candidates = Arc::new(PeerList::new(config.bootstrap_peers()?));

    let event_bus = EventBus::new(1000);

    let crawler = if config.crawler.enabled {
        let conn = tribler_db::open(&data_dir.join("crawl.db"))?;
        let db = Arc::new(tokio::sync::Mutex::new(conn));
        info!("crawler enabled");
        Some(tokio::spawn(crawler::run(event_bus.subscribe(), db)))
    } else {
        None
    };

    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], config.network.listen_port)))
        .await
        .context("binding overlay socket")?;
    let runtime = TunnelRuntime::start(
        socket,
        secret,
        settings,
        candidates,
        vec![Box::new(BusObserver::new(event_bus.clone()))],
    )?;
    info!(public_key = %runtime.handle().own_peer().public_key.to_hex(), "tunnel ready");

    event_bus.emit(Event::now(
        "DaemonStarted",
        serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }),
    ));

    let socks = if config.socks.enabled {
        let address = SocketAddr::from(([127, 0, 0, 1], config.socks.port));
        let server = SocksServer::bind(address, runtime.handle(), config.socks_settings()).await?;
        Some(tokio::spawn(server.run()))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");

    if let Some(socks) = socks {
        socks.abort();
        if let Ok(Err(e)) = socks.await {
            error!("SOCKS5 server error: {}", e);
        }
    }
    runtime.shutdown().await;
    drop(event_bus);
    if let Some(crawler) = crawler {
        let _ = crawler.await;
    }

    info!("stopped");
    Ok(())
}
