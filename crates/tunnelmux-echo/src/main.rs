//! Tunnelmux echo server binary

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tunnelmux_echo::{serve_tcp, serve_websocket, EchoOptions};

#[derive(Parser, Debug)]
#[command(name = "tunnelmux-echo", version, about = "Loopback server for the tunnelmux protocol")]
struct Args {
    /// Address for length-prefixed TCP clients
    #[arg(long, default_value = "127.0.0.1:7700")]
    listen: SocketAddr,

    /// Address for WebSocket clients
    #[arg(long)]
    ws_listen: Option<SocketAddr>,

    /// Refuse tunnels to this target (repeatable)
    #[arg(long = "reject-target")]
    reject_targets: Vec<String>,

    /// First tunnel id handed out on each connection
    #[arg(long, default_value_t = 1)]
    first_id: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let options = EchoOptions {
        reject_targets: args.reject_targets.into_iter().collect(),
        first_id: args.first_id,
    };

    info!("Starting tunnelmux-echo");

    let tcp = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    tokio::spawn(serve_tcp(tcp, options.clone()));

    if let Some(addr) = args.ws_listen {
        let ws = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        tokio::spawn(serve_websocket(ws, options));
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down");
    Ok(())
}
