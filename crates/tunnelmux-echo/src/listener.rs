//! TCP and WebSocket accept loops

use crate::server::{EchoOptions, EchoServer};
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tunnelmux_transport::{Connection, ConnectionConfig, WebSocketConfig};

static GENERATIONS: AtomicU64 = AtomicU64::new(0);

fn next_generation() -> u64 {
    GENERATIONS.fetch_add(1, Ordering::Relaxed) + 1
}

async fn run_session(connection: Connection, options: EchoOptions) {
    let peer = connection.peer().to_string();
    if let Err(e) = EchoServer::new(connection, options).run().await {
        error!("Session with {} failed: {}", peer, e);
    }
}

/// Accept length-prefixed TCP clients until the listener fails
pub async fn serve_tcp(listener: TcpListener, options: EchoOptions) -> Result<()> {
    info!("Accepting TCP clients on {}", listener.local_addr()?);
    let config = ConnectionConfig::default();

    loop {
        let (socket, peer) = listener.accept().await?;
        if let Err(e) = socket.set_nodelay(true) {
            warn!("Could not disable Nagle for {}: {}", peer, e);
        }
        let connection = Connection::from_stream(socket, next_generation(), peer.to_string(), &config);
        tokio::spawn(run_session(connection, options.clone()));
    }
}

/// Accept WebSocket clients until the listener fails
pub async fn serve_websocket(listener: TcpListener, options: EchoOptions) -> Result<()> {
    info!("Accepting WebSocket clients on {}", listener.local_addr()?);
    let config = WebSocketConfig::default();

    loop {
        let (socket, peer) = listener.accept().await?;
        let options = options.clone();
        let config = config.clone();

        tokio::spawn(async move {
            match tokio_tungstenite::accept_async_with_config(socket, Some(config.tungstenite())).await {
                Ok(ws) => {
                    let connection = Connection::from_websocket(
                        ws,
                        next_generation(),
                        peer.to_string(),
                        &config.connection_config(),
                    );
                    run_session(connection, options).await;
                }
                Err(e) => warn!("WebSocket handshake with {} failed: {}", peer, e),
            }
        });
    }
}
