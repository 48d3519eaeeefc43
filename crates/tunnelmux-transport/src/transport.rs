//! Transport abstraction and the byte-stream transport

use crate::{Connection, ConnectionConfig, TransportError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Transport abstraction for establishing connection generations.
///
/// Every successful [`Transport::connect`] yields a fresh [`Connection`] with a
/// new generation number. A transport keeps no memory of what earlier
/// generations carried.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a new connection generation
    async fn connect(&self) -> Result<Connection, TransportError>;

    /// Human readable description of the remote end
    fn describe(&self) -> String;
}

/// Monotonic generation numbering shared by transport implementations
#[derive(Debug, Default)]
pub(crate) struct Generations(AtomicU64);

impl Generations {
    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// TCP transport carrying length-prefixed messages
#[derive(Debug)]
pub struct StreamTransport {
    /// Remote `host:port`
    addr: String,
    /// Connect timeout
    connect_timeout: Duration,
    /// Buffering limits
    config: ConnectionConfig,
    /// Generation numbering
    generations: Generations,
}

impl StreamTransport {
    /// Create a TCP transport for `addr`
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(10),
            config: ConnectionConfig::default(),
            generations: Generations::default(),
        }
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set buffering limits
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn connect(&self) -> Result<Connection, TransportError> {
        debug!("Connecting to tcp://{}", self.addr);

        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))??;
        stream.set_nodelay(true)?;

        let generation = self.generations.next();
        info!("Connected to tcp://{} (generation {})", self.addr, generation);

        Ok(Connection::from_stream(
            stream,
            generation,
            self.describe(),
            &self.config,
        ))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}
