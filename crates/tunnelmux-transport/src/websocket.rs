//! WebSocket transport

use crate::transport::Generations;
use crate::{Connection, ConnectionConfig, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as TungsteniteConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace};

/// WebSocket transport settings
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Connect (TCP + upgrade) timeout
    pub connect_timeout: Duration,
    /// Largest single message accepted
    pub max_message_size: usize,
    /// Capacity of the inbound and outbound message channels
    pub channel_capacity: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_message_size: 16 * 1024 * 1024,
            channel_capacity: 256,
        }
    }
}

impl WebSocketConfig {
    /// Equivalent connection buffering limits
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_message_size: self.max_message_size,
            channel_capacity: self.channel_capacity,
        }
    }

    /// Equivalent tungstenite protocol settings
    pub fn tungstenite(&self) -> TungsteniteConfig {
        let mut config = TungsteniteConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config
    }
}

impl Connection {
    /// Build a connection over an established WebSocket.
    ///
    /// Binary and text messages are frames. A close message ends the link.
    pub fn from_websocket<S>(
        ws: WebSocketStream<S>,
        generation: u64,
        peer: impl Into<String>,
        config: &ConnectionConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split::<Message>();

        let sink = sink
            .sink_map_err(TransportError::from)
            .with(|message: Bytes| future::ready(Ok::<_, TransportError>(Message::Binary(message.to_vec()))));

        let source = source
            .map(|result| match result {
                Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                Ok(Message::Text(text)) => Some(Ok(Bytes::from(text))),
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "close frame".to_string());
                    Some(Err(TransportError::Closed(reason)))
                }
                Ok(other) => {
                    trace!("Ignoring WebSocket control message: {:?}", other);
                    None
                }
                Err(e) => Some(Err(TransportError::from(e))),
            })
            .filter_map(future::ready);

        Self::from_parts(generation, peer, sink, source, config)
    }
}

/// WebSocket client transport
#[derive(Debug)]
pub struct WebSocketTransport {
    /// `ws://` or `wss://` URL
    url: String,
    /// Settings
    config: WebSocketConfig,
    /// Generation numbering
    generations: Generations,
}

impl WebSocketTransport {
    /// Create a WebSocket transport for `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, WebSocketConfig::default())
    }

    /// Create a WebSocket transport with custom settings
    pub fn with_config(url: impl Into<String>, config: WebSocketConfig) -> Self {
        Self {
            url: url.into(),
            config,
            generations: Generations::default(),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<Connection, TransportError> {
        debug!("Connecting to {}", self.url);

        let (ws, response) = timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async_with_config(
                self.url.as_str(),
                Some(self.config.tungstenite()),
                true,
            ),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.config.connect_timeout))??;

        let generation = self.generations.next();
        info!(
            "Connected to {} (generation {}, status {})",
            self.url,
            generation,
            response.status()
        );

        Ok(Connection::from_websocket(
            ws,
            generation,
            self.describe(),
            &self.config.connection_config(),
        ))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
