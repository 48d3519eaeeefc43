//! A live connection generation

use crate::TransportError;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt, TryStreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// Connectivity state of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No physical connection
    Disconnected,
    /// A connection attempt is in progress
    Connecting,
    /// Connected and carrying frames
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

/// Event delivered by a [`Connection`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One raw message, in arrival order
    Message(Bytes),
    /// The physical link is gone. Emitted exactly once, always last.
    Lost {
        /// What killed the link
        reason: String,
    },
}

/// Buffering limits for a connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest single message accepted or sent
    pub max_message_size: usize,
    /// Capacity of the inbound and outbound message channels
    pub channel_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024 * 1024,
            channel_capacity: 256,
        }
    }
}

/// Reports link loss exactly once per connection
struct LinkMonitor {
    generation: u64,
    lost: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl LinkMonitor {
    async fn report_lost(&self, reason: String) {
        if self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("Connection generation {} lost: {}", self.generation, reason);
        self.state_tx.send_replace(ConnectionState::Disconnected);
        let _ = self.events_tx.send(TransportEvent::Lost { reason }).await;
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

/// One physical duplex connection (one generation).
///
/// Messages passed to [`Connection::send`] reach the wire in call order.
/// Dropping the connection closes the link.
pub struct Connection {
    /// Generation number assigned by the transport
    generation: u64,
    /// Remote peer description
    peer: String,
    /// Outbound messages to the writer task
    outbound: mpsc::Sender<Bytes>,
    /// Inbound events from the reader task
    events: mpsc::Receiver<TransportEvent>,
    /// Connectivity state
    state: watch::Receiver<ConnectionState>,
    /// Shared loss reporter
    monitor: Arc<LinkMonitor>,
    /// Reader task, aborted on drop
    reader: JoinHandle<()>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("generation", &self.generation)
            .field("peer", &self.peer)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Connection {
    /// Build a connection over any message sink and source.
    ///
    /// Spawns one reader and one writer task on the current runtime.
    pub fn from_parts<Si, St>(
        generation: u64,
        peer: impl Into<String>,
        sink: Si,
        source: St,
        config: &ConnectionConfig,
    ) -> Self
    where
        Si: Sink<Bytes, Error = TransportError> + Send + 'static,
        St: Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
    {
        let peer = peer.into();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.channel_capacity);
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);

        let monitor = Arc::new(LinkMonitor {
            generation,
            lost: AtomicBool::new(false),
            state_tx,
            events_tx: events_tx.clone(),
        });

        tokio::spawn(write_loop(sink, outbound_rx, Arc::clone(&monitor)));
        let reader = tokio::spawn(read_loop(source, events_tx, Arc::clone(&monitor)));

        info!("Connection generation {} established to {}", generation, peer);

        Self {
            generation,
            peer,
            outbound: outbound_tx,
            events: events_rx,
            state: state_rx,
            monitor,
            reader,
        }
    }

    /// Build a connection over a byte stream using 4-byte big-endian length prefixes
    pub fn from_stream<T>(
        io: T,
        generation: u64,
        peer: impl Into<String>,
        config: &ConnectionConfig,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(config.max_message_size)
            .new_codec();
        let (sink, source) = Framed::new(io, codec).split::<Bytes>();

        Self::from_parts(
            generation,
            peer,
            sink.sink_map_err(TransportError::from),
            source.map_ok(|bytes| bytes.freeze()).map_err(TransportError::from),
            config,
        )
    }

    /// Generation number of this connection
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Remote peer description
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Current connectivity state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connectivity state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// A send half that can wait for room without borrowing the connection
    pub fn sender(&self) -> MessageSender {
        MessageSender {
            outbound: self.outbound.clone(),
            monitor: Arc::clone(&self.monitor),
        }
    }

    /// Queue one message for the wire
    pub async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if self.monitor.is_lost() {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    /// Next inbound event.
    ///
    /// Nothing follows [`TransportEvent::Lost`].
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

/// Cloneable send half of a [`Connection`].
///
/// Messages from all senders of a connection share one outbound channel and
/// reach the wire in the order they were queued.
#[derive(Clone)]
pub struct MessageSender {
    outbound: mpsc::Sender<Bytes>,
    monitor: Arc<LinkMonitor>,
}

impl fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSender")
            .field("generation", &self.monitor.generation)
            .field("lost", &self.monitor.is_lost())
            .finish()
    }
}

impl MessageSender {
    /// Wait for room for one message.
    ///
    /// Dropping the future gives the slot up again.
    pub async fn reserve(self) -> Result<SendPermit, TransportError> {
        if self.monitor.is_lost() {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .reserve_owned()
            .await
            .map(SendPermit)
            .map_err(|_| TransportError::NotConnected)
    }

    /// Queue a message if there is room right now, handing it back otherwise
    pub fn try_send(&self, message: Bytes) -> Result<(), Bytes> {
        if self.monitor.is_lost() {
            return Err(message);
        }
        self.outbound.try_send(message).map_err(|e| e.into_inner())
    }
}

/// Room for exactly one outbound message
#[derive(Debug)]
pub struct SendPermit(mpsc::OwnedPermit<Bytes>);

impl SendPermit {
    /// Queue `message` without waiting
    pub fn send(self, message: Bytes) {
        let _ = self.0.send(message);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!("Dropping connection generation {}", self.generation);
        self.reader.abort();
    }
}

async fn read_loop<St>(
    source: St,
    events_tx: mpsc::Sender<TransportEvent>,
    monitor: Arc<LinkMonitor>,
) where
    St: Stream<Item = Result<Bytes, TransportError>>,
{
    let mut source = Box::pin(source);

    let reason = loop {
        match source.next().await {
            Some(Ok(message)) => {
                if events_tx.send(TransportEvent::Message(message)).await.is_err() {
                    debug!("Connection generation {} receiver dropped", monitor.generation);
                    return;
                }
            }
            Some(Err(e)) => break e.to_string(),
            None => break "closed by peer".to_string(),
        }
    };

    monitor.report_lost(reason).await;
}

async fn write_loop<Si>(sink: Si, mut outbound_rx: mpsc::Receiver<Bytes>, monitor: Arc<LinkMonitor>)
where
    Si: Sink<Bytes, Error = TransportError>,
{
    let mut sink = Box::pin(sink);

    while let Some(message) = outbound_rx.recv().await {
        if let Err(e) = sink.send(message).await {
            monitor.report_lost(format!("write failed: {}", e)).await;
            return;
        }
    }

    debug!("Connection generation {} writer finished", monitor.generation);
    let _ = sink.close().await;
}
