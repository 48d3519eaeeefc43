//! The multiplexer and its driver task
//!
//! One driver task per multiplexer owns the registry and the live
//! connection. Handles talk to it over a single bounded command channel,
//! which is also what keeps outbound frames of a tunnel in call order.
//!
//! The driver never waits on the connection while handling anything.
//! Encoded frames go to an outbound queue that a separate select branch
//! drains whenever the connection has room, so inbound frames keep flowing
//! while the link is backed up. Writers are throttled by an
//! `OutboundBudget` instead.

use crate::config::MuxConfig;
use crate::handle::{OutboundBudget, TunnelHandle};
use crate::registry::{Assignment, OpenWaiter, Registry};
use crate::stats::{MuxStats, StatsSnapshot};
use crate::tunnel::{Delivery, TunnelEvent, TunnelState, TunnelStream};
use crate::{MultiplexerBuilder, MuxError, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::fmt;
use std::future::pending;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Notify, OwnedSemaphorePermit};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use tunnelmux_proto::{BindingKey, Frame, FrameCodec, StartParams, TunnelId, WindowSize};
use tunnelmux_transport::{
    Connection, ConnectionState, MessageSender, SendPermit, Transport, TransportError,
    TransportEvent,
};

/// Requests from handles to the driver.
///
/// Tunnel commands carry the generation the handle was opened on, so a
/// handle that outlived its connection cannot reach a tunnel of a later
/// generation that reuses its id.
pub(crate) enum Command {
    Open {
        binding: BindingKey,
        params: StartParams,
        reply: OpenWaiter,
    },
    Write {
        generation: u64,
        id: TunnelId,
        data: Bytes,
        permit: OwnedSemaphorePermit,
    },
    Resize {
        generation: u64,
        id: TunnelId,
        size: WindowSize,
        permit: OwnedSemaphorePermit,
    },
    Close {
        generation: u64,
        id: TunnelId,
        reason: String,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Multiplexes tunnels over one shared transport connection.
///
/// Cheap to clone; every clone drives the same connection. The driver task
/// stops once every clone and every [`TunnelHandle`] is gone, or on
/// [`Multiplexer::shutdown`].
#[derive(Clone)]
pub struct Multiplexer {
    commands: mpsc::Sender<Command>,
    budget: OutboundBudget,
    state: watch::Receiver<ConnectionState>,
    stats: Arc<MuxStats>,
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Multiplexer {
    /// Start configuring a multiplexer
    pub fn builder() -> MultiplexerBuilder {
        MultiplexerBuilder::new()
    }

    /// Connect through `transport` with the default configuration
    pub async fn connect(transport: Arc<dyn Transport>) -> Result<Self> {
        MultiplexerBuilder::new().connect(transport).await
    }

    /// Run over an established connection with the default configuration
    pub fn attach(connection: Connection) -> Self {
        MultiplexerBuilder::new().attach(connection)
    }

    pub(crate) fn start(
        config: MuxConfig,
        connection: Connection,
        transport: Option<Arc<dyn Transport>>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let budget = OutboundBudget::new(config.outbound_buffer, config.max_chunk_size);
        let stats = Arc::new(MuxStats::default());
        MuxStats::bump(&stats.generations);

        let driver = Driver::new(
            config,
            connection,
            transport,
            commands_rx,
            budget.clone(),
            state_tx,
            Arc::clone(&stats),
        );
        tokio::spawn(driver.run());

        Self {
            commands: commands_tx,
            budget,
            state: state_rx,
            stats,
        }
    }

    /// Ask the server for a tunnel and wait for its id assignment.
    ///
    /// Fails with [`MuxError::DuplicateBinding`] while the binding is taken,
    /// [`MuxError::OpenTimeout`] when the server stays silent, and
    /// [`MuxError::TransportLost`] when disconnected. Dropping the returned
    /// future cancels the request; a late assignment is then closed.
    pub async fn open(&self, binding: BindingKey, params: StartParams) -> Result<TunnelHandle> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Open {
                binding,
                params,
                reply: reply_tx,
            })
            .await
            .map_err(|_| MuxError::Shutdown)?;

        let opened = reply_rx.await.map_err(|_| MuxError::Shutdown)??;
        Ok(TunnelHandle::new(
            opened,
            self.commands.clone(),
            self.budget.clone(),
        ))
    }

    /// Open an interactive shell with its initial terminal geometry
    pub async fn open_shell(&self, target: impl Into<String>, size: WindowSize) -> Result<TunnelHandle> {
        let mut params = StartParams::new();
        params.insert("cols".to_string(), size.cols.to_string());
        params.insert("rows".to_string(), size.rows.to_string());
        self.open(BindingKey::shell(target), params).await
    }

    /// Write to a tunnel. See [`TunnelHandle::write`].
    pub async fn write(&self, handle: &TunnelHandle, data: impl Into<Bytes>) -> Result<()> {
        handle.write(data).await
    }

    /// Resize a tunnel. See [`TunnelHandle::resize`].
    pub async fn resize(&self, handle: &TunnelHandle, cols: u16, rows: u16) -> Result<()> {
        handle.resize(cols, rows).await
    }

    /// Close a tunnel. See [`TunnelHandle::close`].
    pub async fn close(&self, handle: TunnelHandle, reason: impl Into<String>) -> Result<()> {
        handle.close(reason).await
    }

    /// Subscribe to a tunnel. See [`TunnelHandle::subscribe`].
    pub fn subscribe(&self, handle: &TunnelHandle) -> TunnelStream {
        handle.subscribe()
    }

    /// Current transport connectivity
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch transport connectivity
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Counter snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Fail every tunnel with [`MuxError::Shutdown`] and stop the driver
    pub async fn shutdown(&self) -> Result<()> {
        debug!("Shutting down multiplexer");
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { ack: ack_tx })
            .await
            .map_err(|_| MuxError::Shutdown)?;
        let _ = ack_rx.await;
        info!("Multiplexer shutdown complete");
        Ok(())
    }
}

type ConnectFuture = BoxFuture<'static, std::result::Result<Connection, TransportError>>;

/// An encoded frame waiting for room on the connection
struct Outbound {
    message: Bytes,
    // Released once the connection takes the frame
    _permit: Option<OwnedSemaphorePermit>,
}

/// Owns the connection and the registry; the only writer of either
struct Driver {
    config: MuxConfig,
    codec: FrameCodec,
    commands: mpsc::Receiver<Command>,
    budget: OutboundBudget,
    connection: Option<Connection>,
    sender: Option<MessageSender>,
    outbound: VecDeque<Outbound>,
    transport: Option<Arc<dyn Transport>>,
    reconnect: Option<ConnectFuture>,
    failed_attempts: u32,
    registry: Registry,
    resume: Arc<Notify>,
    state_tx: watch::Sender<ConnectionState>,
    stats: Arc<MuxStats>,
}

impl Driver {
    fn new(
        config: MuxConfig,
        connection: Connection,
        transport: Option<Arc<dyn Transport>>,
        commands: mpsc::Receiver<Command>,
        budget: OutboundBudget,
        state_tx: watch::Sender<ConnectionState>,
        stats: Arc<MuxStats>,
    ) -> Self {
        let resume = Arc::new(Notify::new());
        let registry = Registry::new(
            connection.generation(),
            config.inbound_capacity,
            Arc::clone(&resume),
        );

        Self {
            config,
            codec: FrameCodec::new(),
            commands,
            budget,
            sender: Some(connection.sender()),
            outbound: VecDeque::new(),
            connection: Some(connection),
            transport,
            reconnect: None,
            failed_attempts: 0,
            registry,
            resume,
            state_tx,
            stats,
        }
    }

    async fn run(mut self) {
        info!(
            "Multiplexer driver started on generation {}",
            self.registry.generation()
        );

        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("All multiplexer handles dropped");
                        self.teardown(MuxError::Shutdown);
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }

                event = next_event(&mut self.connection) => {
                    match event {
                        TransportEvent::Message(bytes) => self.handle_message(bytes),
                        TransportEvent::Lost { reason } => self.handle_lost(reason),
                    }
                }

                room = outbound_room(self.sender.clone()), if !self.outbound.is_empty() => {
                    self.flush_outbound(room);
                }

                result = reconnected(&mut self.reconnect) => self.handle_reconnect(result),

                _ = self.resume.notified() => self.resume_paused(),

                _ = sweep.tick() => self.sweep(),
            }
        }

        self.budget.close();
        self.outbound.clear();
        self.sender = None;
        self.connection = None;
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("Multiplexer driver stopped");
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Open {
                binding,
                params,
                reply,
            } => self.open(binding, params, reply).await,
            Command::Write {
                generation, id, ..
            }
            | Command::Resize {
                generation, id, ..
            } if generation != self.registry.generation() => {
                debug!("Dropping command for tunnel {} of generation {}", id, generation);
            }
            Command::Close {
                generation,
                id,
                ack,
                ..
            } if generation != self.registry.generation() => {
                debug!("Tunnel {} of generation {} is already gone", id, generation);
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
            }
            Command::Write { id, data, permit, .. } => self.write(id, data, permit),
            Command::Resize { id, size, permit, .. } => self.resize(id, size, permit),
            Command::Close { id, reason, ack, .. } => self.close(id, reason, ack),
            Command::Shutdown { ack } => {
                self.teardown(MuxError::Shutdown);
                let _ = ack.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn open(&mut self, binding: BindingKey, params: StartParams, reply: OpenWaiter) {
        if self.connection.is_none() {
            debug!("Refusing open of {} while {}", binding, *self.state_tx.borrow());
            let _ = reply.send(Err(MuxError::TransportLost("not connected".to_string())));
            return;
        }

        match self
            .registry
            .reserve(binding.clone(), Instant::now(), self.config.open_timeout)
        {
            Ok(pending) => pending.waiter = Some(reply),
            Err(e) => {
                debug!("Refusing open of {}: {}", binding, e);
                let _ = reply.send(Err(e));
                return;
            }
        }

        info!("Opening tunnel for {}", binding);
        self.send_frame(Frame::start(binding, params));
    }

    fn write(&mut self, id: TunnelId, data: Bytes, permit: OwnedSemaphorePermit) {
        match self.registry.lookup_mut(id) {
            Some(tunnel) if tunnel.state() == TunnelState::Open => tunnel.touch(Instant::now()),
            Some(tunnel) => {
                debug!("Dropping write to tunnel {} while {}", id, tunnel.state());
                return;
            }
            None => {
                debug!("Dropping write to unknown tunnel {}", id);
                return;
            }
        }

        self.queue_frame(Frame::data(id, data), Some(permit));
    }

    fn resize(&mut self, id: TunnelId, size: WindowSize, permit: OwnedSemaphorePermit) {
        match self.registry.lookup(id).map(|tunnel| tunnel.state()) {
            Some(TunnelState::Open) => self.queue_frame(Frame::resize(id, size), Some(permit)),
            Some(state) => debug!("Dropping resize of tunnel {} while {}", id, state),
            None => debug!("Dropping resize of unknown tunnel {}", id),
        }
    }

    fn close(&mut self, id: TunnelId, reason: String, ack: Option<oneshot::Sender<Result<()>>>) {
        let deadline = Instant::now() + self.config.close_timeout;

        let Some(tunnel) = self.registry.lookup_mut(id) else {
            debug!("Close of unknown tunnel {}", id);
            if let Some(ack) = ack {
                let _ = ack.send(Ok(()));
            }
            return;
        };

        match tunnel.state() {
            TunnelState::Open => {
                tunnel.begin_close(reason.clone(), deadline);
                if let Some(ack) = ack {
                    tunnel.add_close_waiter(ack);
                }
                info!("Closing tunnel {}: {}", id, reason);
                self.send_frame(Frame::close(id, reason));
            }
            TunnelState::Closing => {
                if let Some(ack) = ack {
                    tunnel.add_close_waiter(ack);
                }
            }
            state => {
                debug!("Close of tunnel {} that is already {}", id, state);
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
            }
        }
    }

    fn handle_message(&mut self, bytes: Bytes) {
        MuxStats::bump(&self.stats.frames_in);

        let frame = match self.codec.decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame ({} bytes): {}", bytes.len(), e);
                MuxStats::bump(&self.stats.protocol_violations);
                return;
            }
        };
        trace!("Received {} frame", frame.kind());

        match frame {
            Frame::Data {
                tunnel_id,
                binding: Some(binding),
                payload,
            } => self.handle_assignment(tunnel_id, binding, payload),
            Frame::Data {
                tunnel_id,
                binding: None,
                payload,
            } => self.handle_data(tunnel_id, payload),
            Frame::Resize { tunnel_id, size } => self.handle_resize(tunnel_id, size),
            Frame::Close { tunnel_id, reason } => self.handle_remote_close(tunnel_id, reason),
            Frame::Error {
                tunnel_id,
                binding,
                message,
            } => self.handle_error(tunnel_id, binding, message),
            Frame::Start { binding, .. } => {
                warn!("Server sent a start frame for {}", binding);
                MuxStats::bump(&self.stats.protocol_violations);
            }
            Frame::Unknown { kind } => {
                debug!("Ignoring frame of unknown kind {:?}", kind);
                MuxStats::bump(&self.stats.unknown_kinds);
            }
        }
    }

    fn handle_assignment(&mut self, id: TunnelId, binding: BindingKey, payload: Bytes) {
        if let Some(tunnel) = self.registry.lookup(id) {
            if *tunnel.binding() == binding {
                self.handle_data(id, payload);
            } else {
                warn!(
                    "Tunnel {} of {} reassigned to {}",
                    id,
                    tunnel.binding(),
                    binding
                );
                MuxStats::bump(&self.stats.protocol_violations);
            }
            return;
        }

        match self.registry.assign(&binding, id, Instant::now()) {
            Ok(Assignment::Opened { opened, waiter }) => {
                info!("Tunnel {} opened for {}", id, binding);
                MuxStats::bump(&self.stats.tunnels_opened);
                self.handle_data(id, payload);

                let claimed = waiter.is_some_and(|waiter| waiter.send(Ok(opened)).is_ok());
                if !claimed {
                    debug!("Open of {} was abandoned before assignment", binding);
                    self.close(id, "open cancelled".to_string(), None);
                }
            }
            Ok(Assignment::Cancelled) => {
                info!("Closing tunnel {} assigned to abandoned {}", id, binding);
                self.send_frame(Frame::close(id, "open cancelled"));
            }
            Err(MuxError::UnknownBinding(_)) => {
                warn!("Tunnel {} assigned to unreserved binding {}", id, binding);
                MuxStats::bump(&self.stats.protocol_violations);
                self.registry.remove(id);
                self.send_frame(Frame::close(id, "unknown binding"));
            }
            Err(e) => {
                warn!("Refusing assignment of tunnel {}: {}", id, e);
                MuxStats::bump(&self.stats.protocol_violations);
                self.send_frame(Frame::close(id, "tunnel id reused"));
            }
        }
    }

    fn handle_data(&mut self, id: TunnelId, payload: Bytes) {
        let now = Instant::now();
        let stall_buffer = self.config.stall_buffer;

        let delivery = match self.registry.lookup_mut(id) {
            Some(tunnel) if tunnel.state().is_terminal() => {
                debug!("Dropping data for tunnel {} after it {}", id, tunnel.state());
                return;
            }
            Some(tunnel) => {
                // Empty payloads only acknowledge
                if payload.is_empty() {
                    tunnel.touch(now);
                    return;
                }
                tunnel.deliver(payload, now, stall_buffer)
            }
            None => {
                self.unknown_tunnel(id, Frame::DATA);
                return;
            }
        };

        match delivery {
            Delivery::Queued => {}
            Delivery::Parked => trace!("Tunnel {} paused behind its consumer", id),
            Delivery::Stalled => self.consumer_stalled(id),
        }
    }

    fn handle_resize(&mut self, id: TunnelId, size: WindowSize) {
        match self.registry.lookup_mut(id) {
            Some(tunnel) if !tunnel.state().is_terminal() => {
                tunnel.touch(Instant::now());
                tunnel.queue().set_resize(size);
            }
            Some(tunnel) => debug!("Dropping resize for tunnel {} after it {}", id, tunnel.state()),
            None => self.unknown_tunnel(id, Frame::RESIZE),
        }
    }

    fn handle_remote_close(&mut self, id: TunnelId, reason: String) {
        let Some(tunnel) = self.registry.lookup_mut(id) else {
            if self.registry.is_retired(id) {
                debug!("Close acknowledged for retired tunnel {}", id);
            } else {
                self.unknown_tunnel(id, Frame::CLOSE);
            }
            return;
        };

        match tunnel.state() {
            TunnelState::Open => {
                info!("Tunnel {} closed by server: {}", id, reason);
                tunnel.begin_close(reason.clone(), Instant::now());
                self.send_frame(Frame::close(id, reason.clone()));
                self.finish(id, TunnelEvent::Closed { reason });
            }
            TunnelState::Closing => {
                let reason = tunnel.close_reason().unwrap_or(reason.as_str()).to_string();
                debug!("Close of tunnel {} acknowledged", id);
                self.finish(id, TunnelEvent::Closed { reason });
            }
            state => debug!("Ignoring close for tunnel {} that is already {}", id, state),
        }
    }

    fn handle_error(&mut self, id: Option<TunnelId>, binding: Option<BindingKey>, message: String) {
        match (id, binding) {
            (Some(id), _) => match self.registry.lookup(id).map(|tunnel| tunnel.state()) {
                Some(state) if !state.is_terminal() => {
                    warn!("Tunnel {} failed remotely: {}", id, message);
                    self.fail(
                        id,
                        MuxError::Remote {
                            tunnel_id: id,
                            message,
                        },
                    );
                }
                Some(state) => debug!("Ignoring error for tunnel {} that is already {}", id, state),
                None => self.unknown_tunnel(id, Frame::ERROR),
            },
            (None, Some(binding)) => {
                if self.registry.reject(&binding, &message, Instant::now()) {
                    warn!("Server rejected {}: {}", binding, message);
                } else {
                    warn!("Server rejected unreserved binding {}: {}", binding, message);
                    MuxStats::bump(&self.stats.protocol_violations);
                }
            }
            (None, None) => warn!("Server error: {}", message),
        }
    }

    fn unknown_tunnel(&self, id: TunnelId, kind: &str) {
        if self.registry.is_retired(id) {
            debug!("Dropping late {} frame for retired tunnel {}", kind, id);
        } else {
            warn!("Dropping {} frame for unknown tunnel {}", kind, id);
        }
        MuxStats::bump(&self.stats.unknown_tunnel_frames);
    }

    fn consumer_stalled(&mut self, id: TunnelId) {
        warn!("Consumer of tunnel {} stalled", id);
        self.fail(id, MuxError::ConsumerStalled(id));
        self.send_frame(Frame::close(id, "consumer stalled"));
    }

    fn fail(&mut self, id: TunnelId, err: MuxError) {
        self.finish(id, TunnelEvent::Errored(err));
    }

    /// Move a tunnel to its terminal state, releasing its binding
    fn finish(&mut self, id: TunnelId, end: TunnelEvent) {
        let Some(tunnel) = self.registry.lookup_mut(id) else {
            return;
        };
        let errored = matches!(end, TunnelEvent::Errored(_));
        if !tunnel.finish(end) {
            return;
        }
        if errored {
            MuxStats::bump(&self.stats.tunnels_errored);
        }

        let drained = tunnel.is_drained();
        self.registry.release(id);
        if drained {
            self.registry.remove(id);
        }
    }

    /// Fail every tunnel and reservation of the current generation
    fn teardown(&mut self, err: MuxError) {
        let (pending, tunnels) = self.registry.reset(self.registry.generation());
        let now = Instant::now();

        let waiting = pending.len();
        for mut reservation in pending {
            reservation.cancel(now, err.clone());
        }

        let mut failed = 0;
        for mut tunnel in tunnels {
            if tunnel.finish(TunnelEvent::Errored(err.clone())) {
                failed += 1;
                MuxStats::bump(&self.stats.tunnels_errored);
            }
        }

        if failed > 0 || waiting > 0 {
            info!(
                "Failed {} tunnels and {} reservations: {}",
                failed, waiting, err
            );
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    fn handle_lost(&mut self, reason: String) {
        error!("Transport lost: {}", reason);
        self.connection = None;
        self.sender = None;
        self.outbound.clear();
        self.teardown(MuxError::TransportLost(reason));
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let Some(transport) = self.transport.clone() else {
            info!("No transport to reconnect with, staying disconnected");
            return;
        };

        let policy = &self.config.reconnect;
        if !policy.allows(self.failed_attempts) {
            error!(
                "Giving up on {} after {} failed attempts",
                transport.describe(),
                self.failed_attempts
            );
            self.state_tx.send_replace(ConnectionState::Disconnected);
            return;
        }

        let delay = policy.backoff(self.failed_attempts);
        info!("Reconnecting to {} in {:?}", transport.describe(), delay);
        self.state_tx.send_replace(ConnectionState::Connecting);
        self.reconnect = Some(Box::pin(async move {
            tokio::time::sleep(delay).await;
            transport.connect().await
        }));
    }

    fn handle_reconnect(&mut self, result: std::result::Result<Connection, TransportError>) {
        match result {
            Ok(connection) => {
                info!(
                    "Reconnected to {} as generation {}",
                    connection.peer(),
                    connection.generation()
                );
                self.failed_attempts = 0;
                self.registry.reset(connection.generation());
                self.outbound.clear();
                self.sender = Some(connection.sender());
                self.connection = Some(connection);
                MuxStats::bump(&self.stats.generations);
                self.state_tx.send_replace(ConnectionState::Connected);
            }
            Err(e) => {
                self.failed_attempts += 1;
                warn!("Reconnect attempt {} failed: {}", self.failed_attempts, e);
                self.schedule_reconnect();
            }
        }
    }

    fn resume_paused(&mut self) {
        for tunnel in self.registry.tunnels_mut() {
            if tunnel.has_parked() && tunnel.flush_parked() {
                debug!("Tunnel {} resumed", tunnel.id());
            }
        }
    }

    /// Enforce timeouts, detect stalls and forget drained tunnels
    fn sweep(&mut self) {
        let now = Instant::now();

        let expired = self.registry.expire_pending(now, self.config.open_timeout);
        if expired > 0 {
            warn!("{} opens timed out after {:?}", expired, self.config.open_timeout);
        }
        self.registry.prune_cancelled(now, self.config.orphan_ttl);

        for id in self.registry.ids() {
            let Some(tunnel) = self.registry.lookup_mut(id) else {
                continue;
            };

            if tunnel.has_parked() && !tunnel.flush_parked() {
                let stalled = tunnel
                    .stalled_for(now)
                    .is_some_and(|stalled| stalled >= self.config.stall_grace);
                if stalled {
                    self.consumer_stalled(id);
                    continue;
                }
            }

            match tunnel.state() {
                TunnelState::Open if !tunnel.has_consumers() => {
                    debug!(
                        "Tunnel {} for {} lost its last consumer after {:?}",
                        id,
                        tunnel.binding(),
                        tunnel.age(now)
                    );
                    self.close(id, "handle dropped".to_string(), None);
                }
                TunnelState::Closing if tunnel.close_expired(now) => {
                    warn!(
                        "Close of tunnel {} not acknowledged within {:?}",
                        id, self.config.close_timeout
                    );
                    self.fail(id, MuxError::CloseTimeout(id));
                    self.registry.remove(id);
                }
                state if state.is_terminal() && tunnel.is_drained() => {
                    trace!("Forgetting tunnel {} idle for {:?}", id, tunnel.idle_for(now));
                    self.registry.remove(id);
                }
                _ => {}
            }
        }
    }

    fn send_frame(&mut self, frame: Frame) {
        self.queue_frame(frame, None);
    }

    /// Encode `frame` behind everything already queued and hand over what fits
    fn queue_frame(&mut self, frame: Frame, permit: Option<OwnedSemaphorePermit>) {
        if self.sender.is_none() {
            debug!("Not connected, dropping {} frame", frame.kind());
            return;
        }

        let message = match self.codec.encode(&frame) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to encode {} frame: {}", frame.kind(), e);
                return;
            }
        };

        self.outbound.push_back(Outbound {
            message,
            _permit: permit,
        });
        self.drain_outbound();
    }

    /// Hand queued frames to the connection until it is full
    fn drain_outbound(&mut self) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };

        while let Some(frame) = self.outbound.pop_front() {
            match sender.try_send(frame.message.clone()) {
                Ok(()) => MuxStats::bump(&self.stats.frames_out),
                Err(_) => {
                    self.outbound.push_front(frame);
                    break;
                }
            }
        }

        if !self.outbound.is_empty() {
            trace!("{} frames waiting for the connection", self.outbound.len());
        }
    }

    fn flush_outbound(&mut self, room: std::result::Result<SendPermit, TransportError>) {
        match room {
            Ok(permit) => {
                if let Some(frame) = self.outbound.pop_front() {
                    permit.send(frame.message);
                    MuxStats::bump(&self.stats.frames_out);
                }
                self.drain_outbound();
            }
            Err(e) => {
                // The lost event that follows fails the tunnels
                debug!("Dropping {} queued frames: {}", self.outbound.len(), e);
                self.sender = None;
                self.outbound.clear();
            }
        }
    }
}

/// Next event of the live connection; pends forever while disconnected
async fn next_event(connection: &mut Option<Connection>) -> TransportEvent {
    match connection.as_mut() {
        Some(connection) => connection
            .next_event()
            .await
            .unwrap_or_else(|| TransportEvent::Lost {
                reason: "event channel closed".to_string(),
            }),
        None => pending().await,
    }
}

/// Room for one more message on the connection; pends forever while disconnected
async fn outbound_room(sender: Option<MessageSender>) -> std::result::Result<SendPermit, TransportError> {
    match sender {
        Some(sender) => sender.reserve().await,
        None => pending().await,
    }
}

/// Outcome of the in-flight reconnect attempt; pends forever without one
async fn reconnected(attempt: &mut Option<ConnectFuture>) -> std::result::Result<Connection, TransportError> {
    let result = match attempt.as_mut() {
        Some(connect) => connect.await,
        None => return pending().await,
    };
    *attempt = None;
    result
}
