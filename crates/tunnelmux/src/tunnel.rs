//! Per-tunnel state machine and inbound delivery

use crate::{MuxError, Result};
use bytes::Bytes;
use futures::Stream;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, Notify};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};
use tunnelmux_proto::{BindingKey, TunnelId, WindowSize};

/// Lifecycle state of a tunnel.
///
/// `Closed` and `Errored` are terminal; nothing leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    /// Reserved locally, waiting for the server to assign an id
    Requested,
    /// Id assigned, data flows both ways
    Open,
    /// A close is in flight and waits for its acknowledgement
    Closing,
    /// Closed cleanly
    Closed,
    /// Failed
    Errored,
}

impl TunnelState {
    /// Whether the state is final
    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Errored)
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Requested, Open)
                | (Requested, Errored)
                | (Open, Closing)
                | (Open, Errored)
                | (Closing, Closed)
                | (Closing, Errored)
        )
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Requested => "requested",
            TunnelState::Open => "open",
            TunnelState::Closing => "closing",
            TunnelState::Closed => "closed",
            TunnelState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// What a subscriber observes on a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// Inbound payload, in arrival order
    Data(Bytes),
    /// The remote side changed the terminal geometry
    Resize(WindowSize),
    /// The tunnel closed cleanly. Terminal.
    Closed {
        /// Close reason
        reason: String,
    },
    /// The tunnel failed. Terminal.
    Errored(MuxError),
}

impl TunnelEvent {
    /// Whether this is the last event a subscriber will see
    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelEvent::Closed { .. } | TunnelEvent::Errored(_))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    chunks: VecDeque<Bytes>,
    resize: Option<WindowSize>,
    end: Option<TunnelEvent>,
}

/// Bounded inbound buffer shared by a tunnel and its subscribers.
///
/// Each chunk is handed to exactly one subscriber. The terminal event is
/// shown to every subscriber once the chunks are gone. A pending resize
/// overtakes queued chunks and only the latest geometry is kept.
#[derive(Debug)]
pub(crate) struct InboundQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    readable: Notify,
    paused: AtomicBool,
    resume: Arc<Notify>,
}

impl InboundQueue {
    pub(crate) fn new(capacity: usize, resume: Arc<Notify>) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(QueueInner::default()),
            readable: Notify::new(),
            paused: AtomicBool::new(false),
            resume,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a chunk, handing it back when the queue is full or finished
    pub(crate) fn try_push(&self, chunk: Bytes) -> std::result::Result<(), Bytes> {
        {
            let mut inner = self.lock();
            if inner.end.is_some() || inner.chunks.len() >= self.capacity {
                return Err(chunk);
            }
            inner.chunks.push_back(chunk);
        }
        self.readable.notify_waiters();
        Ok(())
    }

    pub(crate) fn set_resize(&self, size: WindowSize) {
        {
            let mut inner = self.lock();
            if inner.end.is_some() {
                return;
            }
            inner.resize = Some(size);
        }
        self.readable.notify_waiters();
    }

    /// Append `tail` regardless of capacity and seal the queue with `end`.
    ///
    /// Only the first call has any effect.
    pub(crate) fn finish(&self, end: TunnelEvent, tail: impl IntoIterator<Item = Bytes>) -> bool {
        {
            let mut inner = self.lock();
            if inner.end.is_some() {
                return false;
            }
            inner.chunks.extend(tail);
            inner.end = Some(end);
        }
        self.readable.notify_waiters();
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().chunks.len()
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    fn poll_event(&self, seen_end: &mut bool) -> Option<Option<TunnelEvent>> {
        if *seen_end {
            return Some(None);
        }

        let mut inner = self.lock();
        if let Some(size) = inner.resize.take() {
            return Some(Some(TunnelEvent::Resize(size)));
        }
        if let Some(chunk) = inner.chunks.pop_front() {
            drop(inner);
            if self.paused.load(Ordering::Acquire) {
                self.resume.notify_one();
            }
            return Some(Some(TunnelEvent::Data(chunk)));
        }
        if let Some(end) = &inner.end {
            *seen_end = true;
            return Some(Some(end.clone()));
        }
        None
    }

    async fn next(&self, seen_end: &mut bool) -> Option<TunnelEvent> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.poll_event(seen_end) {
                return event;
            }
            notified.await;
        }
    }
}

/// A subscription to a tunnel's inbound events.
///
/// Yields data and resize events until exactly one terminal event
/// ([`TunnelEvent::Closed`] or [`TunnelEvent::Errored`]), then `None`.
/// Several subscriptions of the same tunnel share its data: each chunk
/// goes to one of them.
#[derive(Debug)]
pub struct TunnelStream {
    id: TunnelId,
    queue: Arc<InboundQueue>,
    seen_end: bool,
}

impl TunnelStream {
    pub(crate) fn new(id: TunnelId, queue: Arc<InboundQueue>) -> Self {
        Self {
            id,
            queue,
            seen_end: false,
        }
    }

    /// Id of the subscribed tunnel
    pub fn tunnel_id(&self) -> TunnelId {
        self.id
    }

    /// Wait for the next event
    pub async fn recv(&mut self) -> Option<TunnelEvent> {
        self.queue.next(&mut self.seen_end).await
    }

    /// Adapt into a [`Stream`] of events
    pub fn into_stream(self) -> impl Stream<Item = TunnelEvent> + Send + 'static {
        futures::stream::unfold(self, |mut stream| async move {
            stream.recv().await.map(|event| (event, stream))
        })
    }
}

/// Outcome of handing an inbound chunk to a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Visible to subscribers
    Queued,
    /// Held back until the consumer catches up
    Parked,
    /// The parked backlog overflowed
    Stalled,
}

/// Registry-owned state of one assigned tunnel
#[derive(Debug)]
pub(crate) struct Tunnel {
    id: TunnelId,
    binding: BindingKey,
    state: TunnelState,
    created_at: Instant,
    last_activity: Instant,
    queue: Arc<InboundQueue>,
    parked: VecDeque<Bytes>,
    stalled_since: Option<Instant>,
    close_deadline: Option<Instant>,
    close_reason: Option<String>,
    close_waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl Tunnel {
    pub(crate) fn open(id: TunnelId, binding: BindingKey, queue: Arc<InboundQueue>, now: Instant) -> Self {
        Self {
            id,
            binding,
            state: TunnelState::Open,
            created_at: now,
            last_activity: now,
            queue,
            parked: VecDeque::new(),
            stalled_since: None,
            close_deadline: None,
            close_reason: None,
            close_waiters: Vec::new(),
        }
    }

    pub(crate) fn id(&self) -> TunnelId {
        self.id
    }

    pub(crate) fn binding(&self) -> &BindingKey {
        &self.binding
    }

    pub(crate) fn state(&self) -> TunnelState {
        self.state
    }

    pub(crate) fn queue(&self) -> &Arc<InboundQueue> {
        &self.queue
    }

    pub(crate) fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    fn transition(&mut self, next: TunnelState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!("Tunnel {} refused transition {} -> {}", self.id, self.state, next);
            return false;
        }
        debug!("Tunnel {} {} -> {}", self.id, self.state, next);
        self.state = next;
        true
    }

    /// Hand an inbound chunk to the subscribers, parking it when they lag
    pub(crate) fn deliver(&mut self, payload: Bytes, now: Instant, stall_buffer: usize) -> Delivery {
        self.touch(now);

        if self.parked.is_empty() {
            match self.queue.try_push(payload) {
                Ok(()) => return Delivery::Queued,
                Err(payload) => {
                    self.parked.push_back(payload);
                    self.stalled_since = Some(now);
                    self.queue.set_paused(true);
                }
            }
        } else {
            self.parked.push_back(payload);
        }

        if self.parked.len() > stall_buffer {
            Delivery::Stalled
        } else {
            Delivery::Parked
        }
    }

    /// Move parked chunks into the queue; true once nothing is parked
    pub(crate) fn flush_parked(&mut self) -> bool {
        while let Some(chunk) = self.parked.pop_front() {
            if let Err(chunk) = self.queue.try_push(chunk) {
                self.parked.push_front(chunk);
                return false;
            }
        }
        self.stalled_since = None;
        self.queue.set_paused(false);
        true
    }

    pub(crate) fn has_parked(&self) -> bool {
        !self.parked.is_empty()
    }

    pub(crate) fn stalled_for(&self, now: Instant) -> Option<Duration> {
        self.stalled_since
            .map(|since| now.saturating_duration_since(since))
    }

    /// Open -> Closing, arming the acknowledgement deadline
    pub(crate) fn begin_close(&mut self, reason: String, deadline: Instant) -> bool {
        if !self.transition(TunnelState::Closing) {
            return false;
        }
        self.close_reason = Some(reason);
        self.close_deadline = Some(deadline);
        true
    }

    pub(crate) fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    pub(crate) fn close_expired(&self, now: Instant) -> bool {
        self.state == TunnelState::Closing && self.close_deadline.is_some_and(|deadline| now >= deadline)
    }

    pub(crate) fn add_close_waiter(&mut self, waiter: oneshot::Sender<Result<()>>) {
        self.close_waiters.push(waiter);
    }

    /// Enter a terminal state and tell every subscriber and close waiter.
    ///
    /// Parked chunks are still delivered ahead of the terminal event, unless
    /// the consumer is the reason the tunnel failed.
    pub(crate) fn finish(&mut self, end: TunnelEvent) -> bool {
        let next = match &end {
            TunnelEvent::Closed { .. } => TunnelState::Closed,
            TunnelEvent::Errored(_) => TunnelState::Errored,
            TunnelEvent::Data(_) | TunnelEvent::Resize(_) => return false,
        };
        if !self.transition(next) {
            return false;
        }

        let tail: Vec<Bytes> = match &end {
            TunnelEvent::Errored(MuxError::ConsumerStalled(_)) => {
                self.parked.clear();
                Vec::new()
            }
            _ => self.parked.drain(..).collect(),
        };
        self.stalled_since = None;
        self.close_deadline = None;
        self.queue.set_paused(false);

        let outcome = match &end {
            TunnelEvent::Errored(err) => Err(err.clone()),
            _ => Ok(()),
        };
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }

        self.queue.finish(end, tail);
        true
    }

    /// Whether any handle or subscription still refers to this tunnel
    pub(crate) fn has_consumers(&self) -> bool {
        Arc::strong_count(&self.queue) > 1
    }

    /// A terminal tunnel may be dropped once nobody can read from it anymore
    pub(crate) fn is_drained(&self) -> bool {
        self.queue.len() == 0 || !self.has_consumers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn tunnel(capacity: usize) -> (Tunnel, Arc<Notify>) {
        let resume = Arc::new(Notify::new());
        let queue = Arc::new(InboundQueue::new(capacity, Arc::clone(&resume)));
        let tunnel = Tunnel::open(TunnelId(1), BindingKey::shell("s"), queue, Instant::now());
        (tunnel, resume)
    }

    fn stream(tunnel: &Tunnel) -> TunnelStream {
        TunnelStream::new(tunnel.id(), Arc::clone(tunnel.queue()))
    }

    #[test]
    fn test_transitions() {
        use TunnelState::*;
        assert!(Requested.can_transition_to(Open));
        assert!(Open.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(Closing.can_transition_to(Errored));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Errored.can_transition_to(Closed));
        assert!(!Open.can_transition_to(Requested));
        assert!(Closed.is_terminal());
        assert!(!Closing.is_terminal());
    }

    #[tokio::test]
    async fn test_delivery_in_order_then_terminal_once() {
        let (mut tunnel, _) = tunnel(8);
        let mut sub = stream(&tunnel);

        for chunk in [&b"a"[..], b"b", b"c"] {
            assert_eq!(
                tunnel.deliver(Bytes::copy_from_slice(chunk), Instant::now(), 8),
                Delivery::Queued
            );
        }
        assert!(tunnel.begin_close("bye".into(), Instant::now()));
        assert!(tunnel.finish(TunnelEvent::Closed { reason: "bye".into() }));
        assert!(!tunnel.finish(TunnelEvent::Errored(MuxError::Shutdown)));

        assert_eq!(sub.recv().await, Some(TunnelEvent::Data(Bytes::from_static(b"a"))));
        assert_eq!(sub.recv().await, Some(TunnelEvent::Data(Bytes::from_static(b"b"))));
        assert_eq!(sub.recv().await, Some(TunnelEvent::Data(Bytes::from_static(b"c"))));
        assert_eq!(sub.recv().await, Some(TunnelEvent::Closed { reason: "bye".into() }));
        assert_eq!(sub.recv().await, None);
        assert_eq!(tunnel.state(), TunnelState::Closed);
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_terminal() {
        let (mut tunnel, _) = tunnel(8);
        let mut first = stream(&tunnel);
        let mut second = stream(&tunnel);

        tunnel.finish(TunnelEvent::Errored(MuxError::TransportLost("gone".into())));

        let expected = Some(TunnelEvent::Errored(MuxError::TransportLost("gone".into())));
        assert_eq!(first.recv().await, expected);
        assert_eq!(second.recv().await, expected);
        assert_eq!(first.recv().await, None);
        assert_eq!(second.recv().await, None);
    }

    #[tokio::test]
    async fn test_parking_and_resume() {
        let (mut tunnel, resume) = tunnel(2);
        let mut sub = stream(&tunnel);
        let now = Instant::now();

        assert_eq!(tunnel.deliver(Bytes::from_static(b"1"), now, 2), Delivery::Queued);
        assert_eq!(tunnel.deliver(Bytes::from_static(b"2"), now, 2), Delivery::Queued);
        assert_eq!(tunnel.deliver(Bytes::from_static(b"3"), now, 2), Delivery::Parked);
        assert_eq!(tunnel.deliver(Bytes::from_static(b"4"), now, 2), Delivery::Parked);
        assert_eq!(tunnel.deliver(Bytes::from_static(b"5"), now, 2), Delivery::Stalled);
        assert!(tunnel.stalled_for(now).is_some());

        // Reading while paused wakes the driver
        assert_eq!(sub.recv().await, Some(TunnelEvent::Data(Bytes::from_static(b"1"))));
        timeout(Duration::from_millis(100), resume.notified())
            .await
            .expect("resume notification");

        assert!(!tunnel.flush_parked());
        assert_eq!(sub.recv().await, Some(TunnelEvent::Data(Bytes::from_static(b"2"))));
        assert_eq!(sub.recv().await, Some(TunnelEvent::Data(Bytes::from_static(b"3"))));
        assert!(tunnel.flush_parked());
        assert!(!tunnel.has_parked());
        assert!(tunnel.stalled_for(now).is_none());
        assert_eq!(sub.recv().await, Some(TunnelEvent::Data(Bytes::from_static(b"4"))));
        assert_eq!(sub.recv().await, Some(TunnelEvent::Data(Bytes::from_static(b"5"))));
    }

    #[tokio::test]
    async fn test_stalled_tunnel_drops_parked_chunks() {
        let (mut tunnel, _) = tunnel(1);
        let mut sub = stream(&tunnel);
        let now = Instant::now();

        tunnel.deliver(Bytes::from_static(b"kept"), now, 0);
        assert_eq!(tunnel.deliver(Bytes::from_static(b"lost"), now, 0), Delivery::Stalled);
        tunnel.finish(TunnelEvent::Errored(MuxError::ConsumerStalled(TunnelId(1))));

        assert_eq!(sub.recv().await, Some(TunnelEvent::Data(Bytes::from_static(b"kept"))));
        assert_eq!(
            sub.recv().await,
            Some(TunnelEvent::Errored(MuxError::ConsumerStalled(TunnelId(1))))
        );
    }

    #[tokio::test]
    async fn test_resize_overtakes_data() {
        let (mut tunnel, _) = tunnel(8);
        let mut sub = stream(&tunnel);

        tunnel.deliver(Bytes::from_static(b"x"), Instant::now(), 8);
        tunnel.queue().set_resize(WindowSize::new(80, 24));
        tunnel.queue().set_resize(WindowSize::new(120, 40));

        assert_eq!(sub.recv().await, Some(TunnelEvent::Resize(WindowSize::new(120, 40))));
        assert_eq!(sub.recv().await, Some(TunnelEvent::Data(Bytes::from_static(b"x"))));
    }

    #[tokio::test]
    async fn test_close_waiters_resolved() {
        let (mut tunnel, _) = tunnel(8);
        let (tx, rx) = oneshot::channel();

        tunnel.begin_close("done".into(), Instant::now());
        tunnel.add_close_waiter(tx);
        assert!(tunnel.close_expired(Instant::now()));
        tunnel.finish(TunnelEvent::Errored(MuxError::CloseTimeout(TunnelId(1))));

        assert_eq!(rx.await.unwrap(), Err(MuxError::CloseTimeout(TunnelId(1))));
    }

    #[tokio::test]
    async fn test_drained_without_consumers() {
        let (mut tunnel, _) = tunnel(8);
        let sub = stream(&tunnel);
        tunnel.deliver(Bytes::from_static(b"x"), Instant::now(), 8);
        tunnel.finish(TunnelEvent::Errored(MuxError::Shutdown));

        assert!(!tunnel.is_drained());
        drop(sub);
        assert!(tunnel.is_drained());
    }

    #[test]
    fn test_recv_wakes_on_delivery() {
        let (mut tunnel, _) = tunnel(8);
        let mut sub = stream(&tunnel);

        let mut recv = tokio_test::task::spawn(sub.recv());
        tokio_test::assert_pending!(recv.poll());

        tunnel.deliver(Bytes::from_static(b"x"), Instant::now(), 8);
        assert!(recv.is_woken());
        tokio_test::assert_ready_eq!(recv.poll(), Some(TunnelEvent::Data(Bytes::from_static(b"x"))));
    }
}
