//! Consumer-facing tunnel handles

use crate::mux::Command;
use crate::registry::OpenedTunnel;
use crate::tunnel::{InboundQueue, TunnelStream};
use crate::{MuxError, Result};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::debug;
use tunnelmux_proto::{BindingKey, TunnelId, WindowSize};

/// Owner handle of an open tunnel.
///
/// Writes and resizes are ordered per tunnel and silently dropped once the
/// tunnel has left the open state. Dropping the handle closes the tunnel.
pub struct TunnelHandle {
    id: TunnelId,
    binding: BindingKey,
    writer: TunnelWriter,
    queue: Arc<InboundQueue>,
    closed: bool,
}

impl fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("id", &self.id)
            .field("binding", &self.binding)
            .finish()
    }
}

impl TunnelHandle {
    pub(crate) fn new(
        opened: OpenedTunnel,
        commands: mpsc::Sender<Command>,
        budget: OutboundBudget,
    ) -> Self {
        Self {
            id: opened.id,
            binding: opened.binding,
            writer: TunnelWriter {
                generation: opened.generation,
                id: opened.id,
                commands,
                budget,
            },
            queue: opened.queue,
            closed: false,
        }
    }

    /// Server-assigned id
    pub fn id(&self) -> TunnelId {
        self.id
    }

    /// Binding the tunnel was opened for
    pub fn binding(&self) -> &BindingKey {
        &self.binding
    }

    /// Send bytes to the remote end
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.writer.write(data).await
    }

    /// Tell the remote end the terminal geometry changed
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.writer.resize(cols, rows).await
    }

    /// Subscribe to inbound events
    pub fn subscribe(&self) -> TunnelStream {
        TunnelStream::new(self.id, Arc::clone(&self.queue))
    }

    /// A cloneable writer that does not own the tunnel
    pub fn writer(&self) -> TunnelWriter {
        self.writer.clone()
    }

    /// Close the tunnel and wait for the server's acknowledgement.
    ///
    /// Fails with [`MuxError::CloseTimeout`] when no acknowledgement arrives
    /// within the configured close timeout; the tunnel is gone either way.
    pub async fn close(mut self, reason: impl Into<String>) -> Result<()> {
        self.closed = true;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.writer
            .commands
            .send(Command::Close {
                generation: self.writer.generation,
                id: self.id,
                reason: reason.into(),
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| MuxError::Shutdown)?;
        ack_rx.await.map_err(|_| MuxError::Shutdown)?
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let close = Command::Close {
            generation: self.writer.generation,
            id: self.id,
            reason: "handle dropped".to_string(),
            ack: None,
        };
        // A full channel is fine: the sweep closes tunnels nobody holds
        if self.writer.commands.try_send(close).is_err() {
            debug!("Deferred close of dropped tunnel {}", self.id);
        }
    }
}

/// Write half of a tunnel, shareable between tasks
#[derive(Clone)]
pub struct TunnelWriter {
    generation: u64,
    id: TunnelId,
    commands: mpsc::Sender<Command>,
    budget: OutboundBudget,
}

impl fmt::Debug for TunnelWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelWriter").field("id", &self.id).finish()
    }
}

impl TunnelWriter {
    /// Id of the tunnel written to
    pub fn id(&self) -> TunnelId {
        self.id
    }

    /// Send bytes to the remote end.
    ///
    /// Large writes go out as several data frames. Waits while the
    /// multiplexer already holds its configured amount of unsent data, and
    /// only fails when the multiplexer itself is gone.
    ///
    /// Chunks of one call stay in order; chunks of concurrent calls through
    /// different clones may interleave.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let mut data = data.into();
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(self.budget.chunk_size));
            let permit = self.budget.acquire(chunk.len()).await?;
            self.commands
                .send(Command::Write {
                    generation: self.generation,
                    id: self.id,
                    data: chunk,
                    permit,
                })
                .await
                .map_err(|_| MuxError::Shutdown)?;
        }
        Ok(())
    }

    /// Tell the remote end the terminal geometry changed
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let permit = self.budget.acquire(1).await?;
        self.commands
            .send(Command::Resize {
                generation: self.generation,
                id: self.id,
                size: WindowSize::new(cols, rows),
                permit,
            })
            .await
            .map_err(|_| MuxError::Shutdown)
    }
}

/// Bytes the driver may hold for the transport on behalf of all writers.
///
/// A permit travels with each queued frame and is released once the
/// connection takes the frame, or when the frame is dropped.
#[derive(Clone)]
pub(crate) struct OutboundBudget {
    permits: Arc<Semaphore>,
    capacity: usize,
    chunk_size: usize,
}

impl OutboundBudget {
    pub(crate) fn new(capacity: usize, chunk_size: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Wait until `len` more bytes fit. A single frame larger than the whole
    /// budget takes all of it rather than waiting forever.
    pub(crate) async fn acquire(&self, len: usize) -> Result<OwnedSemaphorePermit> {
        let wanted = u32::try_from(len.clamp(1, self.capacity)).unwrap_or(u32::MAX);
        Arc::clone(&self.permits)
            .acquire_many_owned(wanted)
            .await
            .map_err(|_| MuxError::Shutdown)
    }

    /// Fail current and future writers with [`MuxError::Shutdown`]
    pub(crate) fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_budget_waits_until_released() {
        let budget = OutboundBudget::new(8, 4);
        let held = budget.acquire(6).await.unwrap();

        let blocked = timeout(Duration::from_millis(50), budget.acquire(4)).await;
        assert!(blocked.is_err());

        drop(held);
        let permit = timeout(Duration::from_secs(1), budget.acquire(4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(permit.num_permits(), 4);
    }

    #[tokio::test]
    async fn test_oversized_frame_takes_whole_budget() {
        let budget = OutboundBudget::new(8, 64);
        let permit = budget.acquire(64).await.unwrap();
        assert_eq!(permit.num_permits(), 8);
    }

    #[tokio::test]
    async fn test_closed_budget_fails_writers() {
        let budget = OutboundBudget::new(8, 4);
        let _held = budget.acquire(8).await.unwrap();
        let waiting = tokio::spawn({
            let budget = budget.clone();
            async move { budget.acquire(1).await.map(|_| ()) }
        });

        tokio::task::yield_now().await;
        budget.close();
        assert!(matches!(waiting.await.unwrap(), Err(MuxError::Shutdown)));
    }
}
