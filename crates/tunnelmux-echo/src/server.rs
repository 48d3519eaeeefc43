//! Per-connection protocol loop

use anyhow::Result;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};
use tunnelmux_proto::{BindingKey, Frame, FrameCodec, TunnelId};
use tunnelmux_transport::{Connection, TransportEvent};

/// Payload that makes the server close its end of a tunnel, like `exit` in a shell
pub const EXIT_COMMAND: &[u8] = b"exit\n";

/// Echo server behaviour
#[derive(Debug, Clone)]
pub struct EchoOptions {
    /// Targets whose `start` is refused with an error frame
    pub reject_targets: HashSet<String>,
    /// First tunnel id handed out on every connection
    pub first_id: u64,
}

impl Default for EchoOptions {
    fn default() -> Self {
        Self {
            reject_targets: HashSet::new(),
            first_id: 1,
        }
    }
}

impl EchoOptions {
    /// Refuse tunnels to `target`
    pub fn reject(mut self, target: impl Into<String>) -> Self {
        self.reject_targets.insert(target.into());
        self
    }

    /// Start numbering tunnels at `id`
    pub fn with_first_id(mut self, id: u64) -> Self {
        self.first_id = id;
        self
    }
}

/// Serves one client connection
pub struct EchoServer {
    connection: Connection,
    codec: FrameCodec,
    options: EchoOptions,
    next_id: u64,
    /// Open tunnels
    tunnels: HashMap<TunnelId, BindingKey>,
    /// Tunnels this side asked to close, waiting for the client's ack
    closing: HashSet<TunnelId>,
}

impl EchoServer {
    /// Create a server for `connection`
    pub fn new(connection: Connection, options: EchoOptions) -> Self {
        let next_id = options.first_id;
        Self {
            connection,
            codec: FrameCodec::new(),
            options,
            next_id,
            tunnels: HashMap::new(),
            closing: HashSet::new(),
        }
    }

    /// Serve until the client goes away
    pub async fn run(mut self) -> Result<()> {
        info!(
            "Serving {} (generation {})",
            self.connection.peer(),
            self.connection.generation()
        );

        while let Some(event) = self.connection.next_event().await {
            let bytes = match event {
                TransportEvent::Message(bytes) => bytes,
                TransportEvent::Lost { reason } => {
                    info!("Client {} went away: {}", self.connection.peer(), reason);
                    break;
                }
            };

            match self.codec.decode(&bytes) {
                Ok(frame) => self.handle_frame(frame).await?,
                Err(e) => warn!("Dropping malformed frame: {}", e),
            }
        }

        debug!("{} tunnels still open at disconnect", self.tunnels.len());
        Ok(())
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Start { binding, params } => {
                if self.options.reject_targets.contains(&binding.target) {
                    info!("Rejecting {}", binding);
                    let message = format!("unknown target {}", binding.target);
                    return self.send(Frame::reject(binding, message)).await;
                }

                let id = TunnelId(self.next_id);
                self.next_id += 1;
                info!("Assigned tunnel {} to {} ({} params)", id, binding, params.len());
                self.tunnels.insert(id, binding.clone());
                self.send(Frame::assign(id, binding, Bytes::new())).await
            }
            Frame::Data {
                tunnel_id, payload, ..
            } => {
                if !self.tunnels.contains_key(&tunnel_id) || self.closing.contains(&tunnel_id) {
                    debug!("Ignoring data for tunnel {}", tunnel_id);
                    return Ok(());
                }
                if payload.as_ref() == EXIT_COMMAND {
                    self.closing.insert(tunnel_id);
                    return self.send(Frame::close(tunnel_id, "exit")).await;
                }
                self.send(Frame::data(tunnel_id, payload)).await
            }
            Frame::Resize { tunnel_id, size } => {
                if self.tunnels.contains_key(&tunnel_id) && !self.closing.contains(&tunnel_id) {
                    self.send(Frame::resize(tunnel_id, size)).await?;
                }
                Ok(())
            }
            Frame::Close { tunnel_id, reason } => {
                if self.closing.remove(&tunnel_id) {
                    self.tunnels.remove(&tunnel_id);
                    debug!("Client acknowledged close of tunnel {}", tunnel_id);
                    return Ok(());
                }
                match self.tunnels.remove(&tunnel_id) {
                    Some(binding) => {
                        info!("Closing tunnel {} of {}: {}", tunnel_id, binding, reason);
                        self.send(Frame::close(tunnel_id, reason)).await
                    }
                    None => {
                        debug!("Ignoring close for unknown tunnel {}", tunnel_id);
                        Ok(())
                    }
                }
            }
            Frame::Error { message, .. } => {
                warn!("Client reported: {}", message);
                Ok(())
            }
            Frame::Unknown { kind } => {
                debug!("Ignoring frame of unknown kind {:?}", kind);
                Ok(())
            }
        }
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        let bytes = self.codec.encode(&frame)?;
        self.connection.send(bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};
    use tunnelmux_proto::{StartParams, WindowSize};
    use tunnelmux_transport::ConnectionConfig;

    struct Client {
        connection: Connection,
        codec: FrameCodec,
    }

    impl Client {
        async fn send(&self, frame: Frame) {
            self.connection
                .send(self.codec.encode(&frame).unwrap())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Frame {
            match timeout(Duration::from_secs(1), self.connection.next_event())
                .await
                .unwrap()
                .unwrap()
            {
                TransportEvent::Message(bytes) => self.codec.decode(&bytes).unwrap(),
                TransportEvent::Lost { reason } => panic!("lost: {}", reason),
            }
        }
    }

    fn start(options: EchoOptions) -> Client {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let config = ConnectionConfig::default();
        let server = EchoServer::new(Connection::from_stream(b, 1, "client", &config), options);
        tokio::spawn(server.run());
        Client {
            connection: Connection::from_stream(a, 1, "echo", &config),
            codec: FrameCodec::new(),
        }
    }

    #[tokio::test]
    async fn test_assigns_increasing_ids() {
        let mut client = start(EchoOptions::default().with_first_id(42));

        for (target, id) in [("a", 42), ("b", 43)] {
            let binding = BindingKey::shell(target);
            client.send(Frame::start(binding.clone(), StartParams::new())).await;
            assert_eq!(
                client.recv().await,
                Frame::assign(TunnelId(id), binding, Bytes::new())
            );
        }
    }

    #[tokio::test]
    async fn test_echoes_data_and_resize() {
        let mut client = start(EchoOptions::default());
        let binding = BindingKey::shell("s");
        client.send(Frame::start(binding, StartParams::new())).await;
        client.recv().await;

        client.send(Frame::data(TunnelId(1), Bytes::from_static(b"ls\n"))).await;
        client.send(Frame::resize(TunnelId(1), WindowSize::new(80, 24))).await;
        client.send(Frame::data(TunnelId(9), Bytes::from_static(b"nobody"))).await;
        client.send(Frame::data(TunnelId(1), Bytes::from_static(b"pwd\n"))).await;

        assert_eq!(client.recv().await, Frame::data(TunnelId(1), Bytes::from_static(b"ls\n")));
        assert_eq!(client.recv().await, Frame::resize(TunnelId(1), WindowSize::new(80, 24)));
        assert_eq!(client.recv().await, Frame::data(TunnelId(1), Bytes::from_static(b"pwd\n")));
    }

    #[tokio::test]
    async fn test_close_acknowledged_once() {
        let mut client = start(EchoOptions::default());
        client.send(Frame::start(BindingKey::shell("s"), StartParams::new())).await;
        client.recv().await;

        client.send(Frame::close(TunnelId(1), "bye")).await;
        client.send(Frame::close(TunnelId(1), "bye")).await;
        client.send(Frame::start(BindingKey::shell("t"), StartParams::new())).await;

        assert_eq!(client.recv().await, Frame::close(TunnelId(1), "bye"));
        assert!(matches!(client.recv().await, Frame::Data { tunnel_id: TunnelId(2), .. }));
    }

    #[tokio::test]
    async fn test_exit_closes_from_server_side() {
        let mut client = start(EchoOptions::default());
        client.send(Frame::start(BindingKey::shell("s"), StartParams::new())).await;
        client.recv().await;

        client.send(Frame::data(TunnelId(1), Bytes::from_static(EXIT_COMMAND))).await;
        assert_eq!(client.recv().await, Frame::close(TunnelId(1), "exit"));

        // The ack is not answered
        client.send(Frame::close(TunnelId(1), "exit")).await;
        client.send(Frame::start(BindingKey::shell("t"), StartParams::new())).await;
        assert!(matches!(client.recv().await, Frame::Data { tunnel_id: TunnelId(2), .. }));
    }

    #[tokio::test]
    async fn test_rejected_target() {
        let mut client = start(EchoOptions::default().reject("forbidden"));
        let binding = BindingKey::shell("forbidden");

        client.send(Frame::start(binding.clone(), StartParams::new())).await;
        assert_eq!(
            client.recv().await,
            Frame::reject(binding, "unknown target forbidden")
        );
    }
}
