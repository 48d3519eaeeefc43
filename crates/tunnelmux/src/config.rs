//! Multiplexer configuration and builder

use crate::{Multiplexer, Result};
use std::sync::Arc;
use std::time::Duration;
use tunnelmux_transport::{Connection, Transport};

/// How the multiplexer re-establishes a lost transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect at all
    pub enabled: bool,
    /// Delay before the first attempt
    pub initial_backoff: Duration,
    /// Upper bound for the doubling delay
    pub max_backoff: Duration,
    /// Give up after this many failed attempts (`None` retries forever)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt` (zero based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Whether another attempt is allowed after `failures` failures
    pub fn allows(&self, failures: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| failures < max)
    }
}

/// Multiplexer configuration
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// How long `open()` waits for the server to assign an id
    pub open_timeout: Duration,
    /// How long a local close waits for the server's acknowledgement
    pub close_timeout: Duration,
    /// Chunks buffered per tunnel before delivery pauses
    pub inbound_capacity: usize,
    /// Chunks parked behind a full inbound queue before the consumer is declared stalled
    pub stall_buffer: usize,
    /// How long a tunnel may stay paused before the consumer is declared stalled
    pub stall_grace: Duration,
    /// Period of the timeout and cleanup sweep
    pub sweep_interval: Duration,
    /// Capacity of the command channel shared by all handles
    pub command_buffer: usize,
    /// How long a cancelled reservation waits for a late assignment
    pub orphan_ttl: Duration,
    /// Largest payload carried by a single outbound data frame
    pub max_chunk_size: usize,
    /// Bytes written by handles but not yet taken by the transport, across all
    /// tunnels, before further writes wait
    pub outbound_buffer: usize,
    /// Transport reconnection behaviour
    pub reconnect: ReconnectPolicy,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            inbound_capacity: 256,
            stall_buffer: 1024,
            stall_grace: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(100),
            command_buffer: 256,
            orphan_ttl: Duration::from_secs(60),
            max_chunk_size: 64 * 1024,
            outbound_buffer: 4 * 1024 * 1024,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Builder for configuring and starting a [`Multiplexer`]
#[derive(Debug, Clone, Default)]
pub struct MultiplexerBuilder {
    config: MuxConfig,
}

impl MultiplexerBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: MuxConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the open timeout
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = timeout;
        self
    }

    /// Set the close acknowledgement timeout
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Set the per-tunnel inbound queue capacity
    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.config.inbound_capacity = capacity.max(1);
        self
    }

    /// Set how many chunks may be parked behind a full queue
    pub fn with_stall_buffer(mut self, buffer: usize) -> Self {
        self.config.stall_buffer = buffer;
        self
    }

    /// Set how long a tunnel may stay paused
    pub fn with_stall_grace(mut self, grace: Duration) -> Self {
        self.config.stall_grace = grace;
        self
    }

    /// Set the sweep period
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Set the command channel capacity
    pub fn with_command_buffer(mut self, capacity: usize) -> Self {
        self.config.command_buffer = capacity.max(1);
        self
    }

    /// Set how long cancelled reservations wait for a late assignment
    pub fn with_orphan_ttl(mut self, ttl: Duration) -> Self {
        self.config.orphan_ttl = ttl;
        self
    }

    /// Set the largest outbound data frame payload
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.config.max_chunk_size = size.max(1);
        self
    }

    /// Set how many written bytes may wait for the transport
    pub fn with_outbound_buffer(mut self, bytes: usize) -> Self {
        self.config.outbound_buffer = bytes.max(1);
        self
    }

    /// Set the reconnect policy
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Build the configuration without starting anything
    pub fn build_config(self) -> MuxConfig {
        self.config
    }

    /// Connect through `transport` and start the multiplexer.
    ///
    /// The transport is kept for reconnection.
    pub async fn connect(self, transport: Arc<dyn Transport>) -> Result<Multiplexer> {
        let connection = transport.connect().await?;
        Ok(Multiplexer::start(self.config, connection, Some(transport)))
    }

    /// Start the multiplexer over an already established connection.
    ///
    /// Without a transport there is nothing to reconnect with, so losing this
    /// connection leaves the multiplexer disconnected.
    pub fn attach(self, connection: Connection) -> Multiplexer {
        Multiplexer::start(self.config, connection, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MuxConfig::default();
        assert_eq!(config.open_timeout, Duration::from_secs(10));
        assert_eq!(config.inbound_capacity, 256);
        assert!(config.reconnect.enabled);
    }

    #[test]
    fn test_builder() {
        let config = MultiplexerBuilder::new()
            .with_open_timeout(Duration::from_millis(200))
            .with_inbound_capacity(0)
            .with_stall_buffer(8)
            .with_stall_grace(Duration::from_secs(1))
            .with_outbound_buffer(0)
            .with_reconnect(ReconnectPolicy::disabled())
            .build_config();

        assert_eq!(config.open_timeout, Duration::from_millis(200));
        assert_eq!(config.inbound_capacity, 1);
        assert_eq!(config.stall_buffer, 8);
        assert_eq!(config.stall_grace, Duration::from_secs(1));
        assert_eq!(config.outbound_buffer, 1);
        assert!(!config.reconnect.enabled);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            enabled: true,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            max_attempts: Some(3),
        };

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_secs(1));
        assert_eq!(policy.backoff(40), Duration::from_secs(1));

        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(!ReconnectPolicy::disabled().allows(0));
    }
}
