//! Connections to boards.
//!
//! A [`Connection`] ties one transport to one [`CommandChannel`] and an
//! [`EventBus`]. The [`ConnectionRegistry`](registry::ConnectionRegistry)
//! keeps at most one connection per port.

pub mod events;
pub mod registry;

pub use events::{ConnectionEvent, EventBus, SubscriptionId};
pub use registry::ConnectionRegistry;

use crate::channel::{CommandChannel, ConnectionState, DEFAULT_POLL_INTERVAL};
use crate::error::Result;
use crate::port::Transport;
use crate::retry::RetryPolicy;
use crate::transfer::FileTransferEngine;
use log::info;
use std::sync::Arc;
use std::time::Duration;

/// Connection tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Response budget for commands without their own timeout. Overrides the
    /// per-code defaults; `None` keeps them.
    pub command_timeout: Option<Duration>,
    /// Longest single transport wait.
    pub poll_interval: Duration,
    /// Retry policy for file transfers.
    pub retry: RetryPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            command_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    /// Set the command timeout for every command code.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// One board connection.
pub struct Connection {
    port: String,
    channel: CommandChannel,
    events: Arc<EventBus>,
    config: ConnectionConfig,
}

impl Connection {
    /// Wrap `transport` without opening it.
    pub fn new(transport: Box<dyn Transport>, config: ConnectionConfig) -> Self {
        let events = Arc::new(EventBus::new());
        let channel = CommandChannel::new(
            transport,
            config.command_timeout,
            config.poll_interval,
            Arc::clone(&events),
        );
        Self {
            port: channel.name().to_string(),
            channel,
            events,
            config,
        }
    }

    /// Wrap and open `transport`.
    pub fn open(transport: Box<dyn Transport>, config: ConnectionConfig) -> Result<Self> {
        let connection = Self::new(transport, config);
        connection.connect()?;
        Ok(connection)
    }

    /// Open a native serial port.
    #[cfg(feature = "native")]
    pub fn open_serial(serial: crate::port::SerialConfig, config: ConnectionConfig) -> Result<Self> {
        Self::open(Box::new(crate::port::NativePort::new(serial)), config)
    }

    /// Open the transport and announce [`ConnectionEvent::Connected`].
    pub fn connect(&self) -> Result<()> {
        self.channel.open()?;
        info!("Connected to {}", self.port);
        self.events
            .emit(&ConnectionEvent::Connected {
                port: self.port.clone(),
            });
        Ok(())
    }

    /// Close the transport and announce [`ConnectionEvent::Disconnected`].
    ///
    /// Closing an already closed connection does nothing.
    pub fn close(&self) -> Result<()> {
        if !self.channel.is_open() {
            return Ok(());
        }
        self.channel.close()?;
        info!("Disconnected from {}", self.port);
        self.events
            .emit(&ConnectionEvent::Disconnected {
                port: self.port.clone(),
            });
        Ok(())
    }

    /// Port name.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Whether the transport is open.
    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Current channel state.
    pub fn state(&self) -> ConnectionState {
        self.channel.state()
    }

    /// The command channel.
    pub fn channel(&self) -> &CommandChannel {
        &self.channel
    }

    /// Connection tuning.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Transfer engine bound to this connection's channel and retry policy.
    pub fn transfer_engine(&self) -> FileTransferEngine<'_> {
        FileTransferEngine::new(&self.channel, self.config.retry)
    }

    /// Register an event listener.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// Remove an event listener.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("port", &self.port)
            .field("state", &self.channel.state())
            .finish_non_exhaustive()
    }
}
