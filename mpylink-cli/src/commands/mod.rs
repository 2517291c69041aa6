//! Command implementations.
//!
//! Each subcommand group is implemented in its own module. Commands that
//! talk to the board go through [`Context::open_device`].

pub(crate) mod completions;
pub(crate) mod device;
pub(crate) mod exec;
pub(crate) mod fs;
pub(crate) mod ports;
pub(crate) mod wifi;

use crate::config::Config;
use crate::serial::{SerialOptions, ask_remember_port, select_serial_port};
use anyhow::{Context as _, Result};
use console::style;
use log::warn;
use mpylink::{
    CancelToken, Connection, ConnectionConfig, DeviceManager, RetryPolicy, SerialConfig,
    UploadOptions,
};
use std::sync::Arc;
use std::time::Duration;

/// Baud rate used when neither flags nor config name one.
pub(crate) const DEFAULT_BAUD: u32 = 115200;

/// Settings shared by every command, resolved from flags, environment and config.
pub(crate) struct Context {
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub non_interactive: bool,
    pub quiet: bool,
    pub config: Config,
    pub cancel: CancelToken,
}

impl Context {
    /// Effective baud rate.
    pub fn baud(&self) -> u32 {
        self.baud
            .or(self.config.connection.baud)
            .unwrap_or(DEFAULT_BAUD)
    }

    /// Command timeout from `--timeout-ms` or the config file, if any.
    pub fn command_timeout(&self) -> Option<Duration> {
        self.timeout_ms
            .map(Duration::from_millis)
            .or_else(|| self.config.command_timeout())
    }

    /// Connection settings for a new session.
    pub fn connection_config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::default();
        if let Some(timeout) = self.command_timeout() {
            config = config.with_command_timeout(timeout);
        }
        if let Some(attempts) = self.config.transfer.retry_attempts {
            config = config.with_retry(RetryPolicy::default().with_max_attempts(attempts));
        }
        config
    }

    /// Upload settings, with command-line values taking precedence over config.
    pub fn upload_options(&self, chunk_size: Option<usize>, verify: bool) -> UploadOptions {
        let transfer = &self.config.transfer;
        let mut options = UploadOptions {
            chunk_size: chunk_size.or(transfer.chunk_size),
            verify: verify || transfer.verify,
            ..UploadOptions::default()
        };
        if let Some(attempts) = transfer.retry_attempts {
            options.retry_attempts = attempts;
        }
        options
    }

    /// Select a port, open it, and wrap it in a [`DeviceManager`] bound to
    /// this run's cancellation token.
    pub fn open_device(&mut self) -> Result<DeviceManager> {
        let options = SerialOptions {
            port: self.port.clone(),
            non_interactive: self.non_interactive,
        };
        let selected = select_serial_port(&options, &self.config)?;
        if !self.non_interactive {
            ask_remember_port(&selected, &mut self.config)?;
        }

        let baud = self.baud();
        if !self.quiet {
            eprintln!(
                "{} Using {} at {baud} baud",
                style("🔌").cyan(),
                style(&selected.name).bold()
            );
        }

        let serial = SerialConfig::new(selected.name.as_str(), baud);
        let connection = Connection::open_serial(serial, self.connection_config())
            .with_context(|| format!("Failed to open {}", selected.name))?;
        Ok(DeviceManager::new(Arc::new(connection)).with_cancel(self.cancel.clone()))
    }
}

/// Close the board session and hand back `result`.
///
/// A failed close is logged, never returned in place of `result`.
pub(crate) fn close_device<T>(device: &DeviceManager, result: mpylink::Result<T>) -> Result<T> {
    let connection = device.connection();
    settle(connection.port(), result, connection.close())
}

fn settle<T>(port: &str, result: mpylink::Result<T>, closed: mpylink::Result<()>) -> Result<T> {
    if let Err(e) = closed {
        warn!("Failed to close {port}: {e}");
    }
    Ok(result?)
}
