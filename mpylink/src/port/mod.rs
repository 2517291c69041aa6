//! Transport abstraction for byte-stream links to the board.
//!
//! The protocol engine only needs a small capability set from a link: open
//! and close it, write raw bytes, wait for inbound bytes and throw stale ones
//! away. Platform-specific endpoints implement [`Transport`] and are handed
//! to a [`Connection`](crate::connection::Connection) at construction.
//!
//! ```text
//! +------------------+
//! |  CommandChannel  |   single in-flight command, timeout, correlation
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |  Transport trait |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+     +------------------+
//! | NativePort       |     | test doubles,    |
//! |  (serialport)    |     | sockets, ...     |
//! +------------------+     +------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Default read timeout of the underlying port.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(100),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

/// Serial port information.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
}

/// Byte-stream endpoint driven by a [`CommandChannel`](crate::channel::CommandChannel).
///
/// Inbound data is delivered through [`Transport::read_available`], which
/// waits at most `wait` for bytes and returns `Ok(0)` when none arrived.
pub trait Transport: Send {
    /// Open the endpoint. Opening an already open endpoint is a no-op.
    fn open(&mut self) -> Result<()>;

    /// Close the endpoint and release resources.
    fn close(&mut self) -> Result<()>;

    /// Whether the endpoint is open.
    fn is_open(&self) -> bool;

    /// Write all bytes.
    fn write_raw(&mut self, data: &[u8]) -> Result<()>;

    /// Block until written bytes have left the host.
    fn drain(&mut self) -> Result<()>;

    /// Read whatever arrived, waiting at most `wait`.
    fn read_available(&mut self, buf: &mut [u8], wait: Duration) -> Result<usize>;

    /// Drop buffered inbound bytes.
    fn discard_input(&mut self) -> Result<()>;

    /// Endpoint name (port path or identifier).
    fn name(&self) -> &str;
}

#[cfg(feature = "native")]
pub use native::{NativePort, list_ports};
