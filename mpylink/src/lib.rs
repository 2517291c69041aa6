//! # mpylink
//!
//! Host-side protocol engine for MicroPython boards that speak a small framed
//! command protocol over a serial link.
//!
//! This crate provides:
//!
//! - Frame encoding/decoding with CRC16 validation
//! - A single-flight command channel with per-command timeouts
//! - Bounded retry for transport failures
//! - Chunked file upload with ordered overwrite/append writes
//! - A [`DeviceManager`] for file, code execution and network operations
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `serde`: serialization support for result types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mpylink::{Connection, ConnectionConfig, DeviceManager, SerialConfig, UploadOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let serial = SerialConfig::new("/dev/ttyUSB0", 115200);
//!         let connection = Connection::open_serial(serial, ConnectionConfig::default())?;
//!         let device = DeviceManager::new(Arc::new(connection));
//!
//!         for entry in device.list_directory("/")? {
//!             println!("{}", entry.name);
//!         }
//!
//!         device.write_file("main.py", b"print('hi')", &UploadOptions::default(), |p| {
//!             println!("{}%", p.percent());
//!         })?;
//!         println!("{}", device.execute_file("main.py")?.output);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod connection;
pub mod device;
pub mod error;
pub mod port;
pub mod protocol;
pub mod retry;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, list_ports};
pub use {
    channel::{
        CancelToken, ChannelPhase, Command, CommandChannel, CommandResponse, ConnectionState,
    },
    connection::{
        Connection, ConnectionConfig, ConnectionEvent, ConnectionRegistry, EventBus,
        SubscriptionId,
    },
    device::{DeviceInfo, DeviceManager, DirEntry, EntryKind, ExecutionResult},
    error::{Error, ErrorKind, Result},
    port::{PortInfo, SerialConfig, Transport},
    protocol::{CommandCode, CommandFrame, ResponseStatus, WriteMode},
    retry::RetryPolicy,
    transfer::{FileTransferEngine, TransferProgress, TransferReport, UploadOptions},
};
