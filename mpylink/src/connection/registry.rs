//! One connection per port.

use crate::connection::Connection;
use crate::error::Result;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Keeps at most one open [`Connection`] per port name.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the open connection for `port`, or create one with `open`.
    ///
    /// A closed connection left in the registry is replaced.
    pub fn connect<F>(&self, port: &str, open: F) -> Result<Arc<Connection>>
    where
        F: FnOnce() -> Result<Connection>,
    {
        let mut connections = self.lock();
        if let Some(existing) = connections
            .get(port)
            .filter(|c| c.is_open())
        {
            debug!("Reusing connection to {port}");
            return Ok(Arc::clone(existing));
        }

        let connection = Arc::new(open()?);
        connections.insert(port.to_string(), Arc::clone(&connection));
        Ok(connection)
    }

    /// Connection for `port`, if registered.
    pub fn get(&self, port: &str) -> Option<Arc<Connection>> {
        self.lock()
            .get(port)
            .cloned()
    }

    /// Close and forget the connection for `port`.
    ///
    /// Returns `false` if no connection was registered.
    pub fn disconnect(&self, port: &str) -> Result<bool> {
        let removed = self.lock().remove(port);
        match removed {
            Some(connection) => {
                connection.close()?;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// Close and forget every connection.
    ///
    /// All connections are attempted; the first error is returned.
    pub fn disconnect_all(&self) -> Result<()> {
        let drained: Vec<_> = self
            .lock()
            .drain()
            .map(|(_, c)| c)
            .collect();
        let mut first_error = None;
        for connection in drained {
            if let Err(e) = connection.close() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Registered port names, sorted.
    pub fn ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self
            .lock()
            .keys()
            .cloned()
            .collect();
        ports.sort();
        ports
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
