//! Native serial port transport using the `serialport` crate.

use {
    crate::{
        error::{Error, Result},
        port::{DataBits, FlowControl, Parity, PortInfo, SerialConfig, StopBits, Transport},
    },
    log::{debug, trace},
    serialport::ClearBuffer,
    std::{
        io::{ErrorKind, Read, Write},
        time::Duration,
    },
};

/// Native serial port transport.
///
/// Created closed; [`Transport::open`] applies the stored [`SerialConfig`].
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    config: SerialConfig,
    read_timeout: Duration,
}

impl NativePort {
    /// Create a transport for `config` without opening it.
    pub fn new(config: SerialConfig) -> Self {
        let read_timeout = config.timeout;
        Self {
            port: None,
            config,
            read_timeout,
        }
    }

    /// Create and open a transport.
    pub fn open_with(config: SerialConfig) -> Result<Self> {
        let mut port = Self::new(config);
        port.open()?;
        Ok(port)
    }

    /// Get the port configuration.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or(Error::NotConnected)
    }
}

impl Transport for NativePort {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        let port = serialport::new(&self.config.port_name, self.config.baud_rate)
            .timeout(self.config.timeout)
            .data_bits(self.config.data_bits.into())
            .parity(self.config.parity.into())
            .stop_bits(self.config.stop_bits.into())
            .flow_control(self.config.flow_control.into())
            .open()?;

        debug!(
            "Opened {} at {} baud",
            self.config.port_name, self.config.baud_rate
        );
        self.read_timeout = self.config.timeout;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the handle closes the port
        if self.port.take().is_some() {
            debug!("Closed {}", self.config.port_name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        trace!("TX {} bytes: {:02X?}", data.len(), data);
        let port = self.port_mut()?;
        port.write_all(data)
            .map_err(|e| Error::Communication(format!("write failed: {e}")))
    }

    fn drain(&mut self) -> Result<()> {
        let port = self.port_mut()?;
        port.flush()
            .map_err(|e| Error::Communication(format!("drain failed: {e}")))
    }

    fn read_available(&mut self, buf: &mut [u8], wait: Duration) -> Result<usize> {
        let wait = wait.max(Duration::from_millis(1));
        if wait != self.read_timeout {
            self.port_mut()?.set_timeout(wait)?;
            self.read_timeout = wait;
        }

        match self.port_mut()?.read(buf) {
            Ok(n) => {
                if n > 0 {
                    trace!("RX {n} bytes: {:02X?}", &buf[..n]);
                }
                Ok(n)
            },
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn discard_input(&mut self) -> Result<()> {
        self.port_mut()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.config.port_name
    }
}

/// List serial ports known to the operating system.
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports().map_err(Error::Serial)?;

    Ok(ports
        .into_iter()
        .map(|p| {
            let (vid, pid, manufacturer, product) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (
                    Some(info.vid),
                    Some(info.pid),
                    info.manufacturer,
                    info.product,
                ),
                _ => (None, None, None, None),
            };

            PortInfo {
                name: p.port_name,
                vid,
                pid,
                manufacturer,
                product,
            }
        })
        .collect())
}

// Type conversions from our types to serialport types

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => Self::None,
            FlowControl::Hardware => Self::Hardware,
            FlowControl::Software => Self::Software,
        }
    }
}
