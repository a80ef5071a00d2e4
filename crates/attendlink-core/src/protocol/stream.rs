//! Byte channels
//!
//! A [`DeviceLink`] scans for candidate ports and opens the one picked by
//! discovery. The bridge only sees the resulting [`Transport`].

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialStream;

use super::serial::{list_ports, open_port, scan_ports, PortInfo};
use super::ProtocolError;

/// Abstraction for byte channels to the controller (serial port or in-memory)
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Channel for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opened byte stream owned by one device session
pub type Transport = Box<dyn Channel>;

/// Source of candidate ports and the transports behind them.
///
/// Both methods may block. The bridge calls them from the blocking pool with
/// the runtime entered, so `open` may still create tokio I/O objects.
pub trait DeviceLink: Send {
    /// Enumerate the ports currently visible
    fn scan(&mut self) -> Result<Vec<PortInfo>, ProtocolError>;

    /// Open `port` at `baud_rate`
    fn open(&mut self, port: &PortInfo, baud_rate: u32) -> Result<Transport, ProtocolError>;
}

/// Real serial ports through serialport/tokio-serial
#[derive(Debug, Clone, Copy)]
pub struct SerialLink {
    /// Also list /dev/ttyACM* and /dev/ttyUSB* entries the API missed
    pub dev_fallback: bool,
}

impl SerialLink {
    /// Link with the `/dev` fallback enabled
    pub fn new() -> Self {
        Self { dev_fallback: true }
    }
}

impl Default for SerialLink {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceLink for SerialLink {
    fn scan(&mut self) -> Result<Vec<PortInfo>, ProtocolError> {
        if self.dev_fallback {
            Ok(list_ports())
        } else {
            scan_ports()
        }
    }

    fn open(&mut self, port: &PortInfo, baud_rate: u32) -> Result<Transport, ProtocolError> {
        let stream: SerialStream = open_port(&port.name, baud_rate)?;
        Ok(Box::new(stream))
    }
}
