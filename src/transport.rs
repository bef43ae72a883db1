//! Byte transports for the retrieval client.
//!
//! [`Transport`] is the seam between the protocol code and the physical link.
//! The real implementation wraps a `serialport` handle configured for 8N1; the
//! simulated camera and scripted transports in [`crate::mock`] implement the same
//! trait for tests and offline runs.

use crate::config::SerialConfig;
use crate::error::{AppResult, RetrievalError};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use tracing::{debug, info};

/// A blocking, byte-oriented link to the device.
///
/// Reads are expected to block for at most the transport timeout and then fail
/// with `ErrorKind::TimedOut` (or return `Ok(0)`) when no data arrived.
pub trait Transport: Read + Write + Send {
    /// Discard any bytes pending in the input and output buffers.
    fn clear_buffers(&mut self) -> io::Result<()>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String {
        "transport".to_string()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn clear_buffers(&mut self) -> io::Result<()> {
        (**self).clear_buffers()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Serial port transport (8 data bits, no parity, 1 stop bit, no flow control).
///
/// The port is closed when the transport is dropped.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialTransport {
    /// Open the port described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Transport`] if the port cannot be opened.
    pub fn open(config: &SerialConfig) -> AppResult<Self> {
        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(config.timeout())
            .open()
            .map_err(|source| RetrievalError::Transport {
                port: config.port.clone(),
                source,
            })?;

        info!(
            port = %config.port,
            baud_rate = config.baud_rate,
            timeout_ms = config.timeout_ms,
            "Opened serial port"
        );

        Ok(Self {
            port,
            name: config.port.clone(),
        })
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Transport for SerialTransport {
    fn clear_buffers(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::All).map_err(io::Error::from)
    }

    fn describe(&self) -> String {
        format!("serial:{}", self.name)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        debug!(port = %self.name, "Closing serial port");
    }
}

/// A serial port found on the host.
#[derive(Debug, Clone)]
pub struct PortSummary {
    /// Port path (e.g. `/dev/ttyUSB0`, `COM3`).
    pub name: String,
    /// Port kind with USB details when available.
    pub kind: String,
}

/// Enumerate serial ports available on this machine.
pub fn list_ports() -> AppResult<Vec<PortSummary>> {
    let ports = serialport::available_ports().map_err(io::Error::from)?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let kind = match p.port_type {
                serialport::SerialPortType::UsbPort(usb) => format!(
                    "USB {:04x}:{:04x} {}",
                    usb.vid,
                    usb.pid,
                    usb.product.unwrap_or_default()
                ),
                serialport::SerialPortType::PciPort => "PCI".to_string(),
                serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                serialport::SerialPortType::Unknown => "Unknown".to_string(),
            };
            PortSummary {
                name: p.port_name,
                kind,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_port_is_fatal() {
        let config = SerialConfig {
            port: "/dev/this-port-does-not-exist".to_string(),
            ..SerialConfig::default()
        };
        let err = match SerialTransport::open(&config) {
            Ok(_) => panic!("opening a missing port should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, RetrievalError::Transport { .. }));
        assert!(!err.is_recoverable());
    }
}
