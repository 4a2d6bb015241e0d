//! Serial endpoint seam and port discovery.
//!
//! The pipeline talks to its device through [`RelayPort`] so tests can slot
//! in an in-memory double. The one production implementation wraps the
//! `serialport` crate with the line settings the relay needs: 8N1, no flow
//! control, and 1 ms read/write timeouts so workers observing the stop flag
//! never hang inside a blocking call.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::errors::PortError;

/// Substrings that mark a USB serial device as likely NFC hardware.
const NFC_KEYWORDS: [&str; 6] = ["nfc", "pn532", "acr122", "proxmark", "chameleon", "bombercat"];

/// Line settings for one serial endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// OS device path or name, e.g. `/dev/ttyUSB0` or `COM7`.
    pub port: String,
    pub baudrate: u32,
    /// Read and write timeout; keep this short so workers stay responsive.
    pub timeout: Duration,
}

impl SerialConfig {
    pub fn new(port: impl Into<String>, baudrate: u32) -> Self {
        Self {
            port: port.into(),
            baudrate,
            timeout: Duration::from_millis(1),
        }
    }
}

/// Capability surface of one duplex serial endpoint.
///
/// Timeouts are not errors: a read or write that times out reports `Ok(0)`
/// and the caller decides whether to retry.
pub trait RelayPort: Send {
    /// Bytes the OS currently has buffered for reading.
    fn bytes_to_read(&mut self) -> Result<usize, PortError>;

    /// Read up to `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PortError>;

    /// Write up to `buf.len()` bytes; on timeout nothing counts as written.
    fn write(&mut self, buf: &[u8]) -> Result<usize, PortError>;

    /// Push any OS-buffered output onto the wire.
    fn flush(&mut self) -> Result<(), PortError>;

    /// Second handle to the same endpoint, for the opposite worker.
    fn try_clone(&self) -> Result<Box<dyn RelayPort>, PortError>;
}

/// Opens the endpoint for a pipeline. Boxed so tests can substitute one that
/// returns in-memory ports.
pub type PortOpener =
    Box<dyn Fn(&SerialConfig) -> Result<Box<dyn RelayPort>, PortError> + Send + Sync>;

/// Shared form of [`PortOpener`], used by the relay to hand one opener to
/// both of its pipelines.
pub type SharedPortOpener =
    Arc<dyn Fn(&SerialConfig) -> Result<Box<dyn RelayPort>, PortError> + Send + Sync>;

struct NativePort {
    inner: Box<dyn serialport::SerialPort>,
    name: String,
}

/// Open `cfg.port` with the relay's line settings.
pub fn open_port(cfg: &SerialConfig) -> Result<Box<dyn RelayPort>, PortError> {
    let inner = serialport::new(&cfg.port, cfg.baudrate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(cfg.timeout)
        .open()
        .map_err(|source| PortError::Open {
            port: cfg.port.clone(),
            source,
        })?;
    debug!("opened {} at {} baud", cfg.port, cfg.baudrate);
    Ok(Box::new(NativePort {
        inner,
        name: cfg.port.clone(),
    }))
}

impl RelayPort for NativePort {
    fn bytes_to_read(&mut self) -> Result<usize, PortError> {
        match self.inner.bytes_to_read() {
            Ok(n) => Ok(n as usize),
            Err(e) => Err(PortError::Io(e.into())),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PortError> {
        match self.inner.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(PortError::Io(e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, PortError> {
        match self.inner.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(PortError::Io(e)),
        }
    }

    fn flush(&mut self) -> Result<(), PortError> {
        self.inner.flush().map_err(PortError::Io)
    }

    fn try_clone(&self) -> Result<Box<dyn RelayPort>, PortError> {
        let inner = self.inner.try_clone().map_err(|source| PortError::Open {
            port: self.name.clone(),
            source,
        })?;
        Ok(Box::new(NativePort {
            inner,
            name: self.name.clone(),
        }))
    }
}

/// Names of every serial port the OS reports.
pub fn list_ports() -> Vec<String> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .unwrap_or_default()
}

/// Ports whose USB descriptor strings suggest NFC hardware.
pub fn find_nfc_ports() -> Vec<String> {
    let Ok(ports) = serialport::available_ports() else {
        return Vec::new();
    };
    ports
        .into_iter()
        .filter(|p| match &p.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                let descriptor = format!(
                    "{} {}",
                    usb.product.as_deref().unwrap_or(""),
                    usb.manufacturer.as_deref().unwrap_or("")
                )
                .to_lowercase();
                NFC_KEYWORDS.iter().any(|k| descriptor.contains(k))
            }
            _ => false,
        })
        .map(|p| p.port_name)
        .collect()
}
