//! Byte-level access to 8-bit I/O ports.
//!
//! All port traffic in the process goes through one [`PortBus`] handle and
//! is serialised by a single lock; there is never concurrent traffic on
//! the window. A failed port operation is fatal to the transaction in
//! progress, never to the service.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

/// Errors from the raw port primitive.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// The port device could not be opened.
    #[error("failed to open port device {path}: {source}")]
    Open {
        /// Device path that was attempted.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A read or write on the device failed.
    #[error("port {port:#06x} {op} failed: {source}")]
    Io {
        /// Port address.
        port: u16,
        /// `"read"` or `"write"`.
        op: &'static str,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Raw 8-bit I/O port access.
///
/// Implementations must serialise access internally; callers issue plain
/// `&self` reads and writes from the EC worker thread.
pub trait PortBus: Send + Sync {
    /// Reads one byte from `port`.
    fn read(&self, port: u16) -> Result<u8, PortError>;

    /// Writes one byte to `port`.
    fn write(&self, port: u16, value: u8) -> Result<(), PortError>;
}

/// Port access through the kernel's raw port device.
///
/// Requires the privileges the daemon runs with; opening the device is the
/// startup hardware check.
#[derive(Debug)]
pub struct RawPortBus {
    device: Mutex<File>,
}

/// Default raw port device path.
pub const PORT_DEVICE: &str = "/dev/port";

impl RawPortBus {
    /// Opens the default port device.
    pub fn open() -> Result<Self, PortError> {
        Self::open_at(PORT_DEVICE)
    }

    /// Opens a specific port device path.
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self, PortError> {
        let path = path.as_ref();
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| PortError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            device: Mutex::new(device),
        })
    }
}

impl PortBus for RawPortBus {
    fn read(&self, port: u16) -> Result<u8, PortError> {
        let mut device = self.device.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut buf = [0u8; 1];
        device
            .seek(SeekFrom::Start(u64::from(port)))
            .and_then(|_| device.read_exact(&mut buf))
            .map_err(|source| PortError::Io {
                port,
                op: "read",
                source,
            })?;
        Ok(buf[0])
    }

    fn write(&self, port: u16, value: u8) -> Result<(), PortError> {
        let mut device = self.device.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        device
            .seek(SeekFrom::Start(u64::from(port)))
            .and_then(|_| device.write_all(&[value]))
            .map_err(|source| PortError::Io {
                port,
                op: "write",
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_device_reports_path() {
        let err = RawPortBus::open_at("/nonexistent/port-device").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("/nonexistent/port-device"), "{message}");
    }
}
