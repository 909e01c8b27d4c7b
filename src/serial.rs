//! Real serial port support behind the [embedded_io] seam.
//!
//! The port is opened in exclusive mode (TIOCEXCL) so two driver instances
//! cannot contend for the same hardware; the lock is released when the
//! [SerialLink] is dropped. The port timeout is zero: reads return
//! immediately when no bytes are available, and all waiting happens in
//! [crate::transport::Transport] against its own deadline.

#![cfg(unix)]

use std::time::Duration;

use serialport::{SerialPort, TTYPort};

use crate::transport::Transport;

/// A claimed serial device node.
pub struct SerialLink(TTYPort);

#[derive(Debug)]
pub struct IoError(std::io::Error);

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0.kind() {
            std::io::ErrorKind::NotFound => embedded_io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::BrokenPipe => embedded_io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
            std::io::ErrorKind::InvalidData => embedded_io::ErrorKind::InvalidData,
            std::io::ErrorKind::TimedOut => embedded_io::ErrorKind::TimedOut,
            std::io::ErrorKind::WouldBlock => embedded_io::ErrorKind::TimedOut,
            std::io::ErrorKind::Interrupted => embedded_io::ErrorKind::Interrupted,
            std::io::ErrorKind::Unsupported => embedded_io::ErrorKind::Unsupported,
            std::io::ErrorKind::OutOfMemory => embedded_io::ErrorKind::OutOfMemory,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for SerialLink {
    type Error = IoError;
}

impl embedded_io::Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        std::io::Read::read(&mut self.0, buf).map_err(IoError)
    }
}

impl embedded_io::Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        std::io::Write::write(&mut self.0, buf).map_err(IoError)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        std::io::Write::flush(&mut self.0).map_err(IoError)
    }
}

/// Open and exclusively claim a serial device node.
///
/// `timeout` is the per-exchange receive deadline, not the port timeout.
pub fn open(
    path: &str,
    baud: u32,
    timeout: Duration,
) -> Result<Transport<SerialLink>, serialport::Error> {
    let mut port = serialport::new(path, baud)
        .timeout(Duration::ZERO)
        .open_native()?;
    port.set_exclusive(true)?;
    tracing::info!(path, baud, "serial port claimed");
    Ok(Transport::new(SerialLink(port), timeout))
}
