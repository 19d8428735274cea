/// Serial connection to the stepper driver board
///
/// One `MotorLink` owns the port. The pacer is its only regular writer and the
/// telemetry poll its only reader; `shutdown` is the one path that writes
/// around the pacer, so STOP goes out before the port is released.

use anyhow::{Context, Result};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;

use crate::protocol::{Command, LINE_END};

pub const DEFAULT_BAUD: u32 = 115_200;
/// Longest inbound line kept while waiting for '\n'.
const MAX_LINE_LEN: usize = 1024;

/// Byte stream underneath a `MotorLink`.
pub trait Transport: Send {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    /// Read whatever is available right now without blocking. `Ok(0)` means
    /// nothing was waiting.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// `Transport` over a real serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let waiting = self.port.bytes_to_read().map_err(io::Error::from)? as usize;
        if waiting == 0 {
            return Ok(0);
        }
        let n = waiting.min(buf.len());
        match self.port.read(&mut buf[..n]) {
            Ok(read) => Ok(read),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub baud: u32,
    pub read_timeout: Duration,
    /// Pause after opening while the board reboots on DTR.
    pub reset_delay: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            baud: DEFAULT_BAUD,
            read_timeout: Duration::from_millis(50),
            reset_delay: Duration::ZERO,
        }
    }
}

pub struct MotorLink {
    port_name: String,
    transport: Option<Box<dyn Transport>>,
    pending: Vec<u8>,
}

impl std::fmt::Debug for MotorLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotorLink")
            .field("port_name", &self.port_name)
            .field("open", &self.is_open())
            .finish()
    }
}

impl MotorLink {
    /// Open `port_name` at 8N1 with no flow control.
    pub fn open(port_name: &str, settings: &LinkSettings) -> Result<Self> {
        log::info!(target: "serial_link", "Connecting to driver on {} @{}", port_name, settings.baud);
        let port = serialport::new(port_name, settings.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(settings.read_timeout)
            .open()
            .with_context(|| format!("Failed to open {} at {} baud", port_name, settings.baud))?;

        if !settings.reset_delay.is_zero() {
            log::info!(target: "serial_link", "Port opened, waiting {:?} for board reset...", settings.reset_delay);
            std::thread::sleep(settings.reset_delay);
        }

        Ok(Self::from_transport(port_name, Box::new(SerialTransport::new(port))))
    }

    pub fn from_transport(port_name: &str, transport: Box<dyn Transport>) -> Self {
        Self {
            port_name: port_name.to_string(),
            transport: Some(transport),
            pending: Vec::new(),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Write one command line and flush.
    pub fn send(&mut self, cmd: &str) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Port {} not open", self.port_name))?;
        log::debug!(target: "serial_link", "SEND: {}", cmd);
        transport.write_all(format!("{}{}", cmd, LINE_END).as_bytes())?;
        transport.flush()?;
        Ok(())
    }

    /// Next complete inbound line, trimmed, or `None` if no full line has
    /// arrived yet. Read errors are swallowed.
    pub fn read_line(&mut self) -> Option<String> {
        if let Some(line) = self.take_line() {
            return Some(line);
        }
        let transport = self.transport.as_mut()?;
        let mut chunk = [0u8; 256];
        match transport.read_available(&mut chunk) {
            Ok(0) => {}
            Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
            Err(e) => {
                log::debug!(target: "serial_link", "Read error on {}: {}", self.port_name, e);
                return None;
            }
        }
        let line = self.take_line();
        if line.is_none() && self.pending.len() > MAX_LINE_LEN {
            log::debug!(target: "serial_link", "Discarding {} bytes without line end", self.pending.len());
            self.pending.clear();
        }
        line
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&raw).trim().to_string())
    }

    /// Send STOP straight to the port, flush, and close it. Safe to call
    /// more than once; all errors are ignored.
    pub fn shutdown(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        let stop = format!("{}{}", Command::Stop, LINE_END);
        if let Err(e) = transport.write_all(stop.as_bytes()).and_then(|_| transport.flush()) {
            log::warn!(target: "serial_link", "STOP on shutdown failed for {}: {}", self.port_name, e);
        }
        self.pending.clear();
        log::info!(target: "serial_link", "Closed {}", self.port_name);
    }
}

impl Drop for MotorLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    #[test]
    fn test_send_appends_newline() {
        let (transport, wire) = MockTransport::new();
        let mut link = MotorLink::from_transport("mock", Box::new(transport));
        link.send("SET_SPEED:40").unwrap();
        assert_eq!(wire.written(), "SET_SPEED:40\n");
    }

    #[test]
    fn test_read_line_reassembles_partial_input() {
        let (transport, wire) = MockTransport::new();
        let mut link = MotorLink::from_transport("mock", Box::new(transport));
        wire.push_inbound("CURR");
        assert_eq!(link.read_line(), None);
        wire.push_inbound("ENT:12.5\r\nCURRENT:13\n");
        assert_eq!(link.read_line().as_deref(), Some("CURRENT:12.5"));
        assert_eq!(link.read_line().as_deref(), Some("CURRENT:13"));
        assert_eq!(link.read_line(), None);
    }

    #[test]
    fn test_read_error_is_silent() {
        let (transport, wire) = MockTransport::new();
        let mut link = MotorLink::from_transport("mock", Box::new(transport));
        wire.fail_reads(true);
        assert_eq!(link.read_line(), None);
        assert!(link.is_open());
    }

    #[test]
    fn test_shutdown_sends_stop_once_and_closes() {
        let (transport, wire) = MockTransport::new();
        let mut link = MotorLink::from_transport("mock", Box::new(transport));
        link.shutdown();
        link.shutdown();
        assert!(!link.is_open());
        assert_eq!(wire.written(), "STOP\n");
        assert!(link.send("START").is_err());
        assert_eq!(link.read_line(), None);
    }

    #[test]
    fn test_drop_sends_stop() {
        let (transport, wire) = MockTransport::new();
        {
            let _link = MotorLink::from_transport("mock", Box::new(transport));
        }
        assert_eq!(wire.written(), "STOP\n");
    }

    #[test]
    fn test_shutdown_tolerates_write_failure() {
        let (transport, wire) = MockTransport::new();
        let mut link = MotorLink::from_transport("mock", Box::new(transport));
        wire.fail_writes(true);
        link.shutdown();
        assert!(!link.is_open());
    }

    #[test]
    fn test_open_missing_port_fails() {
        let err = MotorLink::open("/dev/does-not-exist-stepper", &LinkSettings::default()).unwrap_err();
        assert!(err.to_string().contains("/dev/does-not-exist-stepper"));
    }
}
