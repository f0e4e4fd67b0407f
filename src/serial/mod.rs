//! Serial port access for the gateway adapters.
//!
//! The adapters only see two small traits: a [`PortProvider`] that enumerates
//! and opens ports, and the [`SerialTransport`] it hands back. Reads never
//! block: a transport returns whatever bytes are already buffered by the OS and
//! `Ok(0)` otherwise. The `serial` feature backs these with the `serialport`
//! crate; [`mock`] provides in-memory ports for tests and dry runs.
use serde::Serialize;
use std::io;

pub mod mock;

pub trait SerialTransport: Send {
    /// Read the bytes currently available, without waiting for more.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    /// Another process holds the port (UUCP lock file present).
    pub busy: bool,
}

pub trait PortProvider: Send {
    fn available_ports(&self) -> Vec<PortInfo>;
    /// Open `name` at `baud_rate`, 8 data bits, no parity, one stop bit.
    fn open(&mut self, name: &str, baud_rate: u32) -> io::Result<Box<dyn SerialTransport>>;
}

/// Ports of the host, through the `serialport` crate.
#[derive(Debug, Default, Clone)]
pub struct SystemPorts;

impl SystemPorts {
    pub fn new() -> Self {
        SystemPorts
    }
}

const LOCK_DIRS: &[&str] = &["/var/lock", "/run/lock"];

/// True when a UUCP-style `LCK..<device>` lock file exists for the port.
pub fn is_locked(port_name: &str) -> bool {
    let base = port_name.rsplit('/').next().unwrap_or(port_name);
    LOCK_DIRS
        .iter()
        .any(|dir| std::path::Path::new(dir).join(format!("LCK..{}", base)).exists())
}

#[cfg(feature = "serial")]
mod system {
    use super::*;
    use log::trace;
    use serialport::SerialPort;
    use std::io::{Read, Write};
    use std::time::Duration;

    pub struct SystemTransport {
        name: String,
        port: Box<dyn SerialPort>,
    }

    impl SerialTransport for SystemTransport {
        fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let available = self.port.bytes_to_read()? as usize;
            if available == 0 {
                return Ok(0);
            }
            let want = available.min(buf.len());
            match self.port.read(&mut buf[..want]) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
                Err(e) => Err(e),
            }
        }

        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            self.port.write_all(data)?;
            self.port.flush()
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    impl PortProvider for SystemPorts {
        fn available_ports(&self) -> Vec<PortInfo> {
            match serialport::available_ports() {
                Ok(ports) => ports
                    .into_iter()
                    .map(|p| PortInfo {
                        busy: is_locked(&p.port_name),
                        name: p.port_name,
                    })
                    .collect(),
                Err(e) => {
                    log::warn!("Unable to enumerate serial ports: {}", e);
                    Vec::new()
                }
            }
        }

        fn open(&mut self, name: &str, baud_rate: u32) -> io::Result<Box<dyn SerialTransport>> {
            let mut port = serialport::new(name, baud_rate)
                .timeout(Duration::from_millis(10))
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None)
                .open()?;
            // Boards with auto-reset on DTR reboot here and then announce themselves.
            let _ = port.write_data_terminal_ready(true);
            let _ = port.write_request_to_send(true);
            trace!("opened {} at {} baud", name, baud_rate);
            Ok(Box::new(SystemTransport {
                name: name.to_string(),
                port,
            }))
        }
    }
}

#[cfg(not(feature = "serial"))]
impl PortProvider for SystemPorts {
    fn available_ports(&self) -> Vec<PortInfo> {
        Vec::new()
    }

    fn open(&mut self, name: &str, _baud_rate: u32) -> io::Result<Box<dyn SerialTransport>> {
        log::warn!("Serial support not compiled in; cannot open {}", name);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "serial support not compiled in",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlocked_fake_port_is_not_busy() {
        assert!(!is_locked("/dev/ttyHOMEGATE-DOES-NOT-EXIST"));
    }
}
