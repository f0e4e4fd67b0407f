//! In-memory serial ports.
//!
//! [`MockPorts`] is a [`PortProvider`] whose ports live in a shared bus, so a
//! test keeps a clone to inject device output, inspect what the adapter wrote,
//! and pull the plug, while the adapter owns its own clone.
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{PortInfo, PortProvider, SerialTransport};

#[derive(Debug, Default)]
struct MockPort {
    name: String,
    busy: bool,
    openable: bool,
    open: bool,
    failed: bool,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

#[derive(Debug, Default)]
struct Bus {
    ports: Vec<MockPort>,
    open_attempts: Vec<String>,
}

impl Bus {
    fn port(&mut self, name: &str) -> Option<&mut MockPort> {
        self.ports.iter_mut().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockPorts {
    bus: Arc<Mutex<Bus>>,
}

impl MockPorts {
    pub fn new() -> Self {
        Self::default()
    }

    fn bus(&self) -> MutexGuard<'_, Bus> {
        match self.bus.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a free port that opens successfully.
    pub fn add(&self, name: &str) -> &Self {
        self.bus().ports.push(MockPort {
            name: name.to_string(),
            openable: true,
            ..Default::default()
        });
        self
    }

    pub fn set_busy(&self, name: &str, busy: bool) {
        if let Some(p) = self.bus().port(name) {
            p.busy = busy;
        }
    }

    /// Make `open` fail for this port (permissions, unplugged, ...).
    pub fn set_openable(&self, name: &str, openable: bool) {
        if let Some(p) = self.bus().port(name) {
            p.openable = openable;
        }
    }

    pub fn remove(&self, name: &str) {
        self.bus().ports.retain(|p| p.name != name);
    }

    /// Queue bytes as if the device had sent them.
    pub fn inject(&self, name: &str, data: &[u8]) {
        if let Some(p) = self.bus().port(name) {
            p.rx.extend(data.iter().copied());
        }
    }

    /// Drain everything the adapter wrote to the port.
    pub fn take_written(&self, name: &str) -> String {
        self.bus()
            .port(name)
            .map(|p| String::from_utf8_lossy(&std::mem::take(&mut p.tx)).into_owned())
            .unwrap_or_default()
    }

    /// Make every subsequent read and write on an open port fail.
    pub fn fail(&self, name: &str) {
        if let Some(p) = self.bus().port(name) {
            p.failed = true;
        }
    }

    /// Clear a failure injected with [`MockPorts::fail`].
    pub fn heal(&self, name: &str) {
        if let Some(p) = self.bus().port(name) {
            p.failed = false;
        }
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.bus().ports.iter().any(|p| p.name == name && p.open)
    }

    /// Every port name `open` was called with, in order.
    pub fn open_attempts(&self) -> Vec<String> {
        self.bus().open_attempts.clone()
    }
}

impl PortProvider for MockPorts {
    fn available_ports(&self) -> Vec<PortInfo> {
        self.bus()
            .ports
            .iter()
            .map(|p| PortInfo {
                name: p.name.clone(),
                busy: p.busy,
            })
            .collect()
    }

    fn open(&mut self, name: &str, _baud_rate: u32) -> io::Result<Box<dyn SerialTransport>> {
        let mut bus = self.bus();
        bus.open_attempts.push(name.to_string());
        match bus.port(name) {
            Some(p) if p.openable => {
                p.open = true;
                p.failed = false;
                p.rx.clear();
                Ok(Box::new(MockTransport {
                    name: name.to_string(),
                    bus: self.bus.clone(),
                }))
            }
            Some(_) => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("cannot open {}", name),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such port {}", name),
            )),
        }
    }
}

struct MockTransport {
    name: String,
    bus: Arc<Mutex<Bus>>,
}

impl MockTransport {
    fn with_port<T>(&self, f: impl FnOnce(&mut MockPort) -> io::Result<T>) -> io::Result<T> {
        let mut bus = match self.bus.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match bus.port(&self.name) {
            Some(p) if p.failed => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("{} disconnected", p.name),
            )),
            Some(p) => f(p),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} removed", self.name),
            )),
        }
    }
}

impl SerialTransport for MockTransport {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_port(|p| {
            let n = buf.len().min(p.rx.len());
            for (slot, b) in buf.iter_mut().zip(p.rx.drain(..n)) {
                *slot = b;
            }
            Ok(n)
        })
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.with_port(|p| {
            p.tx.extend_from_slice(data);
            Ok(())
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        if let Ok(mut bus) = self.bus.lock() {
            if let Some(p) = bus.port(&self.name) {
                p.open = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_read_write_roundtrip() {
        let ports = MockPorts::new();
        ports.add("ttyUSB0");
        let mut provider = ports.clone();
        let mut t = provider.open("ttyUSB0", 115200).unwrap();
        assert!(ports.is_open("ttyUSB0"));
        ports.inject("ttyUSB0", b"hello\n");
        let mut buf = [0u8; 3];
        assert_eq!(t.read_available(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        t.write_all(b"0;0;3;0;2;\n").unwrap();
        assert_eq!(ports.take_written("ttyUSB0"), "0;0;3;0;2;\n");
        drop(t);
        assert!(!ports.is_open("ttyUSB0"));
    }

    #[test]
    fn failure_surfaces_as_io_error() {
        let ports = MockPorts::new();
        ports.add("ttyUSB1");
        let mut provider = ports.clone();
        let mut t = provider.open("ttyUSB1", 9600).unwrap();
        ports.fail("ttyUSB1");
        assert!(t.read_available(&mut [0u8; 8]).is_err());
        assert!(t.write_all(b"AT\r").is_err());
    }
}
