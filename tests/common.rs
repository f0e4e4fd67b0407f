//! Test utilities & fixtures.
//! Builds links wired to mock ports, an in-memory settings store and a recording sink.
#![allow(dead_code)]

use std::time::{Duration, Instant};

use homegate::config::{MeshConfig, ModemConfig};
use homegate::events::RecordingSink;
use homegate::mesh::MeshLink;
use homegate::modem::ModemLink;
use homegate::serial::mock::MockPorts;
use homegate::settings::MemorySettings;

pub const HANDSHAKE: &[u8] = b"0;255;3;0;14;Gateway startup complete.\n";

pub struct MeshRig {
    pub ports: MockPorts,
    pub settings: MemorySettings,
    pub sink: RecordingSink,
    pub link: MeshLink,
    pub t0: Instant,
}

impl MeshRig {
    pub fn new(ports: MockPorts, settings: MemorySettings) -> Self {
        let sink = RecordingSink::new();
        let link = MeshLink::new(
            MeshConfig::default(),
            Box::new(ports.clone()),
            Box::new(settings.clone()),
            Box::new(sink.clone()),
        );
        Self {
            ports,
            settings,
            sink,
            link,
            t0: Instant::now(),
        }
    }

    pub fn at(&self, ms: u64) -> Instant {
        self.t0 + Duration::from_millis(ms)
    }

    /// Start the link and complete the handshake on `port`.
    pub fn connected(ports: MockPorts, port: &str) -> Self {
        let mut rig = Self::new(ports, MemorySettings::new());
        rig.link.start(rig.t0);
        rig.ports.inject(port, HANDSHAKE);
        rig.link.poll(rig.t0);
        rig
    }
}

pub struct ModemRig {
    pub ports: MockPorts,
    pub sink: RecordingSink,
    pub link: ModemLink,
    pub t0: Instant,
}

impl ModemRig {
    pub fn new(ports: MockPorts) -> Self {
        let sink = RecordingSink::new();
        let link = ModemLink::new(
            ModemConfig::default(),
            Box::new(ports.clone()),
            Box::new(sink.clone()),
        );
        Self {
            ports,
            sink,
            link,
            t0: Instant::now(),
        }
    }

    pub fn at(&self, ms: u64) -> Instant {
        self.t0 + Duration::from_millis(ms)
    }

    /// Device output, then a poll after the quiet period so the batch is processed.
    pub fn reply(&mut self, port: &str, data: &[u8], at_ms: u64) {
        self.ports.inject(port, data);
        self.link.poll(self.at(at_ms));
        self.link.poll(self.at(at_ms + 100));
    }
}
