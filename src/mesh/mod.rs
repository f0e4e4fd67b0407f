//! # MySensors Gateway Link
//!
//! [`MeshLink`] owns the serial connection to a MySensors serial gateway and
//! turns its line stream into [`MeshEvent`]s.
//!
//! ## Connection lifecycle
//!
//! ```text
//! Disconnected ──discover──▶ Probing ──open ok──▶ AwaitingHandshake ──marker──▶ Connected
//!      ▲                        │                        │                          │
//!      └──── backoff ◀──────────┴──── no port ◀──────────┴── timeout / io error ◀───┘
//! ```
//!
//! - Discovery tries the last port that completed a handshake first, then scans
//!   every free port except reserved ones (the modem UART), resuming after the
//!   port probed last time so a silent device is not retried forever.
//! - After a port opens, the gateway must print its startup marker within the
//!   handshake window. Lines before that are logged, never dispatched.
//! - An I/O error is handled once per physical disconnect: the link reports
//!   `saveGateway "0"` and a reconnect is scheduled.
//!
//! Outbound frames that ask for an acknowledgment go through the
//! [`retry::RetryQueue`].
//!
//! Nothing here blocks. The owner calls [`MeshLink::poll`] regularly with the
//! current time; timers, retries and reads are all serviced from there.

pub mod codec;
pub mod retry;

use std::io;
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, info, trace, warn};

use crate::config::MeshConfig;
use crate::events::{MeshEvent, MeshEventSink};
use crate::framer::LineFramer;
use crate::logutil::{escape_bytes, escape_log};
use crate::metrics;
use crate::serial::{PortProvider, SerialTransport};
use crate::settings::{SettingsStore, Verbosity, KEY_PORT};
use crate::timer::{earliest, Timer};

use codec::{internal, MeshMessage, Route};
use retry::RetryQueue;

/// Reads drained per poll before yielding.
const MAX_READS_PER_POLL: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Probing,
    AwaitingHandshake,
    Connected,
}

pub struct MeshLink {
    config: MeshConfig,
    marker: String,
    ports: Box<dyn PortProvider>,
    settings: Box<dyn SettingsStore>,
    sink: Box<dyn MeshEventSink>,
    port: Option<Box<dyn SerialTransport>>,
    state: LinkState,
    in_error: bool,
    /// Port opened by the last discovery and not yet confirmed by a handshake.
    probed_port: Option<String>,
    framer: LineFramer,
    retry: RetryQueue,
    handshake: Timer,
    reconnect: Timer,
    verbosity: Verbosity,
}

impl MeshLink {
    pub fn new(
        config: MeshConfig,
        ports: Box<dyn PortProvider>,
        settings: Box<dyn SettingsStore>,
        sink: Box<dyn MeshEventSink>,
    ) -> Self {
        let verbosity = Verbosity::from_store(settings.as_ref());
        Self {
            marker: config.handshake_marker.to_lowercase(),
            config,
            ports,
            settings,
            sink,
            port: None,
            state: LinkState::Disconnected,
            in_error: false,
            probed_port: None,
            framer: LineFramer::new(),
            retry: RetryQueue::new(),
            handshake: Timer::new(),
            reconnect: Timer::new(),
            verbosity,
        }
    }

    /// First connection attempt: the remembered port, then a full scan.
    pub fn start(&mut self, now: Instant) {
        let last = self
            .settings
            .value(KEY_PORT)
            .filter(|p| !p.trim().is_empty());
        let mut connected = false;
        if let Some(port) = last {
            connected = self.discover(Some(&port), now);
        }
        if !connected && !self.discover(None, now) {
            error!("mesh: unable to connect to the MySensors gateway board");
            self.reconnect.start(now, self.config.cold_start_backoff());
        }
    }

    /// Service timers, pending retries and any bytes waiting on the port.
    pub fn poll(&mut self, now: Instant) {
        if self.handshake.fired(now) {
            self.handshake_timed_out(now);
        }
        if self.reconnect.fired(now) {
            self.reconnect_now(now);
        }
        for raw in self.retry.poll(now) {
            metrics::inc_mesh_retry_resent();
            self.write_frame(&raw, false, "retry", now);
        }
        self.read(now);
    }

    /// Encode and send `msg`; tracked for redelivery when `request_ack` is set
    /// and the frame's ack field is on.
    pub fn send(&mut self, msg: &MeshMessage, request_ack: bool, now: Instant) {
        self.write_frame(&msg.encode(), request_ack, "controller", now);
    }

    /// Send an already encoded frame (switch commands are stored pre-encoded).
    pub fn send_frame(&mut self, raw: &str, request_ack: bool, now: Instant) {
        self.write_frame(raw.trim_end(), request_ack, "controller", now);
    }

    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port.as_ref().map(|p| p.name())
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.handshake.deadline(),
            self.reconnect.deadline(),
            self.retry.next_deadline(),
        ])
    }

    pub fn shutdown(&mut self) {
        self.handshake.stop();
        self.reconnect.stop();
        self.retry.clear();
        if let Some(port) = self.port.take() {
            info!("mesh: closing {}", port.name());
        }
        self.state = LinkState::Disconnected;
    }

    /// The probed port stays marked so the next scan resumes after it.
    fn handshake_timed_out(&mut self, now: Instant) {
        if let Some(port) = self.port.take() {
            info!(
                "mesh: no startup message from {} within {:?}",
                port.name(),
                self.config.handshake_timeout()
            );
        }
        self.framer.reset();
        self.state = LinkState::Disconnected;
        self.reconnect.start(now, self.config.reconnect_backoff());
    }

    fn reconnect_now(&mut self, now: Instant) {
        metrics::inc_mesh_reconnects();
        self.in_error = false;
        if let Some(port) = self.port.take() {
            debug!("mesh: closing {} before rescanning", port.name());
        }
        self.handshake.stop();
        self.state = LinkState::Disconnected;
        if !self.discover(None, now) {
            self.reconnect.start(now, self.config.reconnect_backoff());
        }
    }

    /// Open the first eligible port. With `preferred`, only that port is tried;
    /// otherwise every free, non-reserved port, resuming after the last probe.
    fn discover(&mut self, preferred: Option<&str>, now: Instant) -> bool {
        self.state = LinkState::Probing;
        for info in self.ports.available_ports() {
            if info.busy {
                continue;
            }
            match preferred {
                None => {
                    if let Some(probed) = &self.probed_port {
                        if *probed == info.name {
                            self.probed_port = None;
                        }
                        continue;
                    }
                    if self.config.is_reserved(&info.name) {
                        continue;
                    }
                }
                Some(wanted) => {
                    if wanted != info.name {
                        continue;
                    }
                }
            }

            match self.ports.open(&info.name, self.config.baud_rate) {
                Ok(port) => {
                    self.port = Some(port);
                    self.framer.reset();
                    self.probed_port = Some(info.name.clone());
                    self.reconnect.stop();
                    self.handshake.start(now, self.config.handshake_timeout());
                    self.state = LinkState::AwaitingHandshake;
                    info!(
                        "mesh: connected on port {} (waiting for the startup message)",
                        info.name
                    );
                    return true;
                }
                Err(e) => debug!("mesh: cannot open {}: {}", info.name, e),
            }
        }
        self.probed_port = None;
        self.state = LinkState::Disconnected;
        false
    }

    fn read(&mut self, now: Instant) {
        let mut failure = None;
        if let Some(port) = self.port.as_mut() {
            let mut buf = [0u8; 1024];
            for _ in 0..MAX_READS_PER_POLL {
                match port.read_available(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        trace!("mesh: rx {}", escape_bytes(&buf[..n]));
                        self.framer.push(&buf[..n]);
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }
        while let Some(line) = self.framer.next_line() {
            self.handle_line(&line, now);
        }
        if let Some(e) = failure {
            self.handle_io_error(e, now);
        }
    }

    fn handle_line(&mut self, line: &str, now: Instant) {
        match self.state {
            LinkState::AwaitingHandshake => {
                if line.to_lowercase().contains(&self.marker) {
                    self.complete_handshake();
                    self.handle_frame(line, now);
                } else {
                    debug!("mesh: {}", escape_log(line));
                }
            }
            LinkState::Connected => self.handle_frame(line, now),
            LinkState::Disconnected | LinkState::Probing => {
                trace!("mesh: dropping line while disconnected: {}", escape_log(line));
            }
        }
    }

    fn complete_handshake(&mut self) {
        self.handshake.stop();
        self.reconnect.stop();
        let name = self
            .probed_port
            .take()
            .or_else(|| self.port.as_ref().map(|p| p.name().to_string()))
            .unwrap_or_default();
        if let Err(e) = self.settings.set_value(KEY_PORT, &name) {
            warn!("mesh: unable to remember port {}: {}", name, e);
        }
        self.state = LinkState::Connected;
        info!("mesh: registered with success on {}", name);
        self.sink.on_mesh_event(MeshEvent::gateway(true));
    }

    fn handle_frame(&mut self, line: &str, now: Instant) {
        if line.is_empty() {
            return;
        }
        let msg = match codec::decode(line) {
            Ok(msg) => msg,
            Err(e) => {
                metrics::inc_mesh_malformed();
                trace!("mesh: ignoring {}: {}", escape_log(line), e);
                return;
            }
        };
        self.retry.acknowledge(line);
        metrics::inc_mesh_frames_rx();

        let chatty = match self.verbosity {
            Verbosity::Debug => true,
            Verbosity::Info => !msg.is_internal(internal::LOG_MESSAGE),
            Verbosity::Quiet => false,
        };
        if chatty {
            info!("mesh: {}", escape_log(line));
        } else {
            trace!("mesh: {}", escape_log(line));
        }

        match codec::route(&msg) {
            Route::Emit(kinds) => {
                for kind in kinds {
                    self.sink.on_mesh_event(MeshEvent {
                        kind,
                        sender: msg.destination,
                        sensor: msg.sensor,
                        sub_type: msg.sub_type,
                        payload: msg.payload.clone(),
                    });
                }
            }
            Route::Reply(reply) => {
                let frame = codec::reply_frame(&msg, reply, Utc::now().timestamp());
                self.write_frame(&frame, false, "reply", now);
            }
            Route::Ignore => {}
        }
    }

    fn write_frame(&mut self, raw: &str, request_ack: bool, comment: &str, now: Instant) {
        let Some(port) = self.port.as_mut() else {
            error!("mesh: not connected to send the message {}", escape_log(raw));
            return;
        };
        if self.verbosity == Verbosity::Quiet {
            trace!("mesh: send {} ({})", escape_log(raw), comment);
        } else {
            info!("mesh: send {} ({})", escape_log(raw), comment);
        }
        let mut line = String::with_capacity(raw.len() + 1);
        line.push_str(raw);
        line.push('\n');
        if let Err(e) = port.write_all(line.as_bytes()) {
            self.handle_io_error(e, now);
            return;
        }
        metrics::inc_mesh_frames_tx();
        if RetryQueue::is_eligible(raw, request_ack) {
            self.retry.track(raw, now);
        }
    }

    fn handle_io_error(&mut self, err: io::Error, now: Instant) {
        if self.in_error {
            return;
        }
        self.in_error = true;
        error!("mesh: board disconnected because {}", err);
        self.port = None;
        self.framer.reset();
        self.probed_port = None;
        self.state = LinkState::Disconnected;
        self.handshake.stop();
        if !self.reconnect.is_active() {
            self.reconnect.start(now, self.config.reconnect_backoff());
        }
        self.sink.on_mesh_event(MeshEvent::gateway(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MeshEventKind, RecordingSink};
    use crate::serial::mock::MockPorts;
    use crate::settings::MemorySettings;
    use std::time::Duration;

    const USB: &str = "/dev/ttyUSB0";

    fn link(ports: &MockPorts, settings: &MemorySettings, sink: &RecordingSink) -> MeshLink {
        MeshLink::new(
            MeshConfig::default(),
            Box::new(ports.clone()),
            Box::new(settings.clone()),
            Box::new(sink.clone()),
        )
    }

    #[test]
    fn lines_before_handshake_are_not_dispatched() {
        let ports = MockPorts::new();
        ports.add(USB);
        let sink = RecordingSink::new();
        let mut l = link(&ports, &MemorySettings::new(), &sink);
        let t0 = Instant::now();
        l.start(t0);
        assert_eq!(l.state(), LinkState::AwaitingHandshake);
        ports.inject(USB, b"5;1;1;0;2;23\n");
        l.poll(t0);
        assert!(sink.mesh_events().is_empty());
    }

    #[test]
    fn write_error_latches_once() {
        let ports = MockPorts::new();
        ports.add(USB);
        let sink = RecordingSink::new();
        let mut l = link(&ports, &MemorySettings::new(), &sink);
        let t0 = Instant::now();
        l.start(t0);
        ports.inject(USB, b"0;255;3;0;14;Gateway startup complete.\n");
        l.poll(t0);
        ports.fail(USB);
        l.send(&MeshMessage::new(3, 1, codec::Command::Set, false, 2, "1"), false, t0);
        l.send(&MeshMessage::new(3, 1, codec::Command::Set, false, 2, "0"), false, t0);
        l.poll(t0);
        let lost: Vec<_> = sink
            .mesh_events()
            .into_iter()
            .filter(|e| e.kind == MeshEventKind::SaveGateway && e.payload == "0")
            .collect();
        assert_eq!(lost.len(), 1);
        assert!(!l.is_connected());
        assert!(l.next_deadline() <= Some(t0 + Duration::from_secs(17)));
    }

    #[test]
    fn send_without_port_is_dropped() {
        let ports = MockPorts::new();
        let sink = RecordingSink::new();
        let mut l = link(&ports, &MemorySettings::new(), &sink);
        let t0 = Instant::now();
        l.start(t0);
        l.send(&MeshMessage::new(3, 1, codec::Command::Set, true, 2, "1"), true, t0);
        assert!(l.retry_queue().is_empty());
    }
}
