//! # GSM Modem Link
//!
//! [`ModemLink`] drives a SIM900 module on a UART: it opens the port, waits for
//! the module to boot, runs the init sequence, sends queued SMS and reports
//! inbound ones.
//!
//! Modem output arrives in bursts that do not line up with reads, so lines are
//! collected into a batch which is processed once the port has been quiet for
//! [`QUIET_PERIOD`]. Each batch goes to the SMS extractor first, then to the
//! [`sequencer::AtSequencer`].
//!
//! On an I/O error the port is closed, the sequencer reset (queued messages are
//! kept) and the link retries after the configured backoff. A reconnect always
//! re-runs the init sequence.

pub mod sequencer;
pub mod sms;

use std::io;
use std::time::{Duration, Instant};

use log::{error, info, trace, warn};

use crate::config::ModemConfig;
use crate::events::SmsEventSink;
use crate::framer::LineFramer;
use crate::logutil::escape_log;
use crate::metrics;
use crate::serial::{PortProvider, SerialTransport};
use crate::timer::{earliest, Timer};

use sequencer::{AtSequencer, AtWriter};

pub const QUIET_PERIOD: Duration = Duration::from_millis(100);

const MAX_READS_PER_POLL: usize = 64;

/// Writes sequencer output to the port, keeping the first failure for the link.
struct PortWriter<'a> {
    port: &'a mut Option<Box<dyn SerialTransport>>,
    error: Option<io::Error>,
}

impl AtWriter for PortWriter<'_> {
    fn write_at(&mut self, data: &str) {
        if self.error.is_some() {
            return;
        }
        match self.port.as_mut() {
            Some(port) => {
                trace!("modem: write {}", escape_log(data));
                if let Err(e) = port.write_all(data.as_bytes()) {
                    self.error = Some(e);
                }
            }
            None => error!("Modem not connected to send {}", escape_log(data)),
        }
    }
}

pub struct ModemLink {
    config: ModemConfig,
    ports: Box<dyn PortProvider>,
    sink: Box<dyn SmsEventSink>,
    port: Option<Box<dyn SerialTransport>>,
    in_error: bool,
    framer: LineFramer,
    batch: String,
    quiet: Timer,
    init_delay: Timer,
    reconnect: Timer,
    sequencer: AtSequencer,
}

impl ModemLink {
    pub fn new(config: ModemConfig, ports: Box<dyn PortProvider>, sink: Box<dyn SmsEventSink>) -> Self {
        Self {
            config,
            ports,
            sink,
            port: None,
            in_error: false,
            framer: LineFramer::new(),
            batch: String::new(),
            quiet: Timer::new(),
            init_delay: Timer::new(),
            reconnect: Timer::new(),
            sequencer: AtSequencer::new(),
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.connect(now);
    }

    pub fn poll(&mut self, now: Instant) {
        if self.reconnect.fired(now) {
            metrics::inc_modem_reconnects();
            self.connect(now);
        }
        if self.init_delay.fired(now) {
            self.with_writer(now, |seq, w| seq.begin_init(now, w));
        }
        self.read(now);
        if self.quiet.fired(now) {
            self.process_batch(now);
        }
        self.with_writer(now, |seq, w| seq.poll(now, w));
    }

    /// Queue an SMS; refused (false) until the modem has been initialized once.
    pub fn send_sms(&mut self, recipient: &str, body: &str, now: Instant) -> bool {
        self.with_writer(now, |seq, w| seq.send_sms(recipient, body, now, w))
    }

    /// Write `command` followed by CR, only when connected and no flow is running.
    pub fn send_at_command(&mut self, command: &str, now: Instant) -> bool {
        if self.port.is_none() {
            warn!("Unable to send AT command {}: modem not connected", command);
            return false;
        }
        self.with_writer(now, |seq, w| seq.send_at_command(command, w))
    }

    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.sequencer.is_initialized()
    }

    pub fn pending_sms(&self) -> usize {
        self.sequencer.pending_jobs()
    }

    pub fn sequencer(&self) -> &AtSequencer {
        &self.sequencer
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.quiet.deadline(),
            self.init_delay.deadline(),
            self.reconnect.deadline(),
            self.sequencer.next_deadline(),
        ])
    }

    pub fn shutdown(&mut self) {
        self.quiet.stop();
        self.init_delay.stop();
        self.reconnect.stop();
        self.sequencer.reset();
        if let Some(port) = self.port.take() {
            info!("Closing modem port {}", port.name());
        }
    }

    fn connect(&mut self, now: Instant) {
        self.in_error = false;
        self.port = None;
        self.framer.reset();
        self.batch.clear();
        self.quiet.stop();
        self.init_delay.stop();
        self.sequencer.reset();

        for info in self.ports.available_ports() {
            if !info.name.contains(self.config.port_pattern.as_str()) {
                continue;
            }
            match self.ports.open(&info.name, self.config.baud_rate) {
                Ok(port) => {
                    info!("Modem connected on {}", info.name);
                    self.port = Some(port);
                    self.init_delay.start(now, self.config.init_delay());
                    return;
                }
                Err(e) => warn!("Unable to open modem port {}: {}", info.name, e),
            }
        }
        warn!(
            "No modem port matching {}, retrying in {:?}",
            self.config.port_pattern,
            self.config.reconnect_backoff()
        );
        self.reconnect.start(now, self.config.reconnect_backoff());
    }

    fn read(&mut self, now: Instant) {
        let mut failure = None;
        let mut received = false;
        if let Some(port) = self.port.as_mut() {
            let mut buf = [0u8; 512];
            for _ in 0..MAX_READS_PER_POLL {
                match port.read_available(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        self.framer.push(&buf[..n]);
                        received = true;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }
        while let Some(line) = self.framer.next_raw_line() {
            self.batch.push_str(&line);
        }
        if received {
            self.quiet.start(now, QUIET_PERIOD);
        }
        if let Some(e) = failure {
            self.handle_io_error(e, now);
        }
    }

    fn process_batch(&mut self, now: Instant) {
        let batch = std::mem::take(&mut self.batch);
        if batch.is_empty() {
            return;
        }
        trace!("modem: {}", escape_log(&batch));
        for sms in sms::extract(&batch) {
            info!("SMS received from {}", sms.sender);
            metrics::inc_sms_received();
            self.sink.on_sms(sms);
        }
        // A batch that only carried notifications is not a command response.
        let response = sms::without_notifications(&batch);
        if response.len() != batch.len() && response.trim().is_empty() {
            return;
        }
        self.with_writer(now, |seq, w| seq.on_response(&response, now, w));
    }

    fn with_writer<T>(&mut self, now: Instant, f: impl FnOnce(&mut AtSequencer, &mut PortWriter<'_>) -> T) -> T {
        let mut writer = PortWriter {
            port: &mut self.port,
            error: None,
        };
        let out = f(&mut self.sequencer, &mut writer);
        let failure = writer.error.take();
        if let Some(e) = failure {
            self.handle_io_error(e, now);
        }
        out
    }

    fn handle_io_error(&mut self, err: io::Error, now: Instant) {
        if self.in_error {
            return;
        }
        self.in_error = true;
        error!("Modem has been disconnected: {}", err);
        self.port = None;
        self.framer.reset();
        self.batch.clear();
        self.quiet.stop();
        self.init_delay.stop();
        self.sequencer.reset();
        self.reconnect.start(now, self.config.reconnect_backoff());
    }
}
