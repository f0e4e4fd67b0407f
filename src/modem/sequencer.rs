//! AT command sequencing for the SIM900 modem.
//!
//! Two command flows share one phase variable, so at most one of them is in
//! flight:
//!
//! ```text
//! Idle(0)
//!  ├─ SMS:  1 mode ─▶ 2 ok? ─▶ 3 recipient ─▶ 4 echo? ─▶ 5 body ─▶ 6 echo? ─▶ 7 Ctrl-Z ─▶ 8 +CMGS? ─▶ Idle
//!  └─ init: 100 mode ─▶ 101 ok? ─▶ 102 notify ─▶ 103 ok? ─▶ 104 sleep ─▶ 105 ok? ─▶ Idle (initialized)
//! ```
//!
//! Odd "send" phases write a command and arm the response timeout; the "await"
//! phases check the next response batch. An SMS that fails or times out returns
//! to idle and stays at the head of the queue until the next pacing tick. Init
//! steps are retried, sharing one budget of [`INIT_RETRIES`].
//!
//! The sequencer never touches the port itself: it writes through an
//! [`AtWriter`] supplied by the caller on every call.
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::logutil::escape_log;
use crate::metrics;
use crate::timer::{earliest, Timer};

/// Written before every flow to take the module out of sleep mode 2.
pub const WAKEUP: &str = "WAKEUP\r";
pub const CTRL_Z: &str = "\x1a";

pub const WAKE_DELAY: Duration = Duration::from_millis(100);
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);
/// The network may take several seconds to accept a message.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);
pub const INIT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const INIT_RETRIES: u8 = 5;
/// Pacing between queued messages when the modem is busy.
pub const QUEUE_RETRY: Duration = Duration::from_secs(15);
pub const NEXT_JOB_DELAY: Duration = Duration::from_millis(10);

const SET_TEXT_MODE: &str = "AT+CMGF=1";
const SET_NEW_MESSAGE_INDICATION: &str = "AT+CNMI=2,2,0,0,0";
const SET_SLEEP_MODE: &str = "AT+CSCLK=2";
const OK: &str = "OK";
const SENT: &str = "+CMGS:";
const CALL_READY: &str = "Call Ready";
const NEW_MESSAGE: &str = "+CMT:";

pub trait AtWriter {
    fn write_at(&mut self, data: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmsPhase {
    SetTextMode = 1,
    AwaitTextMode = 2,
    SetRecipient = 3,
    AwaitRecipient = 4,
    SendBody = 5,
    AwaitBody = 6,
    SendTerminator = 7,
    AwaitSent = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InitPhase {
    SetTextMode = 100,
    AwaitTextMode = 101,
    SetIndication = 102,
    AwaitIndication = 103,
    SetSleepMode = 104,
    AwaitSleepMode = 105,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sms(SmsPhase),
    Init(InitPhase),
}

impl Phase {
    /// Numeric phase as it appears in logs: 0, 1..=8 or 100..=105.
    pub fn code(&self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Sms(p) => *p as u8,
            Phase::Init(p) => *p as u8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsJob {
    pub recipient: String,
    pub body: String,
}

#[derive(Debug)]
pub struct AtSequencer {
    phase: Phase,
    jobs: VecDeque<SmsJob>,
    initialized: bool,
    ever_initialized: bool,
    init_retries: u8,
    step: Timer,
    response_timeout: Timer,
    queue: Timer,
}

impl Default for AtSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl AtSequencer {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            jobs: VecDeque::new(),
            initialized: false,
            ever_initialized: false,
            init_retries: INIT_RETRIES,
            step: Timer::new(),
            response_timeout: Timer::new(),
            queue: Timer::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// True once any init sequence has completed since construction.
    pub fn ever_initialized(&self) -> bool {
        self.ever_initialized
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &SmsJob> {
        self.jobs.iter()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.step.deadline(),
            self.response_timeout.deadline(),
            self.queue.deadline(),
        ])
    }

    /// Forget the current flow after the port went away. Queued jobs are kept.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.initialized = false;
        self.step.stop();
        self.response_timeout.stop();
        self.queue.stop();
    }

    pub fn begin_init(&mut self, now: Instant, w: &mut dyn AtWriter) {
        info!("Initializing GSM module");
        self.initialized = false;
        self.init_retries = INIT_RETRIES;
        self.response_timeout.stop();
        self.phase = Phase::Init(InitPhase::SetTextMode);
        w.write_at(WAKEUP);
        self.step.start(now, WAKE_DELAY);
    }

    /// Queue an SMS. Refused while the modem has never been initialized.
    pub fn send_sms(&mut self, recipient: &str, body: &str, now: Instant, w: &mut dyn AtWriter) -> bool {
        if !self.ever_initialized {
            warn!("Unable to send SMS to {}: GSM module not initialized", recipient);
            return false;
        }
        self.jobs.push_back(SmsJob {
            recipient: recipient.to_string(),
            body: body.to_string(),
        });
        self.process_queue(now, w);
        true
    }

    /// Raw passthrough, only while no flow is running.
    pub fn send_at_command(&mut self, command: &str, w: &mut dyn AtWriter) -> bool {
        if self.phase != Phase::Idle {
            warn!(
                "Unable to send AT command, modem busy (phase {})",
                self.phase.code()
            );
            return false;
        }
        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\r');
        w.write_at(&line);
        true
    }

    pub fn poll(&mut self, now: Instant, w: &mut dyn AtWriter) {
        if self.response_timeout.fired(now) {
            self.on_timeout(now);
        }
        if self.step.fired(now) {
            self.advance("", now, w);
        }
        if self.queue.fired(now) {
            self.process_queue(now, w);
        }
    }

    /// Feed one batch of modem output (everything received before a quiet gap).
    pub fn on_response(&mut self, batch: &str, now: Instant, w: &mut dyn AtWriter) {
        self.advance(batch, now, w);
    }

    fn process_queue(&mut self, now: Instant, w: &mut dyn AtWriter) {
        let Some(job) = self.jobs.front() else {
            self.queue.stop();
            return;
        };
        if self.phase == Phase::Idle && self.initialized {
            info!("Sending SMS to {}: {}", job.recipient, escape_log(&job.body));
            self.phase = Phase::Sms(SmsPhase::SetTextMode);
            w.write_at(WAKEUP);
            self.step.start(now, WAKE_DELAY);
            if self.jobs.len() > 1 {
                self.queue.start(now, QUEUE_RETRY);
            }
        } else {
            self.queue.start(now, QUEUE_RETRY);
        }
    }

    fn advance(&mut self, batch: &str, now: Instant, w: &mut dyn AtWriter) {
        self.response_timeout.stop();
        self.step.stop();
        match self.phase {
            Phase::Idle => self.unsolicited(batch),
            Phase::Sms(phase) => self.advance_sms(phase, batch, now, w),
            Phase::Init(phase) => self.advance_init(phase, batch, now, w),
        }
    }

    fn unsolicited(&self, batch: &str) {
        if batch.is_empty() || batch.contains(NEW_MESSAGE) {
            return;
        }
        if batch.contains(CALL_READY) {
            error!("GSM module has rebooted");
        } else {
            debug!("GSM: {}", escape_log(batch));
        }
    }

    fn advance_sms(&mut self, phase: SmsPhase, batch: &str, now: Instant, w: &mut dyn AtWriter) {
        let Some(job) = self.jobs.front().cloned() else {
            warn!("SMS phase {} without a queued message", phase as u8);
            self.phase = Phase::Idle;
            return;
        };
        match phase {
            SmsPhase::SetTextMode => {
                self.command(SET_TEXT_MODE, SmsPhase::AwaitTextMode, RESPONSE_TIMEOUT, now, w)
            }
            SmsPhase::AwaitTextMode => {
                if batch.contains(SET_TEXT_MODE) && batch.contains(OK) {
                    self.phase = Phase::Sms(SmsPhase::SetRecipient);
                    self.advance_sms(SmsPhase::SetRecipient, "", now, w);
                } else if !batch.is_empty() {
                    self.sms_failed("text mode", batch);
                }
            }
            SmsPhase::SetRecipient => {
                let command = format!("AT+CMGS=\"{}\"", job.recipient);
                self.command(&command, SmsPhase::AwaitRecipient, RESPONSE_TIMEOUT, now, w)
            }
            SmsPhase::AwaitRecipient => {
                if batch.contains(&job.recipient) {
                    self.phase = Phase::Sms(SmsPhase::SendBody);
                    self.advance_sms(SmsPhase::SendBody, "", now, w);
                } else if !batch.is_empty() {
                    self.sms_failed("recipient", batch);
                }
            }
            SmsPhase::SendBody => {
                self.command(&job.body, SmsPhase::AwaitBody, RESPONSE_TIMEOUT, now, w)
            }
            SmsPhase::AwaitBody => {
                if batch.contains(&job.body) {
                    self.phase = Phase::Sms(SmsPhase::SendTerminator);
                    self.advance_sms(SmsPhase::SendTerminator, "", now, w);
                } else if !batch.is_empty() {
                    self.sms_failed("body", batch);
                }
            }
            SmsPhase::SendTerminator => {
                w.write_at(CTRL_Z);
                w.write_at("\r");
                self.phase = Phase::Sms(SmsPhase::AwaitSent);
                self.response_timeout.start(now, SEND_TIMEOUT);
            }
            SmsPhase::AwaitSent => {
                if batch.contains(SENT) && batch.contains(OK) {
                    info!("SMS sent to {}", job.recipient);
                    metrics::inc_sms_sent();
                    self.jobs.pop_front();
                    self.phase = Phase::Idle;
                    if !self.jobs.is_empty() {
                        self.queue.start(now, NEXT_JOB_DELAY);
                    }
                } else if !batch.is_empty() {
                    self.sms_failed("send", batch);
                }
            }
        }
    }

    fn advance_init(&mut self, phase: InitPhase, batch: &str, now: Instant, w: &mut dyn AtWriter) {
        match phase {
            InitPhase::SetTextMode => {
                self.init_command(SET_TEXT_MODE, InitPhase::AwaitTextMode, now, w)
            }
            InitPhase::SetIndication => {
                self.init_command(SET_NEW_MESSAGE_INDICATION, InitPhase::AwaitIndication, now, w)
            }
            InitPhase::SetSleepMode => {
                self.init_command(SET_SLEEP_MODE, InitPhase::AwaitSleepMode, now, w)
            }
            InitPhase::AwaitTextMode => {
                self.check_init(SET_TEXT_MODE, InitPhase::SetIndication, phase, batch, now, w)
            }
            InitPhase::AwaitIndication => self.check_init(
                SET_NEW_MESSAGE_INDICATION,
                InitPhase::SetSleepMode,
                phase,
                batch,
                now,
                w,
            ),
            InitPhase::AwaitSleepMode => {
                if confirmed(batch, SET_SLEEP_MODE) {
                    info!("GSM module initialized");
                    self.initialized = true;
                    self.ever_initialized = true;
                    self.phase = Phase::Idle;
                    if !self.jobs.is_empty() {
                        self.queue.start(now, NEXT_JOB_DELAY);
                    }
                } else if !batch.is_empty() {
                    self.init_failed(phase, "unexpected response", batch, now);
                }
            }
        }
    }

    fn check_init(
        &mut self,
        command: &str,
        next: InitPhase,
        phase: InitPhase,
        batch: &str,
        now: Instant,
        w: &mut dyn AtWriter,
    ) {
        if confirmed(batch, command) {
            self.phase = Phase::Init(next);
            self.advance_init(next, "", now, w);
        } else if !batch.is_empty() {
            self.init_failed(phase, "unexpected response", batch, now);
        }
    }

    fn command(&mut self, command: &str, next: SmsPhase, timeout: Duration, now: Instant, w: &mut dyn AtWriter) {
        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\r');
        w.write_at(&line);
        self.phase = Phase::Sms(next);
        self.response_timeout.start(now, timeout);
    }

    fn init_command(&mut self, command: &str, next: InitPhase, now: Instant, w: &mut dyn AtWriter) {
        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\r');
        w.write_at(&line);
        self.phase = Phase::Init(next);
        self.response_timeout.start(now, RESPONSE_TIMEOUT);
    }

    fn on_timeout(&mut self, now: Instant) {
        match self.phase {
            Phase::Idle => {}
            Phase::Sms(phase) => {
                warn!("Timeout while sending SMS at phase {}", phase as u8);
                metrics::inc_sms_failed();
                self.phase = Phase::Idle;
            }
            Phase::Init(phase) => self.init_failed(phase, "timeout", "", now),
        }
    }

    fn sms_failed(&mut self, step: &str, batch: &str) {
        warn!(
            "Unable to send SMS ({} error at phase {}): {}",
            step,
            self.phase.code(),
            escape_log(batch)
        );
        metrics::inc_sms_failed();
        self.phase = Phase::Idle;
    }

    /// Go back to the send step of `phase`'s pair if the retry budget allows.
    fn init_failed(&mut self, phase: InitPhase, reason: &str, batch: &str, now: Instant) {
        let retry_phase = match phase {
            InitPhase::SetTextMode | InitPhase::AwaitTextMode => InitPhase::SetTextMode,
            InitPhase::SetIndication | InitPhase::AwaitIndication => InitPhase::SetIndication,
            InitPhase::SetSleepMode | InitPhase::AwaitSleepMode => InitPhase::SetSleepMode,
        };
        if self.init_retries > 0 {
            self.init_retries -= 1;
            debug!(
                "GSM init {} at phase {} ({}), retrying ({} left)",
                reason,
                phase as u8,
                escape_log(batch),
                self.init_retries
            );
            self.phase = Phase::Init(retry_phase);
            self.step.start(now, INIT_RETRY_DELAY);
        } else {
            warn!(
                "Unable to initialize GSM module: {} at phase {}",
                reason, phase as u8
            );
            self.phase = Phase::Idle;
        }
    }
}

/// Command echo followed by `OK`.
fn confirmed(batch: &str, command: &str) -> bool {
    batch.contains(command) && batch.contains(OK)
}
