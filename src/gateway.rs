//! # Async Runtime
//!
//! The adapters are synchronous state machines. This module gives each one a
//! Tokio task that polls it on a short interval and applies commands arriving
//! over a channel, so the adapter itself is only ever touched from that task.
//!
//! ```text
//! GatewayHandle ──mpsc──▶ [mesh task]  ── MeshLink  ──▶ sink
//!               ──mpsc──▶ [modem task] ── ModemLink ──▶ sink
//!               ◀─watch── LinkStatus (connected / ready / backlog)
//! ```
//!
//! Time comes from `tokio::time::Instant`, so tests running on a paused clock
//! drive every protocol timer deterministically.
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant as TokioInstant, MissedTickBehavior};

use crate::config::Config;
use crate::events::GatewayEvent;
use crate::mesh::codec::MeshMessage;
use crate::mesh::{LinkState, MeshLink};
use crate::modem::ModemLink;
use crate::serial::SystemPorts;
use crate::settings::FileSettings;

/// How often each adapter is polled.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn now() -> std::time::Instant {
    TokioInstant::now().into_std()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatus {
    /// A port is open.
    pub connected: bool,
    /// Mesh: handshake done. Modem: init sequence done.
    pub ready: bool,
    /// Mesh: frames awaiting ack. Modem: queued SMS.
    pub backlog: usize,
}

/// A protocol adapter the runtime can drive.
pub trait Adapter: Send + 'static {
    type Command: Send + 'static;
    const NAME: &'static str;

    fn start(&mut self, now: std::time::Instant);
    fn poll(&mut self, now: std::time::Instant);
    fn handle(&mut self, command: Self::Command, now: std::time::Instant);
    fn status(&self) -> LinkStatus;
    fn shutdown(&mut self);
}

#[derive(Debug, Clone)]
pub enum MeshCommand {
    Send { message: MeshMessage, request_ack: bool },
    SendFrame { raw: String, request_ack: bool },
}

#[derive(Debug, Clone)]
pub enum ModemCommand {
    SendSms { recipient: String, body: String },
    AtCommand(String),
}

impl Adapter for MeshLink {
    type Command = MeshCommand;
    const NAME: &'static str = "mesh";

    fn start(&mut self, now: std::time::Instant) {
        MeshLink::start(self, now)
    }

    fn poll(&mut self, now: std::time::Instant) {
        MeshLink::poll(self, now)
    }

    fn handle(&mut self, command: MeshCommand, now: std::time::Instant) {
        match command {
            MeshCommand::Send { message, request_ack } => self.send(&message, request_ack, now),
            MeshCommand::SendFrame { raw, request_ack } => self.send_frame(&raw, request_ack, now),
        }
    }

    fn status(&self) -> LinkStatus {
        LinkStatus {
            connected: self.is_connected(),
            ready: self.state() == LinkState::Connected,
            backlog: self.retry_queue().len(),
        }
    }

    fn shutdown(&mut self) {
        MeshLink::shutdown(self)
    }
}

impl Adapter for ModemLink {
    type Command = ModemCommand;
    const NAME: &'static str = "modem";

    fn start(&mut self, now: std::time::Instant) {
        ModemLink::start(self, now)
    }

    fn poll(&mut self, now: std::time::Instant) {
        ModemLink::poll(self, now)
    }

    fn handle(&mut self, command: ModemCommand, now: std::time::Instant) {
        match command {
            ModemCommand::SendSms { recipient, body } => {
                self.send_sms(&recipient, &body, now);
            }
            ModemCommand::AtCommand(cmd) => {
                self.send_at_command(&cmd, now);
            }
        }
    }

    fn status(&self) -> LinkStatus {
        LinkStatus {
            connected: self.is_connected(),
            ready: self.is_initialized(),
            backlog: self.pending_sms(),
        }
    }

    fn shutdown(&mut self) {
        ModemLink::shutdown(self)
    }
}

enum Control<C> {
    Command(C),
    /// Answered once every command queued before it has been applied.
    Snapshot(oneshot::Sender<LinkStatus>),
    Shutdown,
}

/// Poll `adapter` until a shutdown request arrives or every handle is dropped.
async fn drive<A: Adapter>(
    mut adapter: A,
    mut commands: mpsc::UnboundedReceiver<Control<A::Command>>,
    status: watch::Sender<LinkStatus>,
) {
    info!("Starting {} adapter task", A::NAME);
    adapter.start(now());
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Control::Command(c)) => adapter.handle(c, now()),
                Some(Control::Snapshot(reply)) => {
                    let _ = reply.send(publish(&adapter, &status));
                }
                Some(Control::Shutdown) | None => break,
            },
            _ = interval.tick() => adapter.poll(now()),
        }
        publish(&adapter, &status);
    }
    adapter.shutdown();
    status.send_replace(LinkStatus::default());
    info!("{} adapter task shutting down", A::NAME);
}

fn publish<A: Adapter>(adapter: &A, status: &watch::Sender<LinkStatus>) -> LinkStatus {
    let current = adapter.status();
    status.send_if_modified(|s| {
        if *s != current {
            *s = current;
            true
        } else {
            false
        }
    });
    current
}

struct Driven<C> {
    commands: mpsc::UnboundedSender<Control<C>>,
    status: watch::Receiver<LinkStatus>,
}

impl<C> Clone for Driven<C> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            status: self.status.clone(),
        }
    }
}

impl<C: Send + 'static> Driven<C> {
    fn spawn<A: Adapter<Command = C>>(adapter: A) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(LinkStatus::default());
        let task = tokio::spawn(drive(adapter, rx, status_tx));
        (
            Self {
                commands: tx,
                status: status_rx,
            },
            task,
        )
    }

    fn send(&self, command: C) -> bool {
        self.commands.send(Control::Command(command)).is_ok()
    }

    fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    async fn snapshot(&self) -> Option<LinkStatus> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Control::Snapshot(tx)).is_ok() {
            rx.await.ok()
        } else {
            None
        }
    }
}

/// Cloneable front end to the running adapters.
#[derive(Clone)]
pub struct GatewayHandle {
    mesh: Driven<MeshCommand>,
    modem: Option<Driven<ModemCommand>>,
}

impl GatewayHandle {
    pub fn send_mesh(&self, message: MeshMessage, request_ack: bool) {
        if !self.mesh.send(MeshCommand::Send {
            message,
            request_ack,
        }) {
            warn!("mesh adapter stopped; message dropped");
        }
    }

    pub fn send_mesh_frame(&self, raw: &str, request_ack: bool) {
        if !self.mesh.send(MeshCommand::SendFrame {
            raw: raw.to_string(),
            request_ack,
        }) {
            warn!("mesh adapter stopped; frame dropped");
        }
    }

    pub fn send_sms(&self, recipient: &str, body: &str) {
        match &self.modem {
            Some(modem) => {
                if !modem.send(ModemCommand::SendSms {
                    recipient: recipient.to_string(),
                    body: body.to_string(),
                }) {
                    warn!("modem adapter stopped; SMS to {} dropped", recipient);
                }
            }
            None => warn!("modem disabled; SMS to {} dropped", recipient),
        }
    }

    pub fn send_at_command(&self, command: &str) {
        match &self.modem {
            Some(modem) => {
                if !modem.send(ModemCommand::AtCommand(command.to_string())) {
                    warn!("modem adapter stopped; AT command dropped");
                }
            }
            None => warn!("modem disabled; AT command dropped"),
        }
    }

    pub fn mesh_status(&self) -> LinkStatus {
        self.mesh.status()
    }

    pub fn modem_status(&self) -> LinkStatus {
        self.modem.as_ref().map(|m| m.status()).unwrap_or_default()
    }

    pub fn is_mesh_connected(&self) -> bool {
        self.mesh_status().connected
    }

    pub fn is_modem_connected(&self) -> bool {
        self.modem_status().connected
    }

    pub fn is_modem_initialized(&self) -> bool {
        self.modem_status().ready
    }

    pub fn pending_sms(&self) -> usize {
        self.modem_status().backlog
    }

    /// Modem status once every command sent so far has been applied.
    /// `None` when the modem is disabled or its task has stopped.
    pub async fn modem_snapshot(&self) -> Option<LinkStatus> {
        match &self.modem {
            Some(modem) => modem.snapshot().await,
            None => None,
        }
    }

    /// Wait until the modem status satisfies `pred`, or `timeout` elapses.
    pub async fn wait_for_modem<F>(&self, timeout: Duration, mut pred: F) -> bool
    where
        F: FnMut(&LinkStatus) -> bool,
    {
        let Some(modem) = &self.modem else {
            return false;
        };
        let mut rx = modem.status.clone();
        let wait = async {
            loop {
                if pred(&rx.borrow_and_update()) {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }
}

/// Running gateway: the handle plus the adapter tasks.
pub struct Gateway {
    handle: GatewayHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Spawn the adapter tasks. Must be called from within a Tokio runtime.
    pub fn spawn(mesh: MeshLink, modem: Option<ModemLink>) -> Self {
        let (mesh, mesh_task) = Driven::spawn(mesh);
        let mut tasks = vec![mesh_task];
        let modem = modem.map(|m| {
            let (driven, task) = Driven::spawn(m);
            tasks.push(task);
            driven
        });
        Self {
            handle: GatewayHandle { mesh, modem },
            tasks,
        }
    }

    /// Build both adapters on the host's serial ports and file-backed settings.
    pub fn spawn_system(config: &Config, events: mpsc::UnboundedSender<GatewayEvent>) -> Result<Self> {
        let settings = FileSettings::open(&config.settings.dir, "mysensors")?;
        debug!("mesh settings at {}", settings.path().display());
        let mesh = MeshLink::new(
            config.mesh.clone(),
            Box::new(SystemPorts::new()),
            Box::new(settings),
            Box::new(events.clone()),
        );
        let modem = config.modem.enabled.then(|| {
            ModemLink::new(
                config.modem.clone(),
                Box::new(SystemPorts::new()),
                Box::new(events),
            )
        });
        Ok(Self::spawn(mesh, modem))
    }

    pub fn handle(&self) -> GatewayHandle {
        self.handle.clone()
    }

    /// Stop every adapter, closing its port, and wait for the tasks to end.
    pub async fn shutdown(self) {
        let _ = self.handle.mesh.commands.send(Control::Shutdown);
        if let Some(modem) = &self.handle.modem {
            let _ = modem.commands.send(Control::Shutdown);
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("adapter task ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MeshConfig, ModemConfig};
    use crate::events::{MeshEventKind, RecordingSink};
    use crate::mesh::codec::Command;
    use crate::serial::mock::MockPorts;
    use crate::settings::MemorySettings;

    const USB: &str = "/dev/ttyUSB0";
    const UART: &str = "/dev/ttyAMA0";

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn mesh_frames_flow_through_the_task() {
        let ports = MockPorts::new();
        ports.add(USB);
        let sink = RecordingSink::new();
        let mesh = MeshLink::new(
            MeshConfig::default(),
            Box::new(ports.clone()),
            Box::new(MemorySettings::new()),
            Box::new(sink.clone()),
        );
        let gw = Gateway::spawn(mesh, None);
        let handle = gw.handle();
        settle(20).await;
        assert!(handle.is_mesh_connected());

        ports.inject(USB, b"0;255;3;0;14;Gateway startup complete.\n");
        settle(20).await;
        assert!(handle.mesh_status().ready);

        handle.send_mesh(MeshMessage::new(4, 1, Command::Set, true, 2, "1"), true);
        settle(20).await;
        assert_eq!(ports.take_written(USB), "4;1;1;1;2;1\n");
        assert_eq!(handle.mesh_status().backlog, 1);

        ports.inject(USB, b"4;1;1;1;2;1\n");
        settle(20).await;
        assert_eq!(handle.mesh_status().backlog, 0);
        assert_eq!(sink.mesh_events()[0].kind, MeshEventKind::SaveGateway);

        gw.shutdown().await;
        assert!(!ports.is_open(USB));
    }

    fn idle_mesh() -> MeshLink {
        MeshLink::new(
            MeshConfig::default(),
            Box::new(MockPorts::new()),
            Box::new(MemorySettings::new()),
            Box::new(RecordingSink::new()),
        )
    }

    async fn initialized_modem(ports: &MockPorts) -> Gateway {
        let modem = ModemLink::new(
            ModemConfig::default(),
            Box::new(ports.clone()),
            Box::new(RecordingSink::new()),
        );
        let gw = Gateway::spawn(idle_mesh(), Some(modem));
        settle(4200).await;
        ports.inject(UART, b"AT+CMGF=1\r\r\nOK\r\n");
        settle(200).await;
        ports.inject(UART, b"AT+CNMI=2,2,0,0,0\r\r\nOK\r\n");
        settle(200).await;
        ports.inject(UART, b"AT+CSCLK=2\r\r\nOK\r\n");
        settle(200).await;
        assert!(gw.handle().is_modem_initialized());
        ports.take_written(UART);
        gw
    }

    #[tokio::test(start_paused = true)]
    async fn queued_sms_is_visible_before_it_is_sent() {
        let ports = MockPorts::new();
        ports.add(UART);
        let gw = initialized_modem(&ports).await;
        let handle = gw.handle();

        handle.send_sms("+33612345678", "Door open");
        let status = handle.modem_snapshot().await.expect("modem running");
        assert_eq!(status.backlog, 1);
        assert_eq!(handle.pending_sms(), 1);

        settle(150).await;
        assert_eq!(ports.take_written(UART), "WAKEUP\rAT+CMGF=1\r");
        ports.inject(UART, b"AT+CMGF=1\r\r\nOK\r\n");
        settle(200).await;
        ports.inject(UART, b"AT+CMGS=\"+33612345678\"\r\r\n> ");
        settle(200).await;
        ports.inject(UART, b"Door open\r\n");
        settle(200).await;
        assert_eq!(handle.pending_sms(), 1);
        ports.inject(UART, b"\r\n+CMGS: 42\r\n\r\nOK\r\n");
        assert!(
            handle
                .wait_for_modem(Duration::from_secs(1), |s| s.backlog == 0)
                .await
        );
        gw.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_without_modem_is_none() {
        let gw = Gateway::spawn(idle_mesh(), None);
        assert_eq!(gw.handle().modem_snapshot().await, None);
        gw.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn modem_becomes_ready_after_init() {
        let mesh_ports = MockPorts::new();
        let modem_ports = MockPorts::new();
        modem_ports.add(UART);
        let mesh = MeshLink::new(
            MeshConfig::default(),
            Box::new(mesh_ports),
            Box::new(MemorySettings::new()),
            Box::new(RecordingSink::new()),
        );
        let modem = ModemLink::new(
            ModemConfig::default(),
            Box::new(modem_ports.clone()),
            Box::new(RecordingSink::new()),
        );
        let gw = Gateway::spawn(mesh, Some(modem));
        let handle = gw.handle();
        settle(4200).await;
        assert!(modem_ports.take_written(UART).contains("AT+CMGF=1\r"));
        modem_ports.inject(UART, b"AT+CMGF=1\r\r\nOK\r\n");
        settle(200).await;
        modem_ports.inject(UART, b"AT+CNMI=2,2,0,0,0\r\r\nOK\r\n");
        settle(200).await;
        modem_ports.inject(UART, b"AT+CSCLK=2\r\r\nOK\r\n");
        assert!(
            handle
                .wait_for_modem(Duration::from_secs(1), |s| s.ready)
                .await
        );
        gw.shutdown().await;
    }
}
