//! Process-wide counters for the protocol engine.
//! Cheap relaxed atomics; read them with [`snapshot`].
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

static MESH_FRAMES_RX: AtomicU64 = AtomicU64::new(0);
static MESH_FRAMES_TX: AtomicU64 = AtomicU64::new(0);
static MESH_MALFORMED: AtomicU64 = AtomicU64::new(0);
static MESH_ACKED: AtomicU64 = AtomicU64::new(0);
static MESH_RETRY_RESENT: AtomicU64 = AtomicU64::new(0);
static MESH_RETRY_DROPPED: AtomicU64 = AtomicU64::new(0);
static MESH_RECONNECTS: AtomicU64 = AtomicU64::new(0);
static SMS_SENT: AtomicU64 = AtomicU64::new(0);
static SMS_FAILED: AtomicU64 = AtomicU64::new(0);
static SMS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static MODEM_RECONNECTS: AtomicU64 = AtomicU64::new(0);

pub fn inc_mesh_frames_rx() {
    MESH_FRAMES_RX.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_mesh_frames_tx() {
    MESH_FRAMES_TX.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_mesh_malformed() {
    MESH_MALFORMED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_mesh_acked() {
    MESH_ACKED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_mesh_retry_resent() {
    MESH_RETRY_RESENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_mesh_retry_dropped() {
    MESH_RETRY_DROPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_mesh_reconnects() {
    MESH_RECONNECTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sms_sent() {
    SMS_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sms_failed() {
    SMS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sms_received() {
    SMS_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_modem_reconnects() {
    MODEM_RECONNECTS.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub mesh_frames_rx: u64,
    pub mesh_frames_tx: u64,
    pub mesh_malformed: u64,
    pub mesh_acked: u64,
    pub mesh_retry_resent: u64,
    pub mesh_retry_dropped: u64,
    pub mesh_reconnects: u64,
    pub sms_sent: u64,
    pub sms_failed: u64,
    pub sms_received: u64,
    pub modem_reconnects: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        mesh_frames_rx: MESH_FRAMES_RX.load(Ordering::Relaxed),
        mesh_frames_tx: MESH_FRAMES_TX.load(Ordering::Relaxed),
        mesh_malformed: MESH_MALFORMED.load(Ordering::Relaxed),
        mesh_acked: MESH_ACKED.load(Ordering::Relaxed),
        mesh_retry_resent: MESH_RETRY_RESENT.load(Ordering::Relaxed),
        mesh_retry_dropped: MESH_RETRY_DROPPED.load(Ordering::Relaxed),
        mesh_reconnects: MESH_RECONNECTS.load(Ordering::Relaxed),
        sms_sent: SMS_SENT.load(Ordering::Relaxed),
        sms_failed: SMS_FAILED.load(Ordering::Relaxed),
        sms_received: SMS_RECEIVED.load(Ordering::Relaxed),
        modem_reconnects: MODEM_RECONNECTS.load(Ordering::Relaxed),
    }
}
