//! Events delivered from the protocol engine to the application layer.
//!
//! Each adapter receives its sink at construction and calls it synchronously;
//! collaborators get owned copies of decoded data, never references into adapter
//! state. [`GatewayEvent`] plus the `mpsc` sink implementations let the async
//! runtime forward everything onto a single channel.
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// What a mesh event asks the application to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MeshEventKind {
    SaveSensor,
    SaveLibVersion,
    SaveValue,
    GetValue,
    SaveBatteryLevel,
    GetNextSensorId,
    SaveSketchName,
    SaveSketchVersion,
    /// Gateway link state; payload `"1"` after a handshake, `"0"` when lost.
    SaveGateway,
}

impl MeshEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeshEventKind::SaveSensor => "saveSensor",
            MeshEventKind::SaveLibVersion => "saveLibVersion",
            MeshEventKind::SaveValue => "saveValue",
            MeshEventKind::GetValue => "getValue",
            MeshEventKind::SaveBatteryLevel => "saveBatteryLevel",
            MeshEventKind::GetNextSensorId => "getNextSensorId",
            MeshEventKind::SaveSketchName => "saveSketchName",
            MeshEventKind::SaveSketchVersion => "saveSketchVersion",
            MeshEventKind::SaveGateway => "saveGateway",
        }
    }
}

impl std::fmt::Display for MeshEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshEvent {
    pub kind: MeshEventKind,
    pub sender: u8,
    pub sensor: u8,
    #[serde(rename = "type")]
    pub sub_type: u8,
    pub payload: String,
}

impl MeshEvent {
    pub fn gateway(up: bool) -> Self {
        Self {
            kind: MeshEventKind::SaveGateway,
            sender: 0,
            sensor: 0,
            sub_type: 0,
            payload: if up { "1" } else { "0" }.to_string(),
        }
    }
}

/// SMS notification reported by the modem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundSms {
    pub sender: String,
    /// Modem-formatted date, e.g. `24/05/01,12:34:56` (timezone suffix dropped).
    pub timestamp: String,
    pub body: String,
}

pub trait MeshEventSink: Send {
    fn on_mesh_event(&mut self, event: MeshEvent);
}

pub trait SmsEventSink: Send {
    fn on_sms(&mut self, sms: InboundSms);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum GatewayEvent {
    Mesh(MeshEvent),
    Sms(InboundSms),
}

impl MeshEventSink for mpsc::UnboundedSender<GatewayEvent> {
    fn on_mesh_event(&mut self, event: MeshEvent) {
        if self.send(GatewayEvent::Mesh(event)).is_err() {
            log::debug!("mesh event dropped: receiver closed");
        }
    }
}

impl SmsEventSink for mpsc::UnboundedSender<GatewayEvent> {
    fn on_sms(&mut self, sms: InboundSms) {
        if self.send(GatewayEvent::Sms(sms)).is_err() {
            log::debug!("sms event dropped: receiver closed");
        }
    }
}

/// Sink that keeps everything in memory; handy for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: std::sync::Arc<std::sync::Mutex<Vec<GatewayEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn mesh_events(&self) -> Vec<MeshEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                GatewayEvent::Mesh(m) => Some(m),
                GatewayEvent::Sms(_) => None,
            })
            .collect()
    }

    pub fn sms(&self) -> Vec<InboundSms> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                GatewayEvent::Sms(s) => Some(s),
                GatewayEvent::Mesh(_) => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.events.lock() {
            guard.clear();
        }
    }

    fn push(&self, event: GatewayEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}

impl MeshEventSink for RecordingSink {
    fn on_mesh_event(&mut self, event: MeshEvent) {
        self.push(GatewayEvent::Mesh(event));
    }
}

impl SmsEventSink for RecordingSink {
    fn on_sms(&mut self, sms: InboundSms) {
        self.push(GatewayEvent::Sms(sms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_collaborator_contract() {
        assert_eq!(MeshEventKind::GetNextSensorId.as_str(), "getNextSensorId");
        let json = serde_json::to_string(&MeshEventKind::SaveBatteryLevel).unwrap();
        assert_eq!(json, "\"saveBatteryLevel\"");
    }

    #[test]
    fn gateway_event_json_shape() {
        let ev = GatewayEvent::Mesh(MeshEvent::gateway(true));
        let v: serde_json::Value = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["source"], "mesh");
        assert_eq!(v["kind"], "saveGateway");
        assert_eq!(v["payload"], "1");
        assert_eq!(v["type"], 0);
    }

    #[test]
    fn channel_sink_forwards() {
        let (mut tx, mut rx) = mpsc::unbounded_channel::<GatewayEvent>();
        SmsEventSink::on_sms(
            &mut tx,
            InboundSms {
                sender: "+33600000000".into(),
                timestamp: "24/05/01,12:00:00".into(),
                body: "hello".into(),
            },
        );
        match rx.try_recv().unwrap() {
            GatewayEvent::Sms(s) => assert_eq!(s.body, "hello"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
