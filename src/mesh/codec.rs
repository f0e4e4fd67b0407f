//! MySensors serial frame codec.
//!
//! A frame is one line of six `;`-separated fields:
//!
//! ```text
//! <node-id>;<child-sensor-id>;<command>;<ack>;<type>;<payload>
//! ```
//!
//! The payload is not escaped. A `;` inside it splits the frame and everything
//! after it is lost on decode; the protocol has no way around that.
use serde::Serialize;
use thiserror::Error;

use crate::events::MeshEventKind;

pub const DELIMITER: char = ';';

/// Child sensor id addressing the node itself rather than one of its sensors.
pub const NODE_SENSOR_ID: u8 = 255;

/// Minimum number of fields for a line to be a frame (payload may be absent).
pub const MIN_FIELDS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Command {
    Presentation,
    Set,
    Req,
    Internal,
    Stream,
    Other(u8),
}

impl From<u8> for Command {
    fn from(v: u8) -> Self {
        match v {
            0 => Command::Presentation,
            1 => Command::Set,
            2 => Command::Req,
            3 => Command::Internal,
            4 => Command::Stream,
            n => Command::Other(n),
        }
    }
}

impl From<Command> for u8 {
    fn from(c: Command) -> u8 {
        match c {
            Command::Presentation => 0,
            Command::Set => 1,
            Command::Req => 2,
            Command::Internal => 3,
            Command::Stream => 4,
            Command::Other(n) => n,
        }
    }
}

/// Sub-types carried in the type field of `Internal` frames.
pub mod internal {
    pub const BATTERY_LEVEL: u8 = 0;
    pub const TIME: u8 = 1;
    pub const VERSION: u8 = 2;
    pub const ID_REQUEST: u8 = 3;
    pub const ID_RESPONSE: u8 = 4;
    pub const INCLUSION_MODE: u8 = 5;
    pub const CONFIG: u8 = 6;
    pub const LOG_MESSAGE: u8 = 9;
    pub const CHILDREN: u8 = 10;
    pub const SKETCH_NAME: u8 = 11;
    pub const SKETCH_VERSION: u8 = 12;
    pub const REBOOT: u8 = 13;
    pub const GATEWAY_READY: u8 = 14;
    pub const PING: u8 = 24;
    pub const PONG: u8 = 25;
}

/// Config reply payload: metric units.
pub const CONFIG_METRIC: &str = "M";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed frame: {fields} field(s), need at least {MIN_FIELDS}")]
    MalformedFrame { fields: usize },
    #[error("invalid {name} field: {value:?}")]
    InvalidField { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeshMessage {
    /// Destination on send, sender on receive.
    pub destination: u8,
    pub sensor: u8,
    pub command: Command,
    pub ack: bool,
    #[serde(rename = "type")]
    pub sub_type: u8,
    pub payload: String,
}

impl MeshMessage {
    pub fn new(
        destination: u8,
        sensor: u8,
        command: Command,
        ack: bool,
        sub_type: u8,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            destination,
            sensor,
            command,
            ack,
            sub_type,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> String {
        encode(
            self.destination,
            self.sensor,
            self.command,
            self.ack,
            self.sub_type,
            &self.payload,
        )
    }

    pub fn is_internal(&self, sub_type: u8) -> bool {
        self.command == Command::Internal && self.sub_type == sub_type
    }
}

pub fn encode(
    destination: u8,
    sensor: u8,
    command: Command,
    ack: bool,
    sub_type: u8,
    payload: &str,
) -> String {
    format!(
        "{destination}{d}{sensor}{d}{}{d}{}{d}{sub_type}{d}{payload}",
        u8::from(command),
        u8::from(ack),
        d = DELIMITER
    )
}

pub fn decode(line: &str) -> Result<MeshMessage, CodecError> {
    let fields: Vec<&str> = line.split(DELIMITER).collect();
    if fields.len() < MIN_FIELDS {
        return Err(CodecError::MalformedFrame {
            fields: fields.len(),
        });
    }
    let payload = fields.get(5).map(|p| p.trim()).unwrap_or("");
    Ok(MeshMessage {
        destination: field(fields[0], "node-id")?,
        sensor: field(fields[1], "sensor")?,
        command: Command::from(field::<u8>(fields[2], "command")?),
        ack: field::<u8>(fields[3], "ack")? == 1,
        sub_type: field(fields[4], "type")?,
        payload: payload.to_string(),
    })
}

fn field<T: std::str::FromStr>(raw: &str, name: &'static str) -> Result<T, CodecError> {
    raw.trim().parse().map_err(|_| CodecError::InvalidField {
        name,
        value: raw.to_string(),
    })
}

/// Whether a raw outbound frame asks the remote node for an acknowledgment.
pub fn ack_requested(raw: &str) -> bool {
    raw.split(DELIMITER)
        .nth(3)
        .and_then(|a| a.trim().parse::<u8>().ok())
        == Some(1)
}

/// Gateway-side reply sent straight back to the node without raising an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Reply {
    /// Current time in epoch seconds.
    Time,
    /// Controller configuration (unit system).
    Config,
}

/// What the engine does with a decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Route {
    Emit(Vec<MeshEventKind>),
    Reply(Reply),
    Ignore,
}

pub fn route(msg: &MeshMessage) -> Route {
    use MeshEventKind::*;
    match msg.command {
        Command::Presentation if msg.sensor == NODE_SENSOR_ID => Route::Ignore,
        Command::Presentation => Route::Emit(vec![SaveSensor, SaveLibVersion]),
        Command::Set => Route::Emit(vec![SaveValue]),
        Command::Req => Route::Emit(vec![GetValue]),
        Command::Internal => match msg.sub_type {
            internal::BATTERY_LEVEL => Route::Emit(vec![SaveBatteryLevel]),
            internal::TIME => Route::Reply(Reply::Time),
            internal::VERSION => Route::Emit(vec![SaveLibVersion]),
            internal::ID_REQUEST => Route::Emit(vec![GetNextSensorId]),
            internal::CONFIG => Route::Reply(Reply::Config),
            internal::SKETCH_NAME => Route::Emit(vec![SaveSketchName]),
            internal::SKETCH_VERSION => Route::Emit(vec![SaveSketchVersion]),
            internal::PONG => Route::Emit(vec![SaveValue]),
            _ => Route::Ignore,
        },
        Command::Stream | Command::Other(_) => Route::Ignore,
    }
}

/// Build the reply frame for `msg` (which must have routed to `reply`).
pub fn reply_frame(msg: &MeshMessage, reply: Reply, epoch_secs: i64) -> String {
    match reply {
        Reply::Time => encode(
            msg.destination,
            msg.sensor,
            Command::Internal,
            false,
            internal::TIME,
            &epoch_secs.to_string(),
        ),
        Reply::Config => encode(
            msg.destination,
            NODE_SENSOR_ID,
            Command::Internal,
            false,
            internal::CONFIG,
            CONFIG_METRIC,
        ),
    }
}
