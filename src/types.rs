use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

use crate::protocol::Channel;

/// Wall-clock milliseconds since Unix epoch.
pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before Unix epoch")
        .as_secs_f64()
        * 1000.0
}

/// Raw bytes received on one subscribed characteristic.
#[derive(Debug, Clone)]
pub struct NotificationFragment {
    pub channel: Channel,
    pub data: Vec<u8>,
    /// Arrival time in milliseconds since Unix epoch.
    pub received_at: f64,
}

impl NotificationFragment {
    pub fn new(channel: Channel, data: Vec<u8>) -> Self {
        Self {
            channel,
            data,
            received_at: now_ms(),
        }
    }
}

/// One decoded notification.
///
/// Constructed once by a decoder and shared read-only with every consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch<T> {
    pub channel: Channel,
    /// Packet counter from the headset (wraps at 0xFFFF).
    pub counter: u16,
    /// Arrival time of the notification in milliseconds since Unix epoch.
    pub timestamp: f64,
    /// Samples in physical units, oldest first.
    pub samples: Vec<T>,
}

/// A single 3-axis inertial measurement: g for the accelerometer, °/s for the
/// gyroscope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XyzSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Decoded telemetry notification.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryData {
    pub battery_percent: f64,
    /// Bytes after the battery field, not interpreted.
    pub raw_tail: Vec<u8>,
}

/// A complete JSON object reassembled from control-channel fragments.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlResponse {
    pub raw: String,
    /// Every key the headset sent, known or not.
    pub fields: Map<String, Value>,
}

impl ControlResponse {
    fn str_field(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Version responses carry a firmware field.
    pub fn is_version(&self) -> bool {
        self.fields.contains_key("fw")
    }

    /// Status responses carry a battery field.
    pub fn is_status(&self) -> bool {
        self.fields.contains_key("bp")
    }
}

/// Firmware / hardware identity from the first version response of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub hardware_revision: Option<String>,
    pub firmware_version: Option<String>,
    pub bootloader_version: Option<String>,
    pub serial: Option<String>,
    /// Preset family the headset reports (`tp`, e.g. `"consumer"`).
    pub preset_flags: Option<String>,
    pub fields: Map<String, Value>,
}

impl DeviceIdentity {
    pub fn from_response(resp: &ControlResponse) -> Self {
        Self {
            hardware_revision: resp.str_field("hw"),
            firmware_version: resp.str_field("fw"),
            bootloader_version: resp.str_field("bl"),
            serial: resp.str_field("sn"),
            preset_flags: resp.str_field("tp"),
            fields: resp.fields.clone(),
        }
    }
}

/// Latest status snapshot.  Replaced wholesale on every status response.
///
/// `ts` and `ps` are left in `fields` untouched; their meaning is unknown.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub battery_percent: Option<f64>,
    /// Milliseconds since Unix epoch when the response completed.
    pub updated_at: f64,
    pub fields: Map<String, Value>,
}

impl DeviceStatus {
    pub fn from_response(resp: &ControlResponse, updated_at: f64) -> Self {
        Self {
            battery_percent: resp.fields.get("bp").and_then(Value::as_f64),
            updated_at,
            fields: resp.fields.clone(),
        }
    }
}

/// Connection lifecycle of one logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    /// First link is up with only the control channel subscribed.
    PhaseOneConnected,
    /// Halt sent on the first link; waiting out the acknowledgement window.
    PhaseOneHalted,
    /// Second link is up and its channels are being enumerated.
    PhaseTwoConnecting,
    Streaming,
    /// Terminal until the caller explicitly stops and reconnects.
    Faulted,
}

/// Everything the pipeline delivers to consumers.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Eeg(Arc<SampleBatch<f64>>),
    Accelerometer(Arc<SampleBatch<XyzSample>>),
    Gyroscope(Arc<SampleBatch<XyzSample>>),
    Telemetry(Arc<SampleBatch<TelemetryData>>),
    Control(Arc<ControlResponse>),
    /// The session changed state.  Every entry into `Faulted` is reported.
    State(ConnectionState),
    /// No more batches will arrive on this channel until the next connect.
    EndOfStream(Channel),
}

impl StreamEvent {
    /// Source channel, `None` for session-level events.
    pub fn channel(&self) -> Option<Channel> {
        match self {
            StreamEvent::Eeg(b) => Some(b.channel),
            StreamEvent::Accelerometer(b) | StreamEvent::Gyroscope(b) => Some(b.channel),
            StreamEvent::Telemetry(b) => Some(b.channel),
            StreamEvent::Control(_) => Some(Channel::Control),
            StreamEvent::EndOfStream(ch) => Some(*ch),
            StreamEvent::State(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(raw: &str) -> ControlResponse {
        let fields = match serde_json::from_str::<Value>(raw).unwrap() {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        ControlResponse {
            raw: raw.into(),
            fields,
        }
    }

    #[test]
    fn identity_from_version_response() {
        let resp = response(
            r#"{"ap":"headset","sp":"RevE","tp":"consumer","hw":"10.1","bn":27,"fw":"1.2.13","bl":"1.2.3","pv":1,"rc":0}"#,
        );
        assert!(resp.is_version());
        let id = DeviceIdentity::from_response(&resp);
        assert_eq!(id.firmware_version.as_deref(), Some("1.2.13"));
        assert_eq!(id.hardware_revision.as_deref(), Some("10.1"));
        assert_eq!(id.bootloader_version.as_deref(), Some("1.2.3"));
        assert_eq!(id.preset_flags.as_deref(), Some("consumer"));
        assert_eq!(id.serial, None);
        assert_eq!(id.fields["bn"], 27);
    }

    #[test]
    fn status_keeps_opaque_fields() {
        let resp = response(r#"{"hn":"Muse-8173","bp":82,"ts":0,"ps":178,"rc":0}"#);
        assert!(resp.is_status());
        let status = DeviceStatus::from_response(&resp, 1.0);
        assert_eq!(status.battery_percent, Some(82.0));
        assert_eq!(status.fields["ts"], 0);
        assert_eq!(status.fields["ps"], 178);
    }
}
