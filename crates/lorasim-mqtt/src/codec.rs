//! ---
//! sim_section: "03-mqtt-bridge"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Topic naming and message (de)serialisation."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
use base64::{engine::general_purpose::STANDARD, Engine as _};
use lorasim_common::{Result, SimulatorError};
use lorasim_device::{DownlinkCommand, UplinkEvent};
use serde_json::{Map, Value};

use crate::wire::{fields, DownlinkBody, UplinkBody};

const DEVICES_LEVEL: &str = "devices";
const UPLINK_LEVEL: &str = "up";
const DOWNLINK_LEVEL: &str = "down";
const MAX_F_PORT: u64 = 223;

/// Encoded uplink waiting to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub device_id: String,
    pub seq: u32,
}

/// Topic layout of one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    application_id: String,
}

impl Topics {
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
        }
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn uplink(&self, device_id: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.application_id, DEVICES_LEVEL, device_id, UPLINK_LEVEL
        )
    }

    pub fn downlink(&self, device_id: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.application_id, DEVICES_LEVEL, device_id, DOWNLINK_LEVEL
        )
    }

    /// Subscription filter matching the downlink topic of every device.
    pub fn downlink_filter(&self) -> String {
        format!(
            "{}/{}/+/{}",
            self.application_id, DEVICES_LEVEL, DOWNLINK_LEVEL
        )
    }

    /// Extract the device id from `{app}/devices/{device}/{direction}`.
    fn device_from<'a>(&self, topic: &'a str, direction: &str) -> Result<&'a str> {
        let levels: Vec<&str> = topic.split('/').collect();
        match levels.as_slice() {
            [app, devices, device, dir]
                if *app == self.application_id
                    && *devices == DEVICES_LEVEL
                    && *dir == direction
                    && !device.is_empty()
                    && !device.contains(['+', '#']) =>
            {
                Ok(*device)
            }
            _ => Err(SimulatorError::malformed(
                topic,
                format!(
                    "topic does not match {}/{}/{{deviceId}}/{}",
                    self.application_id, DEVICES_LEVEL, direction
                ),
            )),
        }
    }

    /// Serialize an uplink for publishing.
    pub fn encode_uplink(&self, event: &UplinkEvent) -> Result<OutboundMessage> {
        let topic = self.uplink(&event.device_id);
        let body = UplinkBody {
            device_id: event.device_id.clone(),
            application_id: event.application_id.clone(),
            seq: event.seq,
            timestamp: event.timestamp,
            data: STANDARD.encode(&event.payload),
            rssi: event.rssi,
            snr: event.snr,
            f_port: event.f_port,
            ack: event.ack.clone(),
            object: event.object,
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|err| SimulatorError::malformed(&topic, err.to_string()))?;
        Ok(OutboundMessage {
            topic,
            payload,
            device_id: event.device_id.clone(),
            seq: event.seq,
        })
    }

    /// Parse a published uplink back into an event.
    pub fn decode_uplink(&self, topic: &str, body: &[u8]) -> Result<UplinkEvent> {
        let device_id = self.device_from(topic, UPLINK_LEVEL)?;
        let body: UplinkBody = serde_json::from_slice(body)
            .map_err(|err| SimulatorError::malformed(topic, format!("invalid uplink body: {}", err)))?;
        if body.device_id != device_id {
            return Err(SimulatorError::malformed(
                topic,
                format!("body deviceId '{}' contradicts topic", body.device_id),
            ));
        }
        let payload = STANDARD
            .decode(&body.data)
            .map_err(|err| SimulatorError::malformed(topic, format!("data is not base64: {}", err)))?;
        Ok(UplinkEvent {
            application_id: body.application_id,
            device_id: body.device_id,
            seq: body.seq,
            timestamp: body.timestamp,
            payload,
            rssi: body.rssi,
            snr: body.snr,
            f_port: body.f_port,
            ack: body.ack,
            object: body.object,
        })
    }

    /// Serialize a downlink the way a client application would publish it.
    pub fn encode_downlink(&self, command: &DownlinkCommand) -> Result<(String, Vec<u8>)> {
        let topic = self.downlink(&command.device_id);
        let body = DownlinkBody {
            device_id: Some(command.device_id.clone()),
            confirmed: command.confirmed,
            data: STANDARD.encode(&command.payload),
            correlation_id: command.correlation_id.clone(),
            f_port: command.f_port,
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|err| SimulatorError::malformed(&topic, err.to_string()))?;
        Ok((topic, payload))
    }

    /// Validate and decode an inbound downlink. Unknown fields are ignored.
    pub fn decode_downlink(&self, topic: &str, body: &[u8]) -> Result<DownlinkCommand> {
        let device_id = self.device_from(topic, DOWNLINK_LEVEL)?;
        let value: Value = serde_json::from_slice(body)
            .map_err(|err| SimulatorError::malformed(topic, format!("invalid JSON: {}", err)))?;
        let object = value
            .as_object()
            .ok_or_else(|| SimulatorError::malformed(topic, "body must be a JSON object"))?;
        let extract = Extractor { topic, object };

        let confirmed = extract.required(fields::CONFIRMED, Value::as_bool, "a boolean")?;
        let data = extract.required(fields::DATA, Value::as_str, "a string")?;
        let correlation_id = extract.required(fields::CORRELATION_ID, Value::as_str, "a string")?;
        if correlation_id.is_empty() {
            return Err(SimulatorError::malformed(topic, "correlationId must not be empty"));
        }
        let f_port = extract
            .optional(fields::F_PORT, Value::as_u64, "an integer")?
            .map(|port| {
                if (1..=MAX_F_PORT).contains(&port) {
                    Ok(port as u8)
                } else {
                    Err(SimulatorError::malformed(
                        topic,
                        format!("fPort {} outside 1..={}", port, MAX_F_PORT),
                    ))
                }
            })
            .transpose()?;
        if let Some(body_device) = extract.optional(fields::DEVICE_ID, Value::as_str, "a string")? {
            if body_device != device_id {
                return Err(SimulatorError::malformed(
                    topic,
                    format!("body deviceId '{}' contradicts topic", body_device),
                ));
            }
        }
        let payload = STANDARD
            .decode(data)
            .map_err(|err| SimulatorError::malformed(topic, format!("data is not base64: {}", err)))?;

        Ok(DownlinkCommand {
            device_id: device_id.to_owned(),
            confirmed,
            payload,
            correlation_id: correlation_id.to_owned(),
            f_port,
        })
    }
}

struct Extractor<'a> {
    topic: &'a str,
    object: &'a Map<String, Value>,
}

impl<'a> Extractor<'a> {
    fn required<T>(
        &self,
        field: &str,
        read: impl Fn(&'a Value) -> Option<T>,
        expected: &str,
    ) -> Result<T> {
        self.optional(field, read, expected)?.ok_or_else(|| {
            SimulatorError::malformed(self.topic, format!("missing required field '{}'", field))
        })
    }

    fn optional<T>(
        &self,
        field: &str,
        read: impl Fn(&'a Value) -> Option<T>,
        expected: &str,
    ) -> Result<Option<T>> {
        match self.object.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => read(value).map(Some).ok_or_else(|| {
                SimulatorError::malformed(
                    self.topic,
                    format!("field '{}' must be {}", field, expected),
                )
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use lorasim_common::ErrorKind;
    use lorasim_device::SensorReading;

    fn topics() -> Topics {
        Topics::new("app")
    }

    #[test]
    fn topic_layout() {
        let topics = topics();
        assert_eq!(topics.uplink("dev"), "app/devices/dev/up");
        assert_eq!(topics.downlink("dev"), "app/devices/dev/down");
        assert_eq!(topics.downlink_filter(), "app/devices/+/down");
    }

    #[test]
    fn uplink_body_uses_camel_case_and_base64() {
        let event = UplinkEvent {
            application_id: "app".into(),
            device_id: "dev".into(),
            seq: 7,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            payload: vec![1, 2, 3],
            rssi: -80,
            snr: 5.5,
            f_port: 10,
            ack: None,
            object: None,
        };
        let message = topics().encode_uplink(&event).unwrap();
        assert_eq!(message.topic, "app/devices/dev/up");
        let json: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(json["deviceId"], "dev");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["data"], "AQID");
        assert_eq!(json["fPort"], 10);
        assert_eq!(json["timestamp"], "2024-01-02T03:04:05Z");
        assert!(json.get("ack").is_none());
        assert!(json.get("object").is_none());
        assert_eq!(topics().decode_uplink(&message.topic, &message.payload).unwrap(), event);

        let reading = UplinkEvent {
            payload: vec![0x10, 0, 0, 0, 87, 0x20, 0x41, 0xb4, 0, 0],
            object: Some(SensorReading {
                battery: 87,
                temperature: 22.5,
            }),
            ack: Some("c-1".into()),
            ..event
        };
        let message = topics().encode_uplink(&reading).unwrap();
        let json: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(json["object"]["battery"], 87);
        assert_eq!(json["object"]["temperature"], 22.5);
        assert_eq!(json["ack"], "c-1");
        assert_eq!(topics().decode_uplink(&message.topic, &message.payload).unwrap(), reading);
    }

    #[test]
    fn decodes_minimal_downlink_ignoring_unknown_fields() {
        let command = topics()
            .decode_downlink(
                "app/devices/dev/down",
                br#"{"confirmed":true,"data":"AQID","correlationId":"c-1","extra":[1]}"#,
            )
            .unwrap();
        assert_eq!(command.device_id, "dev");
        assert!(command.confirmed);
        assert_eq!(command.payload, vec![1, 2, 3]);
        assert_eq!(command.correlation_id, "c-1");
        assert_eq!(command.f_port, None);
    }

    #[test]
    fn malformed_downlinks_are_rejected() {
        let cases: &[(&str, &[u8])] = &[
            ("app/devices/dev/up", br#"{"confirmed":true,"data":"","correlationId":"c"}"#),
            ("other/devices/dev/down", br#"{"confirmed":true,"data":"","correlationId":"c"}"#),
            ("app/devices/dev/extra/down", br#"{"confirmed":true,"data":"","correlationId":"c"}"#),
            ("app/devices/dev/down", b"not json"),
            ("app/devices/dev/down", b"[]"),
            ("app/devices/dev/down", br#"{"data":"","correlationId":"c"}"#),
            ("app/devices/dev/down", br#"{"confirmed":"yes","data":"","correlationId":"c"}"#),
            ("app/devices/dev/down", br#"{"confirmed":true,"correlationId":"c"}"#),
            ("app/devices/dev/down", br#"{"confirmed":true,"data":"%%%","correlationId":"c"}"#),
            ("app/devices/dev/down", br#"{"confirmed":true,"data":""}"#),
            ("app/devices/dev/down", br#"{"confirmed":true,"data":"","correlationId":""}"#),
            ("app/devices/dev/down", br#"{"confirmed":true,"data":"","correlationId":"c","fPort":0}"#),
            (
                "app/devices/dev/down",
                br#"{"confirmed":true,"data":"","correlationId":"c","deviceId":"other"}"#,
            ),
        ];
        for (topic, body) in cases {
            let err = topics().decode_downlink(topic, body).unwrap_err();
            assert_eq!(
                err.kind(),
                ErrorKind::MalformedMessage,
                "{} {:?}",
                topic,
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn missing_field_reason_names_the_field() {
        let err = topics()
            .decode_downlink("app/devices/dev/down", br#"{"confirmed":false,"data":"AA=="}"#)
            .unwrap_err();
        assert!(err.to_string().contains("correlationId"));
    }
}
