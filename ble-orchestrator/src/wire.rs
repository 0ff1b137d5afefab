//! The line-delimited JSON frames on the wire. Decoding a frame into
//! a typed [`IncomingFrame`] — or rejecting it as `InvalidRequest` — is
//! the IPC server's entire job; nothing past [`server`](crate::server)
//! ever sees an untyped [`serde_json::Value`].

use ble_orchestrator_domain::request::{CallbackId, CharacteristicRef, Priority, RequestKind};
use ble_orchestrator_domain::{MacAddress, OrchestratorError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One decoded request line, still carrying the fields the `Executor`
/// doesn't need (priority/timeout live here, not on `RequestKind`).
#[derive(Debug, Clone)]
pub struct IncomingFrame {
    pub request_id: String,
    pub priority: Priority,
    pub timeout: Duration,
    pub body: FrameBody,
}

#[derive(Debug, Clone)]
pub enum FrameBody {
    Dispatch(RequestKind),
    ServiceStatus,
}

/// Raw wire shape, one variant per `command` value. Optional fields are
/// genuinely optional on the wire; required ones missing produce a serde
/// error that the caller maps to `InvalidRequest` rather than panicking.
#[derive(Debug, Deserialize)]
#[serde(tag = "command")]
enum RawFrame {
    #[serde(rename = "scan_command")]
    Scan {
        mac_address: String,
        request_id: String,
    },
    #[serde(rename = "read_command")]
    Read {
        mac_address: String,
        service_uuid: String,
        characteristic_uuid: String,
        request_id: String,
        priority: Option<RawPriority>,
        timeout: Option<f64>,
    },
    #[serde(rename = "send_command")]
    Send {
        mac_address: String,
        service_uuid: String,
        characteristic_uuid: String,
        data: PayloadBytes,
        request_id: String,
        response_required: Option<bool>,
        priority: Option<RawPriority>,
        timeout: Option<f64>,
    },
    #[serde(rename = "subscribe_notifications")]
    Subscribe {
        mac_address: String,
        service_uuid: String,
        characteristic_uuid: String,
        request_id: String,
        callback_id: Option<String>,
        notification_timeout: Option<f64>,
    },
    #[serde(rename = "unsubscribe_notifications")]
    Unsubscribe {
        callback_id: String,
        request_id: String,
    },
    #[serde(rename = "get_service_status")]
    Status { request_id: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum RawPriority {
    High,
    Normal,
    Low,
}

impl From<RawPriority> for Priority {
    fn from(p: RawPriority) -> Self {
        match p {
            RawPriority::High => Priority::High,
            RawPriority::Normal => Priority::Normal,
            RawPriority::Low => Priority::Low,
        }
    }
}

/// `data` accepts a hex string, an array of 0-255 integers, or a base64
/// string — tried in that order when the value is textual, since a
/// valid base64 string is rarely also valid hex but the reverse is common
/// (an all-hex-digit string is valid base64 too).
#[derive(Debug, Clone)]
pub struct PayloadBytes(pub Vec<u8>);

impl<'de> Deserialize<'de> for PayloadBytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Ints(Vec<i64>),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => decode_text_payload(&s)
                .map(PayloadBytes)
                .ok_or_else(|| serde::de::Error::custom(format!("could not decode {s:?} as hex or base64"))),
            Raw::Ints(nums) => {
                let mut bytes = Vec::with_capacity(nums.len());
                for n in nums {
                    let byte = u8::try_from(n)
                        .map_err(|_| serde::de::Error::custom(format!("byte {n} out of range 0-255")))?;
                    bytes.push(byte);
                }
                Ok(PayloadBytes(bytes))
            }
        }
    }
}

fn decode_text_payload(s: &str) -> Option<Vec<u8>> {
    if let Ok(bytes) = hex::decode(s) {
        return Some(bytes);
    }
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s).ok()
}

/// Parses one line of input into a typed frame, or an `InvalidRequest`
/// carrying whatever `request_id` could be salvaged for the error
/// response (malformed frames still echo `request_id` when present).
pub fn decode_line(line: &str) -> Result<IncomingFrame, (Option<String>, OrchestratorError)> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|_| (None, OrchestratorError::InvalidRequest))?;
    let request_id_hint = value.get("request_id").and_then(|v| v.as_str()).map(str::to_string);

    let raw: RawFrame = serde_json::from_value(value)
        .map_err(|_| (request_id_hint.clone(), OrchestratorError::InvalidRequest))?;

    build_frame(raw).map_err(|e| (request_id_hint, e))
}

fn parse_mac(s: &str) -> Result<MacAddress, OrchestratorError> {
    s.parse().map_err(|_| OrchestratorError::InvalidRequest)
}

fn parse_uuid(s: &str) -> Result<uuid::Uuid, OrchestratorError> {
    s.parse().map_err(|_| OrchestratorError::InvalidRequest)
}

fn build_frame(raw: RawFrame) -> Result<IncomingFrame, OrchestratorError> {
    Ok(match raw {
        RawFrame::Scan { mac_address, request_id } => IncomingFrame {
            request_id,
            priority: Priority::Normal,
            timeout: ble_orchestrator_domain::request::DEFAULT_REQUEST_TIMEOUT,
            body: FrameBody::Dispatch(RequestKind::CacheLookup { mac: parse_mac(&mac_address)? }),
        },
        RawFrame::Read { mac_address, service_uuid, characteristic_uuid, request_id, priority, timeout } => {
            IncomingFrame {
                request_id,
                priority: priority.map(Priority::from).unwrap_or_default(),
                timeout: timeout_or_default(timeout),
                body: FrameBody::Dispatch(RequestKind::Read {
                    mac: parse_mac(&mac_address)?,
                    characteristic: CharacteristicRef {
                        service_uuid: parse_uuid(&service_uuid)?,
                        char_uuid: parse_uuid(&characteristic_uuid)?,
                    },
                }),
            }
        }
        RawFrame::Send {
            mac_address,
            service_uuid,
            characteristic_uuid,
            data,
            request_id,
            response_required,
            priority,
            timeout,
        } => IncomingFrame {
            request_id,
            priority: priority.map(Priority::from).unwrap_or_default(),
            timeout: timeout_or_default(timeout),
            body: FrameBody::Dispatch(RequestKind::Write {
                mac: parse_mac(&mac_address)?,
                characteristic: CharacteristicRef {
                    service_uuid: parse_uuid(&service_uuid)?,
                    char_uuid: parse_uuid(&characteristic_uuid)?,
                },
                payload: data.0,
                wants_response: response_required.unwrap_or(true),
            }),
        },
        RawFrame::Subscribe {
            mac_address,
            service_uuid,
            characteristic_uuid,
            request_id,
            callback_id,
            notification_timeout,
        } => IncomingFrame {
            priority: Priority::Normal,
            timeout: ble_orchestrator_domain::request::DEFAULT_REQUEST_TIMEOUT,
            body: FrameBody::Dispatch(RequestKind::Subscribe {
                mac: parse_mac(&mac_address)?,
                characteristic: CharacteristicRef {
                    service_uuid: parse_uuid(&service_uuid)?,
                    char_uuid: parse_uuid(&characteristic_uuid)?,
                },
                callback_id: CallbackId(callback_id.unwrap_or_else(|| request_id.clone())),
                notification_timeout: notification_timeout
                    .filter(|secs| *secs > 0.0)
                    .map(Duration::from_secs_f64),
            }),
            request_id,
        },
        RawFrame::Unsubscribe { callback_id, request_id } => IncomingFrame {
            request_id,
            priority: Priority::Normal,
            timeout: ble_orchestrator_domain::request::DEFAULT_REQUEST_TIMEOUT,
            body: FrameBody::Dispatch(RequestKind::Unsubscribe { callback_id: CallbackId(callback_id) }),
        },
        RawFrame::Status { request_id } => IncomingFrame {
            request_id,
            priority: Priority::High,
            timeout: ble_orchestrator_domain::request::DEFAULT_REQUEST_TIMEOUT,
            body: FrameBody::ServiceStatus,
        },
    })
}

fn timeout_or_default(secs: Option<f64>) -> Duration {
    match secs {
        Some(secs) if secs > 0.0 => Duration::from_secs_f64(secs),
        _ => ble_orchestrator_domain::request::DEFAULT_REQUEST_TIMEOUT,
    }
}

/// Outgoing frames: responses to a request and pushed notifications.
/// `notification` frames are distinguished on the wire by `type`, never
/// by `status`, so a client can demux both kinds off one socket.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum OutgoingFrame {
    Response {
        status: &'static str,
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Notification {
        #[serde(rename = "type")]
        kind: &'static str,
        callback_id: String,
        mac_address: String,
        characteristic_uuid: String,
        value: Vec<u8>,
        timestamp: f64,
    },
}

impl OutgoingFrame {
    pub fn success(request_id: String, result: serde_json::Value) -> Self {
        OutgoingFrame::Response {
            status: "success",
            request_id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(request_id: String, error: OrchestratorError) -> Self {
        OutgoingFrame::Response {
            status: "error",
            request_id,
            result: None,
            error: Some(error.to_string()),
        }
    }

    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).expect("outgoing frame is always representable as JSON");
        line.push('\n');
        line
    }
}
