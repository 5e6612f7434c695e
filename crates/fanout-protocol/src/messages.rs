use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::{IceCandidate, ProtocolError, Role, SessionDescription};

/// Channel name used by the process manager heartbeat
pub const HEARTBEAT_CHANNEL: &str = "process-mgr";

/// A decoded inbound signaling tuple
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSignal {
    /// `[fromID, "process-mgr", "ping"]`
    Ping { from: String },
    /// `[endpointID, streamID, role, sessionID, eventName, payload...]`
    Event(SignalEnvelope),
}

/// Addressing shared by every session-level event
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    pub endpoint_id: String,
    pub stream_id: String,
    pub role: Role,
    pub session_id: String,
    pub event: SignalEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Ok,
    Sdp(SessionDescription),
    Candidate(IceCandidate),
    Close,
    Reconnect,
    /// Error reported by the remote side, payload kept verbatim
    Error(Vec<Value>),
}

impl SignalEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SignalEvent::Ok => "ok",
            SignalEvent::Sdp(_) => "sdp",
            SignalEvent::Candidate(_) => "candidate",
            SignalEvent::Close => "close",
            SignalEvent::Reconnect => "reconnect",
            SignalEvent::Error(_) => "error",
        }
    }
}

impl InboundSignal {
    /// Parse a raw signaling frame
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let values: Vec<Value> = serde_json::from_str(text)
            .map_err(|e| ProtocolError::InvalidEventPayload(format!("not a JSON array: {}", e)))?;
        Self::decode(&values)
    }

    /// Decode an already parsed tuple
    pub fn decode(values: &[Value]) -> Result<Self, ProtocolError> {
        if values.len() == 3 {
            let from = string_at(values, 0, "fromID")?;
            let channel = string_at(values, 1, "channel")?;
            let verb = string_at(values, 2, "verb")?;
            if channel == HEARTBEAT_CHANNEL && verb == "ping" {
                return Ok(InboundSignal::Ping {
                    from: from.to_string(),
                });
            }
            return Err(ProtocolError::InvalidEventPayload(format!(
                "malformed heartbeat: {:?}",
                values
            )));
        }

        if values.len() < 5 {
            return Err(ProtocolError::InvalidEventPayload(format!(
                "expected at least 5 fields, got {}",
                values.len()
            )));
        }

        let endpoint_id = string_at(values, 0, "endpointID")?.to_string();
        let stream_id = string_at(values, 1, "streamID")?.to_string();
        let role: Role = string_at(values, 2, "role")?.parse()?;
        let session_id = string_at(values, 3, "sessionID")?.to_string();
        let event_name = string_at(values, 4, "eventName")?;
        let payload = values.get(5);

        let event = match event_name {
            "ok" => SignalEvent::Ok,
            "sdp" => SignalEvent::Sdp(decode_payload(payload, "sdp")?),
            "candidate" => SignalEvent::Candidate(decode_payload(payload, "candidate")?),
            "close" => SignalEvent::Close,
            "reconnect" => SignalEvent::Reconnect,
            "error" => SignalEvent::Error(values[5..].to_vec()),
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };

        Ok(InboundSignal::Event(SignalEnvelope {
            endpoint_id,
            stream_id,
            role,
            session_id,
            event,
        }))
    }
}

impl SignalEnvelope {
    /// Build a reply addressed back to the same session
    pub fn reply(&self, event: OutboundEvent) -> OutboundSignal {
        OutboundSignal::Event {
            endpoint_id: self.endpoint_id.clone(),
            stream_id: self.stream_id.clone(),
            role: self.role,
            session_id: self.session_id.clone(),
            event,
        }
    }
}

fn string_at<'a>(values: &'a [Value], index: usize, field: &str) -> Result<&'a str, ProtocolError> {
    values
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::InvalidEventPayload(format!("{} is not a string", field)))
}

/// Payloads arrive either as objects or as JSON text
fn decode_payload<T: DeserializeOwned>(payload: Option<&Value>, event: &str) -> Result<T, ProtocolError> {
    let value = payload.ok_or_else(|| {
        ProtocolError::InvalidEventPayload(format!("{} event without payload", event))
    })?;

    let parsed = match value {
        Value::String(text) => serde_json::from_str(text),
        other => serde_json::from_value(other.clone()),
    };

    parsed.map_err(|e| ProtocolError::InvalidEventPayload(format!("bad {} payload: {}", event, e)))
}

/// Events the relay sends back to an endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    Ok,
    Sdp(SessionDescription),
    Candidate(IceCandidate),
    Error(String),
    ReconnectOk,
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::Ok => "ok",
            OutboundEvent::Sdp(_) => "sdp",
            OutboundEvent::Candidate(_) => "candidate",
            OutboundEvent::Error(_) => "error",
            OutboundEvent::ReconnectOk => "reconnect-ok",
        }
    }

    fn payload(&self) -> Option<Value> {
        match self {
            OutboundEvent::Sdp(desc) => Some(json!(desc)),
            OutboundEvent::Candidate(candidate) => Some(json!(candidate)),
            OutboundEvent::Error(reason) => Some(json!(reason)),
            OutboundEvent::Ok | OutboundEvent::ReconnectOk => None,
        }
    }
}

/// A message addressed to a signaling endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundSignal {
    Pong {
        to: String,
    },
    Event {
        endpoint_id: String,
        stream_id: String,
        role: Role,
        session_id: String,
        event: OutboundEvent,
    },
}

impl OutboundSignal {
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundSignal::Pong { .. } => "pong",
            OutboundSignal::Event { event, .. } => event.name(),
        }
    }

    /// Encode into the positional wire form
    pub fn to_values(&self) -> Vec<Value> {
        match self {
            OutboundSignal::Pong { to } => {
                vec![json!(to), json!(HEARTBEAT_CHANNEL), json!("pong")]
            }
            OutboundSignal::Event {
                endpoint_id,
                stream_id,
                role,
                session_id,
                event,
            } => {
                let mut values = vec![
                    json!(endpoint_id),
                    json!(stream_id),
                    json!(role.as_str()),
                    json!(session_id),
                    json!(event.name()),
                ];
                if let Some(payload) = event.payload() {
                    values.push(payload);
                }
                values
            }
        }
    }

    pub fn to_json(&self) -> String {
        Value::Array(self.to_values()).to_string()
    }
}
