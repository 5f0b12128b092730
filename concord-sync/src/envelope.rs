//! JSON envelope exchanged with the relay.
//!
//! Wire format (one WebSocket text frame per message):
//! ```text
//! { "type": "doc:cmd", "ver": 0, "ts": "1700000000000:0", "body": { … } }
//! ```
//!
//! `ts` is only set by the client: Unix milliseconds plus a sequence number
//! that disambiguates envelopes sent within the same millisecond.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope `ver` field.
pub const PROTOCOL_VERSION: u32 = 0;

/// Errors raised while encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Envelope JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown envelope type '{0}'")]
    UnknownType(String),
}

// ───────────────────────────── Bodies ─────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocCmdBody {
    pub room: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceCmdBody {
    pub room: String,
    pub key: String,
    /// JSON text.
    pub value: String,
    /// Unix seconds.
    #[serde(rename = "expAt")]
    pub exp_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocFwdBody {
    pub from: String,
    pub room: String,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vs: Option<String>,
    #[serde(default)]
    pub ack: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceFwdBody {
    pub from: String,
    pub room: String,
    pub key: String,
    pub value: String,
    #[serde(rename = "expAt")]
    pub exp_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveBody {
    pub guest: String,
    pub room: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub request: String,
    pub message: String,
}

// ───────────────────────────── Messages ─────────────────────────────

/// Client → relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `guest:authenticate` with the session token.
    Authenticate(String),
    /// `room:join` with the room id.
    Join(String),
    DocCmd(DocCmdBody),
    PresenceCmd(PresenceCmdBody),
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Authenticated(String),
    Joined(String),
    DocFwd(DocFwdBody),
    PresenceFwd(PresenceFwdBody),
    RemoveGuest(LeaveBody),
    Error(ErrorBody),
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    ver: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<&'a str>,
    body: Value,
}

/// First decoding stage: the body stays untyped until `type` is known.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    body: Value,
}

fn encode(kind: &str, ts: Option<&str>, body: Value) -> Result<String, EnvelopeError> {
    let envelope = Envelope {
        kind,
        ver: PROTOCOL_VERSION,
        ts,
        body,
    };
    Ok(serde_json::to_string(&envelope)?)
}

fn string_body(body: Value) -> Result<String, EnvelopeError> {
    Ok(serde_json::from_value(body)?)
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Authenticate(_) => "guest:authenticate",
            ClientMessage::Join(_) => "room:join",
            ClientMessage::DocCmd(_) => "doc:cmd",
            ClientMessage::PresenceCmd(_) => "presence:cmd",
        }
    }

    /// Serialize with the given send timestamp.
    pub fn encode(&self, ts: &str) -> Result<String, EnvelopeError> {
        let body = match self {
            ClientMessage::Authenticate(token) => Value::String(token.clone()),
            ClientMessage::Join(room) => Value::String(room.clone()),
            ClientMessage::DocCmd(body) => serde_json::to_value(body)?,
            ClientMessage::PresenceCmd(body) => serde_json::to_value(body)?,
        };
        encode(self.kind(), Some(ts), body)
    }

    /// Parse a client envelope, returning the message and its `ts`.
    pub fn decode(text: &str) -> Result<(Self, Option<String>), EnvelopeError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        let msg = match raw.kind.as_str() {
            "guest:authenticate" => ClientMessage::Authenticate(string_body(raw.body)?),
            "room:join" => ClientMessage::Join(string_body(raw.body)?),
            "doc:cmd" => ClientMessage::DocCmd(serde_json::from_value(raw.body)?),
            "presence:cmd" => ClientMessage::PresenceCmd(serde_json::from_value(raw.body)?),
            _ => return Err(EnvelopeError::UnknownType(raw.kind)),
        };
        Ok((msg, raw.ts))
    }
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Authenticated(_) => "guest:authenticated",
            ServerMessage::Joined(_) => "room:joined",
            ServerMessage::DocFwd(_) => "doc:fwd",
            ServerMessage::PresenceFwd(_) => "presence:fwd",
            ServerMessage::RemoveGuest(_) => "room:rm_guest",
            ServerMessage::Error(_) => "error",
        }
    }

    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        let msg = match raw.kind.as_str() {
            "guest:authenticated" => ServerMessage::Authenticated(string_body(raw.body)?),
            "room:joined" => ServerMessage::Joined(string_body(raw.body)?),
            "doc:fwd" => ServerMessage::DocFwd(serde_json::from_value(raw.body)?),
            "presence:fwd" => ServerMessage::PresenceFwd(serde_json::from_value(raw.body)?),
            "room:rm_guest" => ServerMessage::RemoveGuest(serde_json::from_value(raw.body)?),
            "error" => ServerMessage::Error(match raw.body {
                Value::String(message) => ErrorBody {
                    request: String::new(),
                    message,
                },
                body => serde_json::from_value(body)?,
            }),
            _ => return Err(EnvelopeError::UnknownType(raw.kind)),
        };
        Ok(msg)
    }

    /// Serialize as the relay would (no `ts`).
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        let body = match self {
            ServerMessage::Authenticated(text) | ServerMessage::Joined(text) => {
                Value::String(text.clone())
            }
            ServerMessage::DocFwd(body) => serde_json::to_value(body)?,
            ServerMessage::PresenceFwd(body) => serde_json::to_value(body)?,
            ServerMessage::RemoveGuest(body) => serde_json::to_value(body)?,
            ServerMessage::Error(body) => serde_json::to_value(body)?,
        };
        encode(self.kind(), None, body)
    }
}

// ───────────────────────────── Timestamps ─────────────────────────────

/// Current wall-clock time as Unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generates `"{unix_ms}:{seq}"` send stamps.
#[derive(Debug, Default)]
pub struct Timestamper {
    last_ms: u64,
    seq: u64,
}

impl Timestamper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp_at(&mut self, now_ms: u64) -> String {
        if now_ms == self.last_ms {
            self.seq += 1;
        } else {
            self.last_ms = now_ms;
            self.seq = 0;
        }
        format!("{}:{}", now_ms, self.seq)
    }

    pub fn stamp(&mut self) -> String {
        self.stamp_at(unix_millis())
    }
}
