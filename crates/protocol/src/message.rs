//! Message codec.
//!
//! A message is a JSON object `{type, payload?}`. The typed [`Message`] enum
//! is converted to and from that envelope by hand so that payload-less
//! messages stay payload-less on the wire (`{"type":"stop"}`) and so that
//! lenient inputs from older peers (numeric state ids, `"payload":null`)
//! still decode.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload of an orderly `exit`/`exitSession`.
pub const EXIT_SENTINEL: &str = "kbye";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartPayload {
    /// SHA-1 hex digest of the generated source the client believes is running.
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatePayload {
    /// Path of the compiled evaluator artifact.
    pub lib: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationPayload {
    pub lib: String,
    pub eval: String,
}

/// One entry of a `states` report: a state holding `count` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateEntry {
    pub id: u64,
    pub count: u64,
}

/// Operation acknowledged by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckKind {
    Start,
    Stop,
    Pause,
    Resume,
    Reload,
}

impl AckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckKind::Start => "start",
            AckKind::Stop => "stop",
            AckKind::Pause => "pause",
            AckKind::Resume => "resume",
            AckKind::Reload => "reload",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(AckKind::Start),
            "stop" => Some(AckKind::Stop),
            "pause" => Some(AckKind::Pause),
            "resume" => Some(AckKind::Resume),
            "reload" => Some(AckKind::Reload),
            _ => None,
        }
    }
}

/// Every message either role can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // Handshake
    Hello(HelloPayload),
    Ehlo,

    // Client -> peer
    Start(StartPayload),
    Stop,
    Pause,
    Resume,
    Reload,
    Breakpoints(Vec<u64>),
    Evaluate(EvaluatePayload),
    /// Client disconnects. From the peer, carries `"kbye"` or a reason.
    Exit(Option<String>),
    /// Client ends the debugging session on the peer.
    ExitSession(Option<String>),

    // Peer -> client
    Ack(AckKind),
    Error(String),
    States(Vec<StateEntry>),
    Evaluation(EvaluationPayload),
}

/// Wire envelope.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

/// Decoding failures. All of them are fatal to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Not a JSON object with a string `type`.
    Malformed(String),
    /// Well-formed envelope with a `type` nobody speaks.
    UnknownType(String),
    /// Known `type`, payload of the wrong shape.
    InvalidPayload { kind: String, reason: String },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Malformed(e) => write!(f, "Malformed message: {}", e),
            CodecError::UnknownType(t) => write!(f, "Unknown message type: {}", t),
            CodecError::InvalidPayload { kind, reason } => {
                write!(f, "Invalid payload for '{}' message: {}", kind, reason)
            }
        }
    }
}

impl std::error::Error for CodecError {}

impl Message {
    pub fn hello(version: &str) -> Self {
        Message::Hello(HelloPayload { version: version.to_string() })
    }

    pub fn start(hash: impl Into<String>) -> Self {
        Message::Start(StartPayload { hash: hash.into() })
    }

    pub fn evaluate(lib: impl Into<String>) -> Self {
        Message::Evaluate(EvaluatePayload { lib: lib.into() })
    }

    pub fn evaluation(lib: impl Into<String>, eval: impl Into<String>) -> Self {
        Message::Evaluation(EvaluationPayload { lib: lib.into(), eval: eval.into() })
    }

    pub fn error(text: impl Into<String>) -> Self {
        Message::Error(text.into())
    }

    /// The peer's reply to a successful `exit`/`exitSession`.
    pub fn goodbye() -> Self {
        Message::Exit(Some(EXIT_SENTINEL.to_string()))
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::Ehlo => "ehlo",
            Message::Start(_) => "start",
            Message::Stop => "stop",
            Message::Pause => "pause",
            Message::Resume => "resume",
            Message::Reload => "reload",
            Message::Breakpoints(_) => "breakpoints",
            Message::Evaluate(_) => "evaluate",
            Message::Exit(_) => "exit",
            Message::ExitSession(_) => "exitSession",
            Message::Ack(_) => "ack",
            Message::Error(_) => "error",
            Message::States(_) => "states",
            Message::Evaluation(_) => "evaluation",
        }
    }

    fn payload(&self) -> Option<Value> {
        match self {
            Message::Hello(p) => Some(json_object([("version", Value::from(p.version.as_str()))])),
            Message::Start(p) => Some(json_object([("hash", Value::from(p.hash.as_str()))])),
            Message::Evaluate(p) => Some(json_object([("lib", Value::from(p.lib.as_str()))])),
            Message::Evaluation(p) => Some(json_object([
                ("lib", Value::from(p.lib.as_str())),
                ("eval", Value::from(p.eval.as_str())),
            ])),
            Message::Breakpoints(ids) => {
                Some(Value::Array(ids.iter().map(|id| Value::from(*id)).collect()))
            }
            Message::Exit(reason) | Message::ExitSession(reason) => {
                reason.as_deref().map(Value::from)
            }
            Message::Ack(kind) => Some(Value::from(kind.as_str())),
            Message::Error(text) => Some(Value::from(text.as_str())),
            Message::States(entries) => Some(Value::Array(
                entries
                    .iter()
                    .map(|e| {
                        json_object([
                            ("id", Value::from(e.id.to_string())),
                            ("count", Value::from(e.count)),
                        ])
                    })
                    .collect(),
            )),
            Message::Ehlo | Message::Stop | Message::Pause | Message::Resume | Message::Reload => {
                None
            }
        }
    }

    /// Serialize to the wire text.
    pub fn encode(&self) -> String {
        let mut obj = Map::new();
        obj.insert("type".to_string(), Value::from(self.kind()));
        if let Some(payload) = self.payload() {
            obj.insert("payload".to_string(), payload);
        }
        Value::Object(obj).to_string()
    }

    /// Parse wire text.
    ///
    /// An empty string means "no frame yet" and yields `Ok(None)`.
    pub fn decode(text: &str) -> Result<Option<Message>, CodecError> {
        if text.is_empty() {
            return Ok(None);
        }

        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;
        Self::from_envelope(envelope).map(Some)
    }

    fn from_envelope(envelope: Envelope) -> Result<Message, CodecError> {
        let Envelope { kind, payload } = envelope;
        let msg = match kind.as_str() {
            "hello" => Message::Hello(typed_payload(&kind, payload)?),
            "ehlo" => Message::Ehlo,
            "start" => Message::Start(typed_payload(&kind, payload)?),
            "stop" => Message::Stop,
            "pause" => Message::Pause,
            "resume" => Message::Resume,
            "reload" => Message::Reload,
            "breakpoints" => Message::Breakpoints(typed_payload(&kind, payload)?),
            "evaluate" => Message::Evaluate(typed_payload(&kind, payload)?),
            "evaluation" => Message::Evaluation(typed_payload(&kind, payload)?),
            "exit" => Message::Exit(payload.map(text_of)),
            "exitSession" => Message::ExitSession(payload.map(text_of)),
            "ack" => {
                let value = required(&kind, payload)?;
                let ack = value.as_str().and_then(AckKind::parse).ok_or_else(|| {
                    CodecError::InvalidPayload {
                        kind: kind.clone(),
                        reason: format!("unknown operation {}", value),
                    }
                })?;
                Message::Ack(ack)
            }
            "error" => Message::Error(payload.map(text_of).unwrap_or_default()),
            "states" => Message::States(parse_states(&kind, required(&kind, payload)?)?),
            _ => return Err(CodecError::UnknownType(kind.clone())),
        };
        Ok(msg)
    }

    /// True for an `exit`/`exitSession` carrying the orderly sentinel.
    pub fn is_orderly_exit(&self) -> bool {
        match self {
            Message::Exit(reason) | Message::ExitSession(reason) => {
                reason.as_deref() == Some(EXIT_SENTINEL)
            }
            _ => false,
        }
    }
}

fn json_object<const N: usize>(fields: [(&str, Value); N]) -> Value {
    let mut obj = Map::new();
    for (key, value) in fields {
        obj.insert(key.to_string(), value);
    }
    Value::Object(obj)
}

fn required(kind: &str, payload: Option<Value>) -> Result<Value, CodecError> {
    payload.ok_or_else(|| CodecError::InvalidPayload {
        kind: kind.to_string(),
        reason: "missing payload".to_string(),
    })
}

fn typed_payload<T: serde::de::DeserializeOwned>(
    kind: &str,
    payload: Option<Value>,
) -> Result<T, CodecError> {
    serde_json::from_value(required(kind, payload)?).map_err(|e| CodecError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

/// Strings pass through; anything else is kept as its JSON text.
fn text_of(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn parse_states(kind: &str, payload: Value) -> Result<Vec<StateEntry>, CodecError> {
    let invalid = |reason: String| CodecError::InvalidPayload { kind: kind.to_string(), reason };

    let items = match payload {
        Value::Array(items) => items,
        other => return Err(invalid(format!("expected an array, got {}", other))),
    };

    items
        .into_iter()
        .map(|item| {
            let id = match item.get("id") {
                Some(Value::String(s)) => s
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| invalid(format!("invalid state id '{}'", s)))?,
                Some(Value::Number(n)) => n
                    .as_u64()
                    .ok_or_else(|| invalid(format!("invalid state id {}", n)))?,
                _ => return Err(invalid(format!("state entry without id: {}", item))),
            };
            let count = item
                .get("count")
                .and_then(Value::as_u64)
                .ok_or_else(|| invalid(format!("invalid token count in {}", item)))?;
            Ok(StateEntry { id, count })
        })
        .collect()
}
