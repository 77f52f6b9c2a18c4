//! # Protocol Envelopes
//!
//! Defines the three envelopes that cross the channel:
//!
//! - **Request** `{action, data}`, host to child. Its encoding is its key.
//! - **Response** `{success, key, url, data}`, child to host.
//! - **Handshake** `{init, server}`, child to host, announcing (de)initialization.
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Forward Compatibility**: Unknown fields are ignored.

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de::Error as _;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;

/// The outcome carried by a response.
///
/// Encodes as `true`, `false` or `"notify"` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Fail,
    /// Progress report; the request stays open for a later terminal status.
    Notify,
}

impl Status {
    /// Whether this status settles the request.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Notify)
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Success => s.serialize_bool(true),
            Self::Fail => s.serialize_bool(false),
            Self::Notify => s.serialize_str("notify"),
        }
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(d)? {
            Value::Bool(true) => Ok(Self::Success),
            Value::Bool(false) => Ok(Self::Fail),
            Value::String(s) if s == "notify" => Ok(Self::Notify),
            other => Err(D::Error::custom(Error::BadStatus(other.to_string()))),
        }
    }
}

/// Readiness signal emitted by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    #[serde(rename = "xq-init")]
    Init,
    #[serde(rename = "xq-de-init")]
    DeInit,
}

/// `{init, server}`: a server announcing that it is (no longer) accepting requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub init: Signal,
    /// The URL the server was loaded from; identifies the endpoint.
    pub server: String,
}

impl Handshake {
    pub fn new(init: Signal, server: impl Into<String>) -> Self {
        Self { init, server: server.into() }
    }

    pub fn encode(&self) -> String {
        Value::from(self).to_string()
    }
}

impl From<&Handshake> for Value {
    fn from(h: &Handshake) -> Self {
        serde_json::json!({ "init": h.init, "server": h.server })
    }
}

/// `{success, key, url, data}`: a server's answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: Status,
    /// The correlation key of the request being answered.
    pub key: String,
    /// The server URL, used by the host to find the endpoint.
    pub url: String,
    #[serde(default)]
    pub data: Value,
}

impl Response {
    pub fn encode(&self) -> String {
        serde_json::json!({
            "success": self.success,
            "key": self.key,
            "url": self.url,
            "data": self.data,
        })
        .to_string()
    }
}

/// A decoded request. The raw string it came from is its correlation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

impl Request {
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        Self { action: action.into(), data }
    }

    /// The JSON object form, suitable for `correlation_key`.
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "action": self.action, "data": self.data })
    }
}

/// A message arriving at the host, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(Handshake),
    Response(Response),
}

impl Message {
    /// Classifies a raw inbound string.
    ///
    /// Handshakes are recognized by their `init` field; everything else must
    /// carry `key` and `url` to be a response.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::Empty);
        }
        let value: Value = serde_json::from_str(raw)?;
        let Some(obj) = value.as_object() else {
            return Err(Error::NotAnObject);
        };

        if let Some(init) = obj.get("init") {
            let init = serde_json::from_value::<Signal>(init.clone())
                .map_err(|_| Error::BadSignal(init.to_string()))?;
            let server = obj
                .get("server")
                .and_then(Value::as_str)
                .ok_or(Error::MissingField("server"))?;
            return Ok(Self::Handshake(Handshake::new(init, server)));
        }

        for field in ["key", "url"] {
            if !obj.get(field).is_some_and(Value::is_string) {
                return Err(Error::MissingField(field));
            }
        }
        if !obj.contains_key("success") {
            return Err(Error::MissingField("success"));
        }

        let response = serde_json::from_value::<Response>(value)?;
        Ok(Self::Response(response))
    }
}
