//! # Store Records
//!
//! Bodies written to the shared store by the fallback bridge. The store only
//! holds strings, so each record is JSON-encoded and then handed to the
//! bridge's cipher before it is written.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::frame::Status;

/// A request written to the store, under a key equal to its action name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// `action` followed by a per-session counter; unique within a session.
    #[serde(rename = "callID")]
    pub call_id: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

impl CallRecord {
    pub fn new(action: &str, seq: u64, data: Value) -> Self {
        Self {
            call_id: format!("{}{}", action, seq),
            action: action.to_string(),
            data,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A reply written to the store, under `callID + "-return"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnRecord {
    pub success: Status,
    #[serde(default)]
    pub data: Value,
}

impl ReturnRecord {
    pub fn new(success: Status, data: Value) -> Self {
        Self { success, data }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
