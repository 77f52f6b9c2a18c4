//! # Correlation Keys
//!
//! A request's key is the compact JSON encoding of its arguments. Objects keep
//! their field insertion order, so identical arguments always produce the same
//! key and decoding a key then encoding it again reproduces it exactly.

use serde_json::Value;

use crate::error::Error;
use crate::error::Result;
use crate::frame::Request;

/// Encodes query arguments into their correlation key.
///
/// Arguments must be a JSON object.
pub fn correlation_key(args: &Value) -> Result<String> {
    if !args.is_object() {
        return Err(Error::NotAnObject);
    }
    Ok(serde_json::to_string(args)?)
}

/// Decodes a correlation key back into the request it encodes.
///
/// A missing `action` decodes as the empty action, which no table can match.
pub fn decode_request(key: &str) -> Result<Request> {
    if key.is_empty() {
        return Err(Error::Empty);
    }
    let value: Value = serde_json::from_str(key)?;
    if !value.is_object() {
        return Err(Error::NotAnObject);
    }
    let request = Request {
        action: value
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        data: value.get("data").cloned().unwrap_or(Value::Null),
    };
    Ok(request)
}
