//! # xqwire
//!
//! The wire vocabulary of the cross-context query protocol.
//!
//! ## Architecture
//!
//! Two peers (a host and an embedded child context) exchange opaque strings.
//! Every string on the wire is compact JSON, and the encoded request doubles as
//! its own correlation key: the child echoes it back verbatim in the `key`
//! field of every response. This crate owns the encoding of those strings and
//! nothing else; it performs no I/O.
//!
//! - [`frame`]: request, response and handshake envelopes.
//! - [`codec`]: canonical correlation keys.
//! - [`record`]: the bodies written to the shared store by the fallback bridge.
//! - [`destination`]: splitting a destination URL into origin and path.

pub mod codec;
pub mod destination;
pub mod error;
pub mod frame;
pub mod record;


pub use codec::correlation_key;
pub use codec::decode_request;
pub use destination::normalize_destination;
pub use destination::origin_of;
pub use destination::split_destination;
pub use error::Error;
pub use error::Result;
pub use frame::Handshake;
pub use frame::Message;
pub use frame::Request;
pub use frame::Response;
pub use frame::Signal;
pub use frame::Status;
pub use record::CallRecord;
pub use record::ReturnRecord;

pub use serde_json::Value;

// ============================================================================
//  PROTOCOL CONSTANTS
// ============================================================================

/// Asks a server to re-announce its readiness. Never reaches a handler.
pub const ACTION_PING: &str = "ping";

/// One-time activation of a fallback session. Carries the key material.
pub const ACTION_ACTIVATE: &str = "xqProxyActivate";

/// Watch call answered by the fallback destination just before it unloads.
pub const ACTION_DEACTIVATE: &str = "xqDeactivate";

/// Value written under the activation key once the fallback destination is live.
pub const ACTIVE_SENTINEL: &str = "active";

/// Suffix for fallback reply keys.
pub const RETURN_SUFFIX: &str = "-return";

pub const ERR_DECODE: &str = "Unable to decode data";
pub const ERR_NO_ACTION: &str = "No callable action";
pub const ERR_TIMED_OUT: &str = "The request timed out";

/// Builds the `{"error": msg}` payload carried by protocol-level failures.
pub fn error_data(msg: &str) -> Value {
    serde_json::json!({ "error": msg })
}
