//! # Transport Abstraction
//!
//! A minimal, async interface for moving strings between two execution contexts.
//!
//! ## Philosophy
//!
//! - **Opaque**: The Transport knows nothing about envelopes, keys or actions.
//!   It moves strings and reports the origin they came from.
//! - **Fire and Forget**: There is no request-response at this layer. Delivery
//!   is not guaranteed and messages may be silently dropped. Correlation is
//!   built on top of this, not defined here.
//! - **One Interface**: The direct channel and the store-backed fallback both
//!   implement this trait, so the client and server never know which one they
//!   are talking through.

use std::fmt;

/// Errors that occur at the channel layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The peer context is gone or the channel was dropped.
    ConnectionLost(String),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A message received from the peer context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Origin of the sending context, as attested by the channel.
    pub origin: String,
    pub data: String,
}

impl Inbound {
    pub fn new(origin: impl Into<String>, data: impl Into<String>) -> Self {
        Self { origin: origin.into(), data: data.into() }
    }
}

/// A mechanism to post a string to a peer context and receive its posts.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Posts a payload to the peer.
    ///
    /// `target_origin` is the origin the peer must have for the message to be
    /// delivered, or `"*"` for any. A mismatch is not an error: the message is
    /// dropped, exactly as an undeliverable post would be.
    ///
    /// # invariants
    /// - Must not interpret the payload content.
    /// - Must return `Err` only when the channel itself is broken.
    async fn send(&self, payload: &str, target_origin: &str) -> Result<()>;

    /// Waits for the next message from the peer.
    ///
    /// Returns `Ok(None)` once the channel is closed for good.
    async fn recv(&self) -> Result<Option<Inbound>>;
}
