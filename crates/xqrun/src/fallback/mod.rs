//! # Store-and-Poll Fallback
//!
//! Carries the protocol over a shared key-value store for hosts where the
//! two contexts have no usable direct channel.
//!
//! ## Philosophy
//!
//! - **Same Contract**: Both roles are [`Transport`](crate::transport::Transport)s.
//!   The [`Client`](crate::client::Client) talks through a [`FallbackBridge`]
//!   and the [`Server`](crate::server::Server) through a [`FallbackResponder`]
//!   exactly as they would through a direct channel; the store traffic is an
//!   implementation detail of these two types.
//! - **Single Slot**: Each direction has one pointer key naming the entry that
//!   holds the current message. A writer locks itself for a throttle window
//!   after each write so the peer reads the pointer before it is replaced.
//! - **Negotiated Keys**: The requesting side generates one random string of
//!   key material per session and hands it over in an activation request.
//!   Both sides derive the pointer, sentinel and cipher keys from it.
//!
//! ## Store Layout
//!
//! ```text
//! messageKey             -> entry name of the current request (its action)
//! <action>               -> cipher(CallRecord)
//! messageKey + "-return" -> entry name of the current reply (callID + "-return")
//! callID + "-return"     -> cipher(ReturnRecord)
//! activationKey          -> "active" once the responder is set up
//! ```

mod bridge;
mod cipher;
mod keys;
mod mailbox;
mod responder;

use std::fmt;
use std::time::Duration;

pub use bridge::FallbackBridge;
pub use cipher::Cipher;
pub use cipher::Passthrough;
pub use keys::KEY_MATERIAL_LEN;
pub use keys::SessionKeys;
pub use responder::FallbackResponder;

pub(crate) use mailbox::Mailbox;
pub(crate) use mailbox::Posted;

/// Default lock window after each store write.
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(80);

#[derive(Debug, Clone)]
pub enum Error {
    /// The bootstrap channel closed before activation completed.
    Closed,
    /// Activation carried unusable key material.
    BadKeys(String),
    /// The destination URL could not be parsed.
    Destination(xqwire::Error),
    Transport(crate::transport::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Bootstrap channel closed before activation"),
            Self::BadKeys(msg) => write!(f, "Invalid session keys: {}", msg),
            Self::Destination(e) => write!(f, "Invalid destination: {}", e),
            Self::Transport(e) => write!(f, "Bootstrap transport failed: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<crate::transport::Error> for Error {
    fn from(e: crate::transport::Error) -> Self {
        Self::Transport(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Settings shared by both fallback roles.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// The destination URL; the server is known to the host by it.
    pub url: String,
    /// How long a side waits after writing before it writes again.
    pub throttle: Duration,
}

impl FallbackConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), throttle: DEFAULT_THROTTLE }
    }

    pub fn throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }
}
