//! # Error Definitions
//!
//! Failures while encoding or decoding protocol strings.

/// Decoding and encoding failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The input was empty.
    Empty,
    /// The input was not valid JSON, or did not fit the expected shape.
    Json(String),
    /// Request arguments and envelopes must be JSON objects.
    NotAnObject,
    /// A required envelope field was absent.
    MissingField(&'static str),
    /// The `success` field was neither a boolean nor `"notify"`.
    BadStatus(String),
    /// The `init` field was not a known handshake signal.
    BadSignal(String),
    /// The destination was not an `http(s)://` URL.
    BadDestination(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty payload"),
            Self::Json(msg) => write!(f, "malformed JSON: {}", msg),
            Self::NotAnObject => write!(f, "expected a JSON object"),
            Self::MissingField(name) => write!(f, "missing field '{}'", name),
            Self::BadStatus(raw) => write!(f, "invalid response status: {}", raw),
            Self::BadSignal(raw) => write!(f, "invalid handshake signal: {}", raw),
            Self::BadDestination(url) => write!(f, "not an http(s) destination: {}", url),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;
