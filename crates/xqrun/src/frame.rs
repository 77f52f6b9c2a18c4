//! # Child Contexts
//!
//! The client talks to a child context it either creates or is handed. Creating
//! and attaching the context (an embedded frame or a popup window) is outside
//! this crate; these traits are the capabilities the client needs from it.

use std::fmt;
use std::sync::Arc;

use crate::transport::Transport;

/// How a child context is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// An embedded frame; navigated by resetting its source.
    Embedded,
    /// A separate top-level window.
    Window,
}

/// A handle to a child context.
pub trait Frame: Send + Sync + 'static {
    fn kind(&self) -> FrameKind;

    /// The URL the context is currently showing.
    fn location(&self) -> String;

    /// Re-navigates the context. Used to (re)start a stale server.
    fn navigate(&self, url: &str);

    /// Whether the context has been closed. Embedded frames never close.
    fn is_closed(&self) -> bool;

    /// The channel into this context.
    fn transport(&self) -> Arc<dyn Transport>;
}

/// Options for creating a child context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameOptions {
    /// Open a popup window instead of an embedded frame.
    pub window: bool,
    /// Window feature string, passed through to the opener.
    pub attrs: Option<String>,
    /// Window name. A fallback session opens its destination window with the
    /// key material as the name (see `FallbackBridge::window_options`).
    pub name: Option<String>,
}

impl FrameOptions {
    pub fn window() -> Self {
        Self { window: true, ..Self::default() }
    }

    pub fn attrs(mut self, attrs: impl Into<String>) -> Self {
        self.attrs = Some(attrs.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Creates child contexts on demand.
pub trait FrameOpener: Send + Sync + 'static {
    fn open(&self, url: &str, options: &FrameOptions) -> Arc<dyn Frame>;
}

/// Where a client should send its queries.
#[derive(Clone)]
pub enum DestinationRef {
    /// A URL; the client opens a context for it.
    Url(String),
    /// A context that already exists; its location is the URL.
    Existing(Arc<dyn Frame>),
}

impl DestinationRef {
    pub fn url(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::Existing(frame) => frame.location(),
        }
    }
}

impl From<&str> for DestinationRef {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

impl From<String> for DestinationRef {
    fn from(url: String) -> Self {
        Self::Url(url)
    }
}

impl From<Arc<dyn Frame>> for DestinationRef {
    fn from(frame: Arc<dyn Frame>) -> Self {
        Self::Existing(frame)
    }
}

impl fmt::Debug for DestinationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Existing(frame) => f.debug_tuple("Existing").field(&frame.location()).finish(),
        }
    }
}
