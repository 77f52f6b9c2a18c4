//! # xqrun
//!
//! Request/response messaging between a host context and an embedded child
//! context that can only exchange opaque, unordered, fire-and-forget strings.
//!
//! ## Architecture
//!
//! - **Client**: The host-side correlator. Turns posts into [`ResponseHandle`]s
//!   with timeouts, per-endpoint queues and pausing.
//! - **Server**: The child-side dispatcher. Routes requests to registered
//!   actions under an origin allow-list and announces its readiness.
//! - **Fallback**: A store-and-poll transport pair for hosts with no direct
//!   channel. Both halves implement [`Transport`], so the client and server run
//!   over it unchanged.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use xqrun::Client;
//! use xqrun::QueryOptions;
//! use xqrun::SetupOptions;
//!
//! # async fn example(opener: Arc<dyn xqrun::FrameOpener>) -> anyhow::Result<()> {
//! let client = Client::new(opener);
//! let endpoint = client.setup("https://widgets.example/server.html", SetupOptions::default())?;
//!
//! let handle = endpoint.query(&json!({ "action": "greet", "data": "hi" }), QueryOptions::default())?;
//! let reply = handle.settled().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
mod endpoint;
pub mod fallback;
pub mod frame;
pub mod handle;
pub mod mock_transport;
pub mod readiness;
pub mod server;
pub mod store;
pub mod transport;

mod pump;


pub use client::Client;
pub use client::EndpointHandle;
pub use client::QueryOptions;
pub use client::SetupOptions;
pub use frame::DestinationRef;
pub use frame::Frame;
pub use frame::FrameKind;
pub use frame::FrameOpener;
pub use frame::FrameOptions;
pub use handle::QueryError;
pub use handle::ResponseHandle;
pub use readiness::Readiness;
pub use readiness::ReadinessState;
pub use server::Actions;
pub use server::Invocation;
pub use server::Responder;
pub use server::Server;
pub use server::ServerConfig;
pub use store::MemoryStore;
pub use store::Store;
pub use transport::Inbound;
pub use transport::Transport;
