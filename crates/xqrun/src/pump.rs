//! # Channel Pumps
//!
//! Every channel is driven by two background tasks:
//!
//! - a **writer** that drains an ordered outbox into `Transport::send`, so
//!   callers can post from synchronous code without awaiting the channel;
//! - a **pump** that reads `Transport::recv` and hands each message to a
//!   routing callback.
//!
//! Both stop when the channel closes. They must be started from inside a
//! Tokio runtime.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::transport::Inbound;
use crate::transport::Transport;

/// A payload waiting to be posted.
#[derive(Debug, Clone)]
pub(crate) struct Outgoing {
    pub payload: String,
    pub target_origin: String,
}

/// The sending half of a writer task.
#[derive(Debug, Clone)]
pub(crate) struct Outbox {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Outbox {
    /// Queues a payload for posting. Returns `false` if the writer has stopped.
    pub(crate) fn post(&self, payload: impl Into<String>, target_origin: impl Into<String>) -> bool {
        self.tx
            .send(Outgoing { payload: payload.into(), target_origin: target_origin.into() })
            .is_ok()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawns a writer task posting to `transport` in FIFO order.
pub(crate) fn spawn_writer(name: String, transport: Arc<dyn Transport>) -> Outbox {
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();

    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            trace!(channel = %name, target = %out.target_origin, "posting {}", out.payload);
            if let Err(e) = transport.send(&out.payload, &out.target_origin).await {
                warn!(channel = %name, "send failed, closing writer: {}", e);
                break;
            }
        }
        debug!(channel = %name, "writer stopped");
    });

    Outbox { tx }
}

/// Spawns a pump task routing every inbound message through `route`.
pub(crate) fn spawn_pump<F>(name: String, transport: Arc<dyn Transport>, route: F)
where
    F: Fn(Inbound) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match transport.recv().await {
                Ok(Some(msg)) => {
                    // The router returns false once its owner is gone.
                    if !route(msg) {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(channel = %name, "stream closed");
                    break;
                }
                Err(e) => {
                    warn!(channel = %name, "transport error in pump: {}", e);
                    break;
                }
            }
        }
    });
}
