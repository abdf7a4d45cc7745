//! Owned handle to the write side of one websocket.
//!
//! The socket itself stays with the connection task; the handle queues frames
//! for its writer task and carries the close signal the receive loop watches.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Frame queued for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Clone, Debug)]
pub struct TransportHandle {
    tx: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

impl TransportHandle {
    /// Create a handle and the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Queue a text frame. Returns false if the queue is full or the handle is closed.
    pub fn send_text(&self, text: String) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.try_send(Outbound::Text(text)).is_ok()
    }

    /// Close the transport with the given code. Only the first call sends a close frame.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        if self.is_closed() {
            return;
        }
        self.closed.cancel();
        if let Err(e) = self.tx.try_send(Outbound::Close {
            code,
            reason: reason.into(),
        }) {
            tracing::debug!(error = %e, "close frame not queued, socket will drop without one");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`Self::close`] has been called on any clone of this handle.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}
