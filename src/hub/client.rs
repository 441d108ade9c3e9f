//! Server-side handle for one connection

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::error::HubError;
use super::message::OutboundMessage;

/// Unique id of a client within the process
pub type ClientId = u64;

/// Receiving half of a client's outbox, drained by its writer
pub type Outbox = mpsc::Receiver<Arc<OutboundMessage>>;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// One connection's outbound mailbox
///
/// Identity (user, room) is read-only. Ordering and shutdown of outbound
/// delivery are internal: callers need no extra locking.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    user_id: String,
    user_name: String,
    room_id: String,
    connected_at: Instant,
    outbox: Mutex<Option<mpsc::Sender<Arc<OutboundMessage>>>>,
    closed: AtomicBool,
}

impl Client {
    /// Create a client and the outbox its writer drains
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        room_id: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, Outbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let client = Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            user_id: user_id.into(),
            user_name: user_name.into(),
            room_id: room_id.into(),
            connected_at: Instant::now(),
            outbox: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });
        (client, rx)
    }

    /// Get the client id
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Get the id of the connected user
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Get the display name of the connected user
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Get the room this client belongs to
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Get how long the client has been connected
    pub fn duration(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    /// Check if the client has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn sender(&self) -> Result<mpsc::Sender<Arc<OutboundMessage>>, HubError> {
        self.outbox.lock().clone().ok_or(HubError::ClientClosed)
    }

    /// Queue a message, waiting while the outbox is full
    pub async fn send(&self, message: impl Into<Arc<OutboundMessage>>) -> Result<(), HubError> {
        let tx = self.sender()?;
        tx.send(message.into())
            .await
            .map_err(|_| HubError::ClientClosed)
    }

    /// Queue a message without waiting
    pub fn try_send(&self, message: Arc<OutboundMessage>) -> Result<(), HubError> {
        let tx = self.sender()?;
        tx.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => HubError::Full,
            mpsc::error::TrySendError::Closed(_) => HubError::ClientClosed,
        })
    }

    /// Close the outbox
    ///
    /// Only the first call succeeds. Sends already in flight still complete;
    /// the writer drains what was queued and then stops.
    pub fn close(&self) -> Result<(), HubError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(HubError::ClientClosed);
        }
        self.outbox.lock().take();

        tracing::debug!(
            client_id = self.id,
            user = %self.user_id,
            room = %self.room_id,
            "Client closed"
        );
        Ok(())
    }
}
