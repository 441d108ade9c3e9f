//! Hub implementation
//!
//! Owns the client set of one room and the dispatch task that fans broadcasts
//! out to it.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::client::{Client, ClientId, Outbox};
use super::config::HubConfig;
use super::error::HubError;
use super::message::OutboundMessage;

/// Delivery filters for one broadcast
#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    sender: Option<ClientId>,
    include_self: bool,
    ignore_clients: Vec<ClientId>,
    ignore_users: Vec<String>,
}

impl BroadcastOptions {
    /// Deliver to every client
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver to every client except `sender`
    pub fn from_sender(sender: ClientId) -> Self {
        Self {
            sender: Some(sender),
            ..Default::default()
        }
    }

    /// Also deliver to the sender
    pub fn include_self(mut self) -> Self {
        self.include_self = true;
        self
    }

    /// Skip one client
    pub fn ignore_client(mut self, id: ClientId) -> Self {
        self.ignore_clients.push(id);
        self
    }

    /// Skip every client of a user
    pub fn ignore_user(mut self, user_id: impl Into<String>) -> Self {
        self.ignore_users.push(user_id.into());
        self
    }

    fn accepts(&self, client: &Client) -> bool {
        if !self.include_self && self.sender == Some(client.id()) {
            return false;
        }
        if self.ignore_clients.contains(&client.id()) {
            return false;
        }
        !self.ignore_users.iter().any(|u| u == client.user_id())
    }
}

struct BroadcastMessage {
    message: Arc<OutboundMessage>,
    options: BroadcastOptions,
}

/// Per-room broadcast bus
///
/// Created in the running state; [`close`](Hub::close) moves it to the
/// terminal closed state, after which registration and broadcasting fail
/// with [`HubError::Closed`].
pub struct Hub {
    room_id: String,
    config: HubConfig,
    clients: RwLock<HashMap<ClientId, Arc<Client>>>,
    queue: mpsc::Sender<BroadcastMessage>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Hub {
    /// Create a hub and spawn its dispatch task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(room_id: impl Into<String>, config: HubConfig) -> Arc<Self> {
        let (queue, rx) = mpsc::channel(config.broadcast_capacity.max(1));
        let hub = Arc::new(Self {
            room_id: room_id.into(),
            config,
            clients: RwLock::new(HashMap::new()),
            queue,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(dispatch_loop(
            Arc::downgrade(&hub),
            rx,
            hub.shutdown.clone(),
            hub.room_id.clone(),
        ));
        hub
    }

    /// Get the room id
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Get the hub configuration
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Check if the hub has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Create a client sized for this hub (not yet registered)
    pub fn new_client(
        &self,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
    ) -> (Arc<Client>, Outbox) {
        Client::new(
            user_id,
            user_name,
            self.room_id.clone(),
            self.config.client_outbox_capacity,
        )
    }

    /// Add a client to the broadcast set
    pub fn register_client(&self, client: Arc<Client>) -> Result<(), HubError> {
        let mut clients = self.clients.write();
        // Checked under the lock so a concurrent close cannot miss this client
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        if client.is_closed() {
            return Err(HubError::ClientClosed);
        }

        clients.insert(client.id(), Arc::clone(&client));
        tracing::debug!(
            room = %self.room_id,
            client_id = client.id(),
            user = %client.user_id(),
            clients = clients.len(),
            "Client registered"
        );
        Ok(())
    }

    /// Remove a client from the broadcast set and close it
    ///
    /// Returns the removed client, or `None` if it was not registered.
    pub fn unregister_client(&self, id: ClientId) -> Result<Option<Arc<Client>>, HubError> {
        let removed = {
            let mut clients = self.clients.write();
            if self.is_closed() {
                return Err(HubError::Closed);
            }
            clients.remove(&id)
        };

        if let Some(ref client) = removed {
            let _ = client.close();
            tracing::debug!(room = %self.room_id, client_id = id, "Client unregistered");
        }
        Ok(removed)
    }

    /// Queue a message for every client accepted by `options`
    ///
    /// Waits only for room in the broadcast queue, never for individual
    /// clients.
    pub async fn broadcast(
        &self,
        message: impl Into<Arc<OutboundMessage>>,
        options: BroadcastOptions,
    ) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        let item = BroadcastMessage {
            message: message.into(),
            options,
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(HubError::Closed),
            sent = self.queue.send(item) => sent.map_err(|_| HubError::Closed),
        }
    }

    /// Queue a message without waiting; fails with [`HubError::Full`]
    pub fn try_broadcast(
        &self,
        message: impl Into<Arc<OutboundMessage>>,
        options: BroadcastOptions,
    ) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        let item = BroadcastMessage {
            message: message.into(),
            options,
        };
        self.queue.try_send(item).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => HubError::Full,
            mpsc::error::TrySendError::Closed(_) => HubError::Closed,
        })
    }

    /// Send a message straight to every client of one user
    ///
    /// Bypasses the broadcast queue. Returns how many clients accepted it.
    pub async fn send_to_user(
        &self,
        user_id: &str,
        message: impl Into<Arc<OutboundMessage>>,
    ) -> Result<usize, HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        let message = message.into();
        let mut delivered = 0;
        for client in self.user_clients(user_id) {
            if client.send(Arc::clone(&message)).await.is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Get a registered client
    pub fn client(&self, id: ClientId) -> Option<Arc<Client>> {
        self.clients.read().get(&id).cloned()
    }

    /// All registered clients
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.clients.read().values().cloned().collect()
    }

    /// Registered clients of one user
    pub fn user_clients(&self, user_id: &str) -> Vec<Arc<Client>> {
        self.clients
            .read()
            .values()
            .filter(|c| c.user_id() == user_id)
            .cloned()
            .collect()
    }

    /// Number of registered clients
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Whether the user has at least one registered client
    pub fn is_online(&self, user_id: &str) -> bool {
        self.clients.read().values().any(|c| c.user_id() == user_id)
    }

    /// Close the hub and every registered client
    ///
    /// Only the first call succeeds; later calls return [`HubError::Closed`].
    /// Messages still queued are dropped.
    pub fn close(&self) -> Result<(), HubError> {
        let clients = {
            let mut clients = self.clients.write();
            if self.closed.swap(true, Ordering::AcqRel) {
                return Err(HubError::Closed);
            }
            std::mem::take(&mut *clients)
        };

        self.shutdown.cancel();
        let count = clients.len();
        for client in clients.into_values() {
            let _ = client.close();
        }

        tracing::info!(room = %self.room_id, clients = count, "Hub closed");
        Ok(())
    }

    fn deliver(&self, item: &BroadcastMessage) {
        let targets: Vec<Arc<Client>> = self
            .clients
            .read()
            .values()
            .filter(|c| item.options.accepts(c))
            .cloned()
            .collect();

        let mut dead = Vec::new();
        for client in targets {
            if let Err(e) = client.try_send(Arc::clone(&item.message)) {
                tracing::warn!(
                    room = %self.room_id,
                    client_id = client.id(),
                    kind = item.message.kind(),
                    error = %e,
                    "Client cannot receive, dropping it"
                );
                dead.push(client);
            }
        }

        if !dead.is_empty() {
            let mut clients = self.clients.write();
            for client in dead {
                let _ = client.close();
                clients.remove(&client.id());
            }
        }
    }
}

async fn dispatch_loop(
    hub: Weak<Hub>,
    mut rx: mpsc::Receiver<BroadcastMessage>,
    shutdown: CancellationToken,
    room_id: String,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let Some(hub) = hub.upgrade() else {
            break;
        };

        // A bug in one delivery must not stop the room's dispatch
        if std::panic::catch_unwind(AssertUnwindSafe(|| hub.deliver(&item))).is_err() {
            tracing::error!(
                room = %room_id,
                kind = item.message.kind(),
                "Broadcast delivery panicked"
            );
        }
    }

    tracing::debug!(room = %room_id, "Hub dispatch stopped");
}
