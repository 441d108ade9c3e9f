//! Hub configuration

use serde::Deserialize;

/// Queue sizes for a hub and its clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Capacity of the room's broadcast queue
    pub broadcast_capacity: usize,

    /// Capacity of each client's outbox
    pub client_outbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 128,
            client_outbox_capacity: 64,
        }
    }
}

impl HubConfig {
    /// Set the broadcast queue capacity (at least 1)
    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity.max(1);
        self
    }

    /// Set the per-client outbox capacity (at least 1)
    pub fn client_outbox_capacity(mut self, capacity: usize) -> Self {
        self.client_outbox_capacity = capacity.max(1);
        self
    }
}
