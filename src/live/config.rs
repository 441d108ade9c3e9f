//! Live channel configuration

use serde::Deserialize;

/// Live channel configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Frames buffered per channel before slow subscribers start lagging
    pub broadcast_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
        }
    }
}

impl LiveConfig {
    /// Set the per-channel broadcast capacity (at least 1)
    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity.max(1);
        self
    }
}
