//! Per-room settings

use serde::{Deserialize, Serialize};

/// Room-level switches, persisted with the room and broadcast on change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomSettings {
    /// Not listed publicly
    pub hidden: bool,
    /// Refuse to create new users in this room
    pub disable_join_new_user: bool,
    /// Members may chat (still subject to the user's own permission)
    pub can_send_chat: bool,
    /// Maximum concurrent connections (0 = unlimited)
    pub max_viewers: usize,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            hidden: false,
            disable_join_new_user: false,
            can_send_chat: true,
            max_viewers: 0,
        }
    }
}

impl RoomSettings {
    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn disable_join_new_user(mut self, disable: bool) -> Self {
        self.disable_join_new_user = disable;
        self
    }

    pub fn can_send_chat(mut self, allowed: bool) -> Self {
        self.can_send_chat = allowed;
        self
    }

    pub fn max_viewers(mut self, max: usize) -> Self {
        self.max_viewers = max;
        self
    }

    /// Whether another connection fits given `connected` existing ones
    pub fn has_room_for(&self, connected: usize) -> bool {
        self.max_viewers == 0 || connected < self.max_viewers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_keeps_defaults() {
        let settings: RoomSettings = serde_json::from_str(r#"{"hidden":true}"#).unwrap();
        assert!(settings.hidden);
        assert!(settings.can_send_chat);
        assert_eq!(settings.max_viewers, 0);
    }

    #[test]
    fn test_viewer_limit() {
        assert!(RoomSettings::default().has_room_for(10_000));

        let limited = RoomSettings::default().max_viewers(2);
        assert!(limited.has_room_for(1));
        assert!(!limited.has_room_for(2));
    }
}
