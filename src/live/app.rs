//! A room's set of live channels

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

use super::channel::{Channel, ChannelState, ChannelStats};
use super::config::LiveConfig;
use super::error::LiveError;
use super::frame::LiveFrame;

/// Live channels of one room, keyed by channel name
///
/// Each channel has at most one publisher and any number of subscribers.
/// Closing the app drops every channel, which ends all subscriber streams.
pub struct LiveApp {
    name: String,
    channels: RwLock<HashMap<String, Arc<RwLock<Channel>>>>,
    config: LiveConfig,
    closed: AtomicBool,
}

impl LiveApp {
    pub(super) fn new(name: impl Into<String>, config: LiveConfig) -> Self {
        Self {
            name: name.into(),
            channels: RwLock::new(HashMap::new()),
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// Get the app name, which is the room id
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the app was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), LiveError> {
        if self.is_closed() {
            return Err(LiveError::AppClosed(self.name.clone()));
        }
        Ok(())
    }

    /// Start publishing into `channel`, creating it if needed
    ///
    /// A channel whose publisher left is taken over; subscribers stay
    /// attached.
    pub async fn register_publisher(
        &self,
        channel: &str,
        session_id: u64,
    ) -> Result<(), LiveError> {
        let mut channels = self.channels.write().await;
        self.check_open()?;

        if let Some(entry) = channels.get(channel) {
            let mut entry = entry.write().await;
            if entry.publisher_id.is_some() {
                return Err(LiveError::AlreadyPublishing(channel.to_string()));
            }
            entry.publisher_id = Some(session_id);
            entry.publisher_left_at = None;
            entry.state = ChannelState::Active;

            tracing::info!(
                app = %self.name,
                channel = %channel,
                session_id = session_id,
                subscribers = entry.subscriber_count(),
                "Publisher registered (existing channel)"
            );
        } else {
            let mut entry = Channel::new(&self.config);
            entry.publisher_id = Some(session_id);
            entry.state = ChannelState::Active;
            channels.insert(channel.to_string(), Arc::new(RwLock::new(entry)));

            tracing::info!(
                app = %self.name,
                channel = %channel,
                session_id = session_id,
                "Publisher registered (new channel)"
            );
        }
        Ok(())
    }

    /// Stop publishing; only the registered publisher may do this
    pub async fn unregister_publisher(
        &self,
        channel: &str,
        session_id: u64,
    ) -> Result<(), LiveError> {
        let channels = self.channels.read().await;
        let entry = channels
            .get(channel)
            .ok_or_else(|| LiveError::ChannelNotFound(channel.to_string()))?;
        let mut entry = entry.write().await;

        if entry.publisher_id != Some(session_id) {
            tracing::warn!(
                app = %self.name,
                channel = %channel,
                expected = ?entry.publisher_id,
                actual = session_id,
                "Publisher unregister mismatch"
            );
            return Err(LiveError::PublisherMismatch);
        }

        entry.publisher_id = None;
        entry.publisher_left_at = Some(Instant::now());
        entry.state = ChannelState::Idle;
        tracing::info!(
            app = %self.name,
            channel = %channel,
            session_id = session_id,
            subscribers = entry.subscriber_count(),
            "Publisher disconnected"
        );
        Ok(())
    }

    /// Attach to a channel with an active publisher
    ///
    /// Returns the live receiver plus the frames a late joiner needs first.
    pub async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<(broadcast::Receiver<LiveFrame>, Vec<LiveFrame>), LiveError> {
        self.check_open()?;
        let channels = self.channels.read().await;
        let entry = channels
            .get(channel)
            .ok_or_else(|| LiveError::ChannelNotFound(channel.to_string()))?;
        let entry = entry.read().await;

        if entry.state == ChannelState::Idle {
            return Err(LiveError::ChannelNotActive(channel.to_string()));
        }

        let rx = entry.subscribe();
        let catchup = entry.catchup_frames();
        entry.subscriber_count.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            app = %self.name,
            channel = %channel,
            subscribers = entry.subscriber_count(),
            catchup_frames = catchup.len(),
            "Subscriber added"
        );
        Ok((rx, catchup))
    }

    /// Detach one subscriber from a channel
    pub async fn unsubscribe(&self, channel: &str) {
        let channels = self.channels.read().await;
        if let Some(entry) = channels.get(channel) {
            let entry = entry.read().await;
            let prev = entry
                .subscriber_count
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
                .unwrap_or(0);

            tracing::debug!(
                app = %self.name,
                channel = %channel,
                subscribers = prev.saturating_sub(1),
                "Subscriber removed"
            );
        }
    }

    /// Push a frame from the publisher to every subscriber
    ///
    /// Returns how many subscribers received it.
    pub async fn publish(&self, channel: &str, frame: LiveFrame) -> Result<usize, LiveError> {
        let channels = self.channels.read().await;
        let entry = channels
            .get(channel)
            .ok_or_else(|| LiveError::ChannelNotFound(channel.to_string()))?;
        let mut entry = entry.write().await;

        entry.update_caches(&frame);
        Ok(entry.send(frame))
    }

    /// Cached decoder configuration of a channel
    pub async fn sequence_headers(&self, channel: &str) -> Vec<LiveFrame> {
        let channels = self.channels.read().await;
        match channels.get(channel) {
            Some(entry) => {
                let entry = entry.read().await;
                [&entry.video_header, &entry.audio_header]
                    .into_iter()
                    .flatten()
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        }
    }

    /// Whether `channel` has a publisher
    pub async fn has_active_channel(&self, channel: &str) -> bool {
        let channels = self.channels.read().await;
        match channels.get(channel) {
            Some(entry) => entry.read().await.state == ChannelState::Active,
            None => false,
        }
    }

    /// Point-in-time stats of a channel
    pub async fn channel_stats(&self, channel: &str) -> Option<ChannelStats> {
        let channels = self.channels.read().await;
        let entry = channels.get(channel)?.read().await;
        Some(ChannelStats {
            subscriber_count: entry.subscriber_count(),
            has_publisher: entry.has_publisher(),
            state: entry.state,
        })
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Drop a channel, ending its subscriber streams
    pub async fn remove_channel(&self, channel: &str) -> bool {
        let removed = self.channels.write().await.remove(channel).is_some();
        if removed {
            tracing::info!(app = %self.name, channel = %channel, "Channel removed");
        }
        removed
    }

    /// Close the app and drop every channel
    ///
    /// Only the first call succeeds.
    pub async fn close(&self) -> Result<(), LiveError> {
        let channels = {
            let mut channels = self.channels.write().await;
            if self.closed.swap(true, Ordering::AcqRel) {
                return Err(LiveError::AppClosed(self.name.clone()));
            }
            std::mem::take(&mut *channels)
        };

        tracing::info!(app = %self.name, channels = channels.len(), "Live app closed");
        Ok(())
    }
}
