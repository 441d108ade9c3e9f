//! Per-channel state

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::broadcast;
use tokio::time::Instant;

use super::config::LiveConfig;
use super::frame::{FrameKind, LiveFrame};

/// State of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// A publisher is pushing frames
    Active,
    /// The publisher left; subscribers stay attached until a new one arrives
    Idle,
}

/// One named stream inside a live app
pub struct Channel {
    /// Cached video sequence header for late joiners
    pub video_header: Option<LiveFrame>,

    /// Cached audio sequence header for late joiners
    pub audio_header: Option<LiveFrame>,

    pub metadata: Option<LiveFrame>,

    /// Session publishing into this channel
    pub publisher_id: Option<u64>,

    pub(super) tx: broadcast::Sender<LiveFrame>,

    pub subscriber_count: AtomicU32,

    pub publisher_left_at: Option<Instant>,

    pub state: ChannelState,
}

impl Channel {
    pub(super) fn new(config: &LiveConfig) -> Self {
        let (tx, _) = broadcast::channel(config.broadcast_capacity.max(1));

        Self {
            video_header: None,
            audio_header: None,
            metadata: None,
            publisher_id: None,
            tx,
            subscriber_count: AtomicU32::new(0),
            publisher_left_at: None,
            state: ChannelState::Idle,
        }
    }

    pub fn subscriber_count(&self) -> u32 {
        self.subscriber_count.load(Ordering::Relaxed)
    }

    pub fn has_publisher(&self) -> bool {
        self.publisher_id.is_some()
    }

    /// Metadata then sequence headers, for a subscriber joining mid-stream
    pub fn catchup_frames(&self) -> Vec<LiveFrame> {
        [&self.metadata, &self.video_header, &self.audio_header]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub(super) fn subscribe(&self) -> broadcast::Receiver<LiveFrame> {
        self.tx.subscribe()
    }

    /// Fan a frame out; returns how many receivers got it
    pub(super) fn send(&self, frame: LiveFrame) -> usize {
        self.tx.send(frame).unwrap_or(0)
    }

    pub(super) fn update_caches(&mut self, frame: &LiveFrame) {
        match frame.kind {
            FrameKind::Video if frame.is_header => self.video_header = Some(frame.clone()),
            FrameKind::Audio if frame.is_header => self.audio_header = Some(frame.clone()),
            FrameKind::Metadata => self.metadata = Some(frame.clone()),
            _ => {}
        }
    }
}

/// Point-in-time view of a channel
#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub subscriber_count: u32,
    pub has_publisher: bool,
    pub state: ChannelState,
}
