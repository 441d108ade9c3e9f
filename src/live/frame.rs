//! Frames routed from a publisher to subscribers

use bytes::Bytes;

/// Type of live frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Video,
    Audio,
    /// Stream metadata (`onMetaData`)
    Metadata,
}

/// One frame of a live channel
///
/// Cheap to clone: the payload is reference counted and shared by every
/// subscriber.
#[derive(Debug, Clone)]
pub struct LiveFrame {
    pub kind: FrameKind,
    /// Timestamp in milliseconds
    pub timestamp: u32,
    pub data: Bytes,
    /// Video keyframe
    pub is_keyframe: bool,
    /// Decoder configuration a late joiner needs before any other frame
    pub is_header: bool,
}

impl LiveFrame {
    pub fn video(timestamp: u32, data: Bytes, is_keyframe: bool, is_header: bool) -> Self {
        Self {
            kind: FrameKind::Video,
            timestamp,
            data,
            is_keyframe,
            is_header,
        }
    }

    pub fn audio(timestamp: u32, data: Bytes, is_header: bool) -> Self {
        Self {
            kind: FrameKind::Audio,
            timestamp,
            data,
            is_keyframe: false,
            is_header,
        }
    }

    pub fn metadata(data: Bytes) -> Self {
        Self {
            kind: FrameKind::Metadata,
            timestamp: 0,
            data,
            is_keyframe: false,
            is_header: false,
        }
    }
}
