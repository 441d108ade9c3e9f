//! Engine configuration
//!
//! Every struct has sensible defaults and builder-style setters. The whole
//! tree can also be read from YAML, with durations written in humantime
//! notation (`90s`, `2h`).

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::hub::HubConfig;
use crate::live::LiveConfig;

/// Idle-eviction settings for a [`TtlRegistry`](crate::cache::TtlRegistry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Entries idle for longer than this are evicted
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// How often the background sweep runs
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(2 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RegistryConfig {
    /// Set the idle time-to-live
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the sweep period
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Playback synchronization tuning
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Upper bound for the transit-time compensation a client may claim.
    /// Claimed differences are clamped into `[0, max_client_time_diff]`.
    #[serde(with = "humantime_serde")]
    pub max_client_time_diff: Duration,

    /// Drift beyond which a client's reported position is corrected
    #[serde(with = "humantime_serde")]
    pub check_status_tolerance: Duration,

    /// Maximum chat message length in characters
    pub max_chat_length: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_client_time_diff: Duration::from_millis(1500),
            check_status_tolerance: Duration::from_millis(1500),
            max_chat_length: 4096,
        }
    }
}

impl PlaybackConfig {
    /// Set the transit-time compensation clamp
    pub fn max_client_time_diff(mut self, diff: Duration) -> Self {
        self.max_client_time_diff = diff;
        self
    }

    /// Set the drift tolerance for status checks
    pub fn check_status_tolerance(mut self, tolerance: Duration) -> Self {
        self.check_status_tolerance = tolerance;
        self
    }

    /// Clamp a client-claimed transit time (seconds) into the allowed range
    pub fn clamp_time_diff(&self, diff: f64) -> f64 {
        if !diff.is_finite() {
            return 0.0;
        }
        diff.clamp(0.0, self.max_client_time_diff.as_secs_f64())
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Room registry eviction
    pub rooms: RegistryConfig,

    /// User registry eviction
    pub users: RegistryConfig,

    /// Hub queue sizes
    pub hub: HubConfig,

    /// Playback synchronization
    pub playback: PlaybackConfig,

    /// Live-stream channels
    pub live: LiveConfig,

    /// Maximum number of movies held by the movie-list cache across rooms
    pub movie_cache_capacity: u64,

    /// How long a looked-up room record is served from memory
    #[serde(with = "humantime_serde")]
    pub room_info_max_age: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rooms: RegistryConfig::default(),
            users: RegistryConfig::default().ttl(Duration::from_secs(60 * 60)),
            hub: HubConfig::default(),
            playback: PlaybackConfig::default(),
            live: LiveConfig::default(),
            movie_cache_capacity: 100_000,
            room_info_max_age: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Parse a YAML document; missing fields keep their defaults
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Err(Error::InvalidArgument("config document is empty".into()));
        }
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::InvalidArgument(format!("failed to parse config YAML: {e}")))
    }

    /// Set the room registry eviction settings
    pub fn rooms(mut self, rooms: RegistryConfig) -> Self {
        self.rooms = rooms;
        self
    }

    /// Set the user registry eviction settings
    pub fn users(mut self, users: RegistryConfig) -> Self {
        self.users = users;
        self
    }

    /// Set the hub queue sizes
    pub fn hub(mut self, hub: HubConfig) -> Self {
        self.hub = hub;
        self
    }

    /// Set the playback tuning
    pub fn playback(mut self, playback: PlaybackConfig) -> Self {
        self.playback = playback;
        self
    }

    /// Set the live channel settings
    pub fn live(mut self, live: LiveConfig) -> Self {
        self.live = live;
        self
    }

    /// Set the movie-list cache capacity
    pub fn movie_cache_capacity(mut self, capacity: u64) -> Self {
        self.movie_cache_capacity = capacity;
        self
    }
}
