//! Playback state machine
//!
//! A room's [`Current`] is the movie being played plus its [`Status`]. The
//! stored `current_time` is only exact as of `last_update`; the effective
//! position is `current_time + (now - last_update) * rate` while playing.
//!
//! Live movies have no seekable timeline and always report "playing at rate
//! 1.0 from offset 0", whatever the request asked for.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// The movie a room is currently playing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentMovie {
    /// Movie id; empty when nothing is selected
    pub id: String,
    /// Whether the movie is a live source
    pub is_live: bool,
}

impl CurrentMovie {
    /// A movie selection
    pub fn new(id: impl Into<String>, is_live: bool) -> Self {
        Self {
            id: id.into(),
            is_live,
        }
    }

    /// Whether no movie is selected
    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }
}

/// Play/pause/seek/rate state
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Status {
    /// Position in seconds as of `last_update`
    pub current_time: f64,
    /// Playback speed multiplier
    pub rate: f64,
    pub is_playing: bool,
    #[serde(skip, default = "Instant::now")]
    last_update: Instant,
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.current_time == other.current_time
            && self.rate == other.rate
            && self.is_playing == other.is_playing
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::paused_at(0.0)
    }
}

impl Status {
    fn paused_at(seek: f64) -> Self {
        Self {
            current_time: seek,
            rate: 1.0,
            is_playing: false,
            last_update: Instant::now(),
        }
    }

    fn live() -> Self {
        Self {
            current_time: 0.0,
            rate: 1.0,
            is_playing: true,
            last_update: Instant::now(),
        }
    }

    /// When the stored position was last brought up to date
    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    /// Position extrapolated to `now`
    pub fn effective_time(&self, now: Instant) -> f64 {
        if self.is_playing {
            let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
            self.current_time + elapsed * self.rate
        } else {
            self.current_time
        }
    }
}

/// Current movie plus its playback status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Current {
    pub movie: CurrentMovie,
    pub status: Status,
}

impl Current {
    /// Nothing selected, paused at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the current movie is live
    pub fn is_live(&self) -> bool {
        self.movie.is_live
    }

    /// Replace the current movie and restart playback from zero
    pub fn set_movie(&mut self, movie: CurrentMovie, autoplay: bool) {
        self.status = if movie.is_live {
            Status::live()
        } else {
            Status {
                is_playing: autoplay,
                ..Status::paused_at(0.0)
            }
        };
        self.movie = movie;
    }

    /// Apply a play/pause with position and rate
    ///
    /// `time_diff` is how long ago (seconds) the requester observed `seek`;
    /// when starting playback the position is moved forward by
    /// `time_diff * rate`. Pausing stores `seek` as is.
    pub fn set_status(&mut self, playing: bool, seek: f64, rate: f64, time_diff: f64) -> Status {
        if self.is_live() {
            self.status = Status::live();
            return self.status;
        }

        self.status.is_playing = playing;
        self.status.rate = rate;
        self.status.current_time = compensate(playing, seek, rate, time_diff);
        self.status.last_update = Instant::now();
        self.status
    }

    /// Apply a seek with a new rate, keeping play/pause
    pub fn set_seek_rate(&mut self, seek: f64, rate: f64, time_diff: f64) -> Status {
        if self.is_live() {
            self.status = Status::live();
            return self.status;
        }

        self.status.rate = rate;
        self.status.current_time = compensate(self.status.is_playing, seek, rate, time_diff);
        self.status.last_update = Instant::now();
        self.status
    }

    /// Apply a seek, keeping play/pause and rate
    pub fn set_seek(&mut self, seek: f64, time_diff: f64) -> Status {
        let rate = self.status.rate;
        self.set_seek_rate(seek, rate, time_diff)
    }

    /// Bring the stored position up to now and return a copy
    ///
    /// Playback intent is unchanged. Re-basing on every read keeps the stored
    /// position close to now instead of extrapolating further and further
    /// from an old baseline.
    pub fn snapshot(&mut self) -> Current {
        if !self.is_live() {
            let now = Instant::now();
            self.status.current_time = self.status.effective_time(now);
            self.status.last_update = now;
        }
        self.clone()
    }
}

fn compensate(playing: bool, seek: f64, rate: f64, time_diff: f64) -> f64 {
    if playing {
        seek + time_diff * rate
    } else {
        seek
    }
}
