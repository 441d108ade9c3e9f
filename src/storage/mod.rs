//! Persistence collaborator
//!
//! The engine reads rows at load time and writes them on every mutation; the
//! column layout belongs to the implementation. [`MemoryStorage`] keeps
//! everything in process and is what the tests run against.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::room::{Current, RoomSettings};
use crate::user::Permissions;

pub use memory::MemoryStorage;

/// Persisted room row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: String,
    pub name: String,
    /// `None` when the room has no password
    pub hashed_password: Option<String>,
    pub settings: RoomSettings,
    /// Credential version, bumped when issued credentials must stop working
    pub version: u32,
    /// Last persisted playback state
    pub current: Current,
}

/// Persisted room participant row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub room_id: String,
    pub name: String,
    pub hashed_password: Option<String>,
    pub permissions: Permissions,
    pub version: u32,
}

/// Playable description of a movie
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MovieBase {
    pub name: String,
    pub url: String,
    /// Container or protocol hint (`mp4`, `m3u8`, `flv`, ...)
    pub media_type: String,
    /// Live sources have no seekable timeline
    pub is_live: bool,
    /// Pushed into this server's own live-stream channel
    pub rtmp_source: bool,
    /// Extra request headers for fetching the media
    pub headers: BTreeMap<String, String>,
}

/// Persisted movie row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieRecord {
    pub id: String,
    pub room_id: String,
    /// Sort key within the room
    pub position: u64,
    pub creator_id: String,
    pub base: MovieBase,
}

/// Storage backend used by the engine
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Load a room; [`Error::RoomNotFound`](crate::Error::RoomNotFound) if absent
    async fn load_room(&self, room_id: &str) -> Result<RoomRecord>;

    /// Insert or replace a room
    async fn save_room(&self, room: &RoomRecord) -> Result<()>;

    /// Delete a room together with its movies and users
    async fn delete_room(&self, room_id: &str) -> Result<()>;

    /// Persist the playback state of a room
    async fn save_current(&self, room_id: &str, current: &Current) -> Result<()>;

    /// Load a user; [`Error::UserNotFound`](crate::Error::UserNotFound) if absent
    async fn load_user(&self, user_id: &str) -> Result<UserRecord>;

    /// Insert or replace a user
    async fn save_user(&self, user: &UserRecord) -> Result<()>;

    /// Delete a user
    async fn delete_user(&self, user_id: &str) -> Result<()>;

    /// All movies of a room, ordered by position
    async fn load_movies(&self, room_id: &str) -> Result<Vec<MovieRecord>>;

    /// Insert movies (all of the same room)
    async fn insert_movies(&self, movies: &[MovieRecord]) -> Result<()>;

    /// Delete movies by id
    async fn delete_movies(&self, room_id: &str, ids: &[String]) -> Result<()>;

    /// Exchange the positions of two movies
    async fn swap_movie_positions(&self, room_id: &str, a: &str, b: &str) -> Result<()>;

    /// Delete every movie of a room
    async fn clear_movies(&self, room_id: &str) -> Result<()>;
}
