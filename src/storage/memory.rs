//! In-process storage backend

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{MovieRecord, RoomRecord, Storage, UserRecord};
use crate::error::{Error, Result};
use crate::room::Current;

/// [`Storage`] kept in memory
///
/// Writes can be made to fail with [`fail_writes`](Self::fail_writes) or to
/// stall with [`write_delay`](Self::write_delay) to exercise error paths and
/// slow round trips.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    rooms: RwLock<HashMap<String, RoomRecord>>,
    users: RwLock<HashMap<String, UserRecord>>,
    movies: RwLock<HashMap<String, Vec<MovieRecord>>>,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Hold every subsequent write for `delay` before it is applied
    pub fn write_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.write_delay_ms.store(millis, Ordering::SeqCst);
    }

    async fn begin_write(&self) -> Result<()> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("writes are disabled".into()));
        }
        Ok(())
    }

    /// Number of stored rooms
    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_room(&self, room_id: &str) -> Result<RoomRecord> {
        self.rooms
            .read()
            .get(room_id)
            .cloned()
            .ok_or_else(|| Error::RoomNotFound(room_id.to_string()))
    }

    async fn save_room(&self, room: &RoomRecord) -> Result<()> {
        self.begin_write().await?;
        self.rooms.write().insert(room.id.clone(), room.clone());
        Ok(())
    }

    async fn delete_room(&self, room_id: &str) -> Result<()> {
        self.begin_write().await?;
        if self.rooms.write().remove(room_id).is_none() {
            return Err(Error::RoomNotFound(room_id.to_string()));
        }
        self.movies.write().remove(room_id);
        self.users.write().retain(|_, user| user.room_id != room_id);
        Ok(())
    }

    async fn save_current(&self, room_id: &str, current: &Current) -> Result<()> {
        self.begin_write().await?;
        let mut rooms = self.rooms.write();
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| Error::RoomNotFound(room_id.to_string()))?;
        room.current = current.clone();
        Ok(())
    }

    async fn load_user(&self, user_id: &str) -> Result<UserRecord> {
        self.users
            .read()
            .get(user_id)
            .cloned()
            .ok_or_else(|| Error::UserNotFound(user_id.to_string()))
    }

    async fn save_user(&self, user: &UserRecord) -> Result<()> {
        self.begin_write().await?;
        self.users.write().insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.begin_write().await?;
        self.users
            .write()
            .remove(user_id)
            .map(|_| ())
            .ok_or_else(|| Error::UserNotFound(user_id.to_string()))
    }

    async fn load_movies(&self, room_id: &str) -> Result<Vec<MovieRecord>> {
        let mut movies = self
            .movies
            .read()
            .get(room_id)
            .cloned()
            .unwrap_or_default();
        movies.sort_by_key(|m| m.position);
        Ok(movies)
    }

    async fn insert_movies(&self, movies: &[MovieRecord]) -> Result<()> {
        self.begin_write().await?;
        let mut stored = self.movies.write();
        for movie in movies {
            stored
                .entry(movie.room_id.clone())
                .or_default()
                .push(movie.clone());
        }
        Ok(())
    }

    async fn delete_movies(&self, room_id: &str, ids: &[String]) -> Result<()> {
        self.begin_write().await?;
        if let Some(movies) = self.movies.write().get_mut(room_id) {
            movies.retain(|m| !ids.contains(&m.id));
        }
        Ok(())
    }

    async fn swap_movie_positions(&self, room_id: &str, a: &str, b: &str) -> Result<()> {
        self.begin_write().await?;
        let mut stored = self.movies.write();
        let movies = stored
            .get_mut(room_id)
            .ok_or_else(|| Error::MovieNotFound(a.to_string()))?;

        let ia = movies
            .iter()
            .position(|m| m.id == a)
            .ok_or_else(|| Error::MovieNotFound(a.to_string()))?;
        let ib = movies
            .iter()
            .position(|m| m.id == b)
            .ok_or_else(|| Error::MovieNotFound(b.to_string()))?;

        let pa = movies[ia].position;
        movies[ia].position = movies[ib].position;
        movies[ib].position = pa;
        Ok(())
    }

    async fn clear_movies(&self, room_id: &str) -> Result<()> {
        self.begin_write().await?;
        self.movies.write().remove(room_id);
        Ok(())
    }
}
