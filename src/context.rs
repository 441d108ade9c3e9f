//! Process-scoped engine context
//!
//! [`SyncContext`] owns every registry and cache of the engine. One instance
//! is created at startup, shared as `Arc<SyncContext>` with the request layer,
//! and shut down explicitly; nothing here is a global.
//!
//! ```text
//!   request ──► authorize(creds) ──► load_or_init_room ──► rooms (TTL)
//!                                 └► load_or_init_user ──► users (TTL)
//!
//!   sweeper ──► rooms.sweep() ──► on_evict ──► Room::close()
//!                (rooms with connected viewers are kept)
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{KeyedCache, TtlRegistry};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::live::LiveRegistry;
use crate::room::{MovieCache, Room, RoomDeps, RoomSettings};
use crate::storage::{RoomRecord, Storage};
use crate::user::{Permissions, User};

/// What the request layer carries between calls to prove who it is
///
/// Only valid while both versions still match the live room and user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub room_id: String,
    pub user_id: String,
    pub room_version: u32,
    pub user_version: u32,
}

/// Engine context: registries, caches and shared collaborators
pub struct SyncContext {
    config: SyncConfig,
    deps: RoomDeps,
    rooms: Arc<TtlRegistry<Arc<Room>>>,
    users: Arc<TtlRegistry<Arc<User>>>,
    room_info: KeyedCache<String, Arc<RoomRecord>>,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncContext {
    /// Build the context; call [`start`](Self::start) to run eviction
    pub fn new(config: SyncConfig, storage: Arc<dyn Storage>) -> Self {
        let rooms = Arc::new(
            TtlRegistry::new(config.rooms)
                .on_evict(evict_room)
                .in_use(|room: &Arc<Room>| room.viewer_count() > 0),
        );
        let users = Arc::new(TtlRegistry::new(config.users));

        let deps = RoomDeps {
            movie_cache: Arc::new(MovieCache::new(
                Arc::clone(&storage),
                config.movie_cache_capacity,
            )),
            live: Arc::new(LiveRegistry::with_config(config.live.clone())),
            hub: config.hub,
            playback: config.playback,
            storage,
        };

        let room_info = {
            let storage = Arc::clone(&deps.storage);
            let rooms = Arc::clone(&rooms);
            KeyedCache::new(
                config.room_info_max_age,
                move |_ctx: CancellationToken, room_id: String, _: ()| {
                    let storage = Arc::clone(&storage);
                    let loaded = rooms.peek(&room_id);
                    async move {
                        let record = match loaded {
                            Some(room) => room.record().await,
                            None => storage.load_room(&room_id).await?,
                        };
                        Ok::<_, Error>(Arc::new(record))
                    }
                },
            )
        };

        Self {
            config,
            deps,
            rooms,
            users,
            room_info,
            sweepers: Mutex::new(Vec::new()),
        }
    }

    /// Get the engine configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The storage backend shared by every room
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.deps.storage
    }

    /// Live apps of all loaded rooms
    pub fn live(&self) -> &Arc<LiveRegistry> {
        &self.deps.live
    }

    /// Start the background eviction sweepers; later calls do nothing
    pub fn start(&self) {
        let mut sweepers = self.sweepers.lock();
        if !sweepers.is_empty() {
            return;
        }
        sweepers.push(self.rooms.spawn_sweeper());
        sweepers.push(self.users.spawn_sweeper());
        tracing::info!(
            room_ttl = ?self.config.rooms.ttl,
            user_ttl = ?self.config.users.ttl,
            "Sync context started"
        );
    }

    /// Stop the sweepers and close every loaded room
    pub async fn shutdown(&self) {
        let sweepers = std::mem::take(&mut *self.sweepers.lock());
        for sweeper in sweepers {
            sweeper.abort();
        }

        let rooms = self.rooms.drain();
        let count = rooms.len();
        for (_, room) in rooms {
            let _ = room.close().await;
        }
        self.users.drain();
        self.room_info.clear();

        tracing::info!(rooms = count, "Sync context shut down");
    }

    // Rooms

    /// Persist a new room and load it
    pub async fn create_room(
        &self,
        name: &str,
        password: Option<&str>,
        settings: RoomSettings,
    ) -> Result<Arc<Room>> {
        let record = Room::new_record(name, password, settings)?;
        self.deps.storage.save_room(&record).await?;

        let id = record.id.clone();
        let deps = &self.deps;
        let room = self
            .rooms
            .load_or_init(&id, || async move { Ok::<_, Error>(Room::load(record, deps).await) })
            .await?;

        tracing::info!(room = %id, "Room created");
        Ok(room)
    }

    /// The live room for `room_id`, loading it from storage on miss
    ///
    /// Concurrent misses for one id construct a single room.
    pub async fn load_or_init_room(&self, room_id: &str) -> Result<Arc<Room>> {
        let storage = &self.deps.storage;
        let deps = &self.deps;
        self.rooms
            .load_or_init(room_id, || async move {
                let record = storage.load_room(room_id).await?;
                Ok::<_, Error>(Room::load(record, deps).await)
            })
            .await
    }

    /// The room if it is currently loaded
    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(room_id)
    }

    /// Every loaded room
    pub fn loaded_rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.values()
    }

    /// Delete a room with its movies and users
    ///
    /// The loaded room is closed before this returns.
    pub async fn delete_room(&self, room_id: &str) -> Result<()> {
        self.deps.storage.delete_room(room_id).await?;
        self.room_info.remove(&room_id.to_string());

        if let Some(room) = self.rooms.delete(room_id) {
            let _ = room.close().await;
        }
        for user in self.users.values() {
            if user.room_id() == room_id {
                self.users.delete(user.id());
            }
        }

        tracing::info!(room = %room_id, "Room deleted");
        Ok(())
    }

    /// Room row, served from memory for up to `room_info_max_age`
    pub async fn room_info(
        &self,
        ctx: &CancellationToken,
        room_id: &str,
    ) -> Result<Arc<RoomRecord>> {
        self.room_info
            .load_or_store(ctx, &room_id.to_string(), ())
            .await
    }

    /// Set or remove a room's password and disconnect everyone in it
    pub async fn set_room_password(&self, room_id: &str, password: Option<&str>) -> Result<u32> {
        let room = self.load_or_init_room(room_id).await?;
        let version = room.set_password(password).await?;
        self.room_info.remove(&room_id.to_string());

        let mut user_ids: Vec<String> = room
            .hub()
            .clients()
            .iter()
            .map(|c| c.user_id().to_string())
            .collect();
        user_ids.sort();
        user_ids.dedup();
        for user_id in user_ids {
            room.kick_user(&user_id).await?;
        }
        Ok(version)
    }

    // Users

    /// Persist a new user in a room and load it
    pub async fn create_user(
        &self,
        room_id: &str,
        name: &str,
        password: Option<&str>,
        permissions: Permissions,
    ) -> Result<Arc<User>> {
        let room = self.load_or_init_room(room_id).await?;
        if room.settings().disable_join_new_user && !permissions.allows(Permissions::ADMIN) {
            return Err(Error::PermissionDenied);
        }

        let record = User::new_record(room.id(), name, password, permissions)?;
        self.deps.storage.save_user(&record).await?;

        let id = record.id.clone();
        let storage = Arc::clone(&self.deps.storage);
        let user = self
            .users
            .load_or_init(&id, || async move {
                Ok::<_, Error>(Arc::new(User::from_record(record, storage)))
            })
            .await?;

        tracing::info!(room = %room_id, user = %id, "User created");
        Ok(user)
    }

    /// The live user for `user_id`, loading it from storage on miss
    pub async fn load_or_init_user(&self, user_id: &str) -> Result<Arc<User>> {
        let storage = &self.deps.storage;
        self.users
            .load_or_init(user_id, || async move {
                let record = storage.load_user(user_id).await?;
                Ok::<_, Error>(Arc::new(User::from_record(record, Arc::clone(storage))))
            })
            .await
    }

    /// Delete a user and disconnect their clients
    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        let user = self.load_or_init_user(user_id).await?;
        self.deps.storage.delete_user(user_id).await?;
        self.users.delete(user_id);

        if let Some(room) = self.rooms.peek(user.room_id()) {
            room.kick_user(user_id).await?;
        }
        tracing::info!(user = %user_id, "User deleted");
        Ok(())
    }

    /// Change a user's password; their open connections are dropped
    pub async fn set_user_password(&self, user_id: &str, password: Option<&str>) -> Result<u32> {
        let user = self.load_or_init_user(user_id).await?;
        let version = user.set_password(password).await?;
        self.kick_everywhere(&user).await?;
        Ok(version)
    }

    /// Change a user's permissions; their open connections are dropped
    pub async fn set_user_permissions(
        &self,
        user_id: &str,
        permissions: Permissions,
    ) -> Result<u32> {
        let user = self.load_or_init_user(user_id).await?;
        let version = user.set_permissions(permissions).await?;
        self.kick_everywhere(&user).await?;
        Ok(version)
    }

    async fn kick_everywhere(&self, user: &User) -> Result<()> {
        if let Some(room) = self.rooms.peek(user.room_id()) {
            if !room.is_closed() {
                room.kick_user(user.id()).await?;
            }
        }
        Ok(())
    }

    // Credentials

    /// Log a user into their room
    ///
    /// `room_password` is only checked for non-admins of a protected room.
    pub async fn issue_credentials(
        &self,
        user_id: &str,
        user_password: &str,
        room_password: Option<&str>,
    ) -> Result<Credentials> {
        let user = self.load_or_init_user(user_id).await?;
        user.check_password(user_password)?;

        let room = self.load_or_init_room(user.room_id()).await?;
        if room.needs_password() && !user.has_permission(Permissions::ADMIN) {
            room.check_password(room_password.unwrap_or_default())?;
        }

        Ok(Credentials {
            room_id: room.id().to_string(),
            user_id: user.id().to_string(),
            room_version: room.version(),
            user_version: user.version(),
        })
    }

    /// Resolve credentials to the live room and user
    ///
    /// Fails with [`Error::StaleVersion`] once a password or permission
    /// change has bumped either version.
    pub async fn authorize(&self, credentials: &Credentials) -> Result<(Arc<Room>, Arc<User>)> {
        let room = self.load_or_init_room(&credentials.room_id).await?;
        let user = self.load_or_init_user(&credentials.user_id).await?;

        if user.room_id() != room.id() {
            return Err(Error::PermissionDenied);
        }
        room.check_version(credentials.room_version)?;
        user.check_version(credentials.user_version)?;
        Ok((room, user))
    }
}

fn evict_room(id: String, room: Arc<Room>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::error!(room = %id, "No runtime to close evicted room");
        return;
    };
    handle.spawn(async move {
        match room.close().await {
            Ok(()) => tracing::info!(room = %id, "Idle room evicted"),
            Err(e) => tracing::debug!(room = %id, error = %e, "Evicted room was already closed"),
        }
    });
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        for sweeper in self.sweepers.get_mut().drain(..) {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;
    use tokio::time;

    use super::*;
    use crate::config::RegistryConfig;
    use crate::storage::MemoryStorage;

    fn context() -> (SyncContext, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let config = SyncConfig::default().rooms(
            RegistryConfig::default()
                .ttl(Duration::from_secs(60))
                .sweep_interval(Duration::from_secs(10)),
        );
        (SyncContext::new(config, storage.clone()), storage)
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_room() {
        let (ctx, storage) = context();
        let record = Room::new_record("lobby", None, RoomSettings::default()).unwrap();
        storage.save_room(&record).await.unwrap();

        let rooms = join_all((0..16).map(|_| ctx.load_or_init_room(&record.id))).await;
        let first = rooms[0].as_ref().unwrap();
        for room in &rooms {
            assert!(Arc::ptr_eq(first, room.as_ref().unwrap()));
        }
        assert_eq!(ctx.loaded_rooms().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_room_is_not_cached() {
        let (ctx, _storage) = context();

        let err = ctx.load_or_init_room("nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(ctx.room("nope").is_none());
    }

    #[tokio::test]
    async fn test_credentials_invalidated_by_password_change() {
        let (ctx, _storage) = context();
        let room = ctx
            .create_room("lobby", Some("door"), RoomSettings::default())
            .await
            .unwrap();
        let user = ctx
            .create_user(room.id(), "bob", Some("pw"), Permissions::MEMBER)
            .await
            .unwrap();

        assert!(matches!(
            ctx.issue_credentials(user.id(), "pw", Some("wrong")).await,
            Err(Error::InvalidPassword)
        ));
        let creds = ctx
            .issue_credentials(user.id(), "pw", Some("door"))
            .await
            .unwrap();
        ctx.authorize(&creds).await.unwrap();

        ctx.set_room_password(room.id(), Some("new door")).await.unwrap();
        assert!(matches!(ctx.authorize(&creds).await, Err(Error::StaleVersion)));

        let creds = ctx
            .issue_credentials(user.id(), "pw", Some("new door"))
            .await
            .unwrap();
        ctx.set_user_permissions(user.id(), Permissions::ADMIN).await.unwrap();
        assert!(matches!(ctx.authorize(&creds).await, Err(Error::StaleVersion)));
    }

    #[tokio::test]
    async fn test_cross_room_credentials_rejected() {
        let (ctx, _storage) = context();
        let a = ctx.create_room("a", None, RoomSettings::default()).await.unwrap();
        let b = ctx.create_room("b", None, RoomSettings::default()).await.unwrap();
        let user = ctx
            .create_user(a.id(), "bob", None, Permissions::MEMBER)
            .await
            .unwrap();

        let creds = Credentials {
            room_id: b.id().to_string(),
            user_id: user.id().to_string(),
            room_version: b.version(),
            user_version: user.version(),
        };
        assert!(matches!(ctx.authorize(&creds).await, Err(Error::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_join_disabled() {
        let (ctx, _storage) = context();
        let settings = RoomSettings::default().disable_join_new_user(true);
        let room = ctx.create_room("closed club", None, settings).await.unwrap();

        assert!(matches!(
            ctx.create_user(room.id(), "eve", None, Permissions::MEMBER).await,
            Err(Error::PermissionDenied)
        ));
        ctx.create_user(room.id(), "owner", None, Permissions::ADMIN)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_room_closes_synchronously() {
        let (ctx, storage) = context();
        let room = ctx.create_room("lobby", None, RoomSettings::default()).await.unwrap();
        let user = ctx
            .create_user(room.id(), "bob", None, Permissions::MEMBER)
            .await
            .unwrap();

        ctx.delete_room(room.id()).await.unwrap();

        assert!(room.is_closed());
        assert!(room.hub().is_closed());
        assert!(ctx.room(room.id()).is_none());
        assert_eq!(storage.room_count(), 0);
        assert!(ctx.load_or_init_user(user.id()).await.unwrap_err().is_not_found());
        assert!(ctx.delete_room(room.id()).await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_room_evicted_and_closed() {
        let (ctx, _storage) = context();
        ctx.start();
        let room = ctx.create_room("lobby", None, RoomSettings::default()).await.unwrap();
        let id = room.id().to_string();

        time::sleep(Duration::from_secs(75)).await;

        assert!(room.is_closed());
        assert!(room.live_app().is_closed());
        assert!(ctx.room(&id).is_none());

        // A later request loads a fresh room
        let reloaded = ctx.load_or_init_room(&id).await.unwrap();
        assert!(!Arc::ptr_eq(&room, &reloaded));
        assert!(!reloaded.is_closed());
        ctx.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_eviction_close_spares_reloaded_room() {
        let (ctx, _storage) = context();
        let old = ctx.create_room("lobby", None, RoomSettings::default()).await.unwrap();
        let id = old.id().to_string();

        time::advance(Duration::from_secs(61)).await;
        assert_eq!(ctx.rooms.sweep(), 1);
        // The eviction close is spawned and has not run yet
        let fresh = ctx.load_or_init_room(&id).await.unwrap();
        time::sleep(Duration::from_millis(1)).await;

        assert!(old.is_closed());
        assert!(old.live_app().is_closed());
        assert!(!fresh.is_closed());
        assert!(!fresh.live_app().is_closed());

        let registered = ctx.live().app(&id).await.unwrap();
        assert!(Arc::ptr_eq(&registered, fresh.live_app()));
        fresh.live_app().register_publisher("main", 1).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_with_viewers_is_not_evicted() {
        let (ctx, _storage) = context();
        let room = ctx.create_room("lobby", None, RoomSettings::default()).await.unwrap();
        let user = ctx
            .create_user(room.id(), "bob", None, Permissions::MEMBER)
            .await
            .unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel::<bytes::Bytes>(64);
        let client = room.join(&user, tx).await.unwrap();

        time::advance(Duration::from_secs(61)).await;
        assert_eq!(ctx.rooms.sweep(), 0);
        assert!(!room.is_closed());

        room.leave(client.id()).await.unwrap();
        time::advance(Duration::from_secs(61)).await;
        assert_eq!(ctx.rooms.sweep(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_info_is_cached() {
        let (ctx, storage) = context();
        let room = ctx.create_room("lobby", None, RoomSettings::default()).await.unwrap();
        let token = CancellationToken::new();

        let info = ctx.room_info(&token, room.id()).await.unwrap();
        assert_eq!(info.name, "lobby");

        let mut renamed = storage.load_room(room.id()).await.unwrap();
        renamed.name = "renamed".into();
        storage.save_room(&renamed).await.unwrap();
        ctx.rooms.delete(room.id());

        assert_eq!(ctx.room_info(&token, room.id()).await.unwrap().name, "lobby");
        time::advance(Duration::from_secs(31)).await;
        assert_eq!(ctx.room_info(&token, room.id()).await.unwrap().name, "renamed");
    }

    #[tokio::test]
    async fn test_shutdown_closes_rooms() {
        let (ctx, _storage) = context();
        ctx.start();
        let a = ctx.create_room("a", None, RoomSettings::default()).await.unwrap();
        let b = ctx.create_room("b", None, RoomSettings::default()).await.unwrap();

        ctx.shutdown().await;

        assert!(a.is_closed() && b.is_closed());
        assert!(ctx.loaded_rooms().is_empty());
    }
}
