//! A live room
//!
//! [`Room`] glues together one [`Hub`], the playback [`Current`], the
//! [`MovieList`] and the room's live app. Every mutation is written to storage
//! first and committed in memory only when that succeeds; the resulting change
//! is then broadcast to the room.
//!
//! Lock order: `update_lock` → `current`. The settings/password state sits
//! behind a short synchronous lock that is never held across an await.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use super::current::{Current, CurrentMovie, Status};
use super::movies::{MovieCache, MovieList};
use super::settings::RoomSettings;
use crate::auth;
use crate::config::PlaybackConfig;
use crate::error::{Error, Result};
use crate::hub::{
    run_writer, BroadcastOptions, Client, ClientId, Hub, HubConfig, HubError, InboundMessage,
    MessageSink, OutboundMessage,
};
use crate::live::{LiveApp, LiveRegistry};
use crate::storage::{MovieBase, MovieRecord, RoomRecord, Storage};
use crate::user::{Permissions, User};

/// Shared collaborators every room is built with
#[derive(Clone)]
pub struct RoomDeps {
    pub storage: Arc<dyn Storage>,
    pub movie_cache: Arc<MovieCache>,
    pub live: Arc<LiveRegistry>,
    pub hub: HubConfig,
    pub playback: PlaybackConfig,
}

struct RoomState {
    name: String,
    hashed_password: Option<String>,
    settings: RoomSettings,
    version: u32,
}

/// One synchronized viewing session
pub struct Room {
    id: String,
    state: RwLock<RoomState>,
    /// Serializes writers of `state` across the storage await
    update_lock: Mutex<()>,
    current: Mutex<Current>,
    hub: Arc<Hub>,
    movies: MovieList,
    live: Arc<LiveApp>,
    live_registry: Arc<LiveRegistry>,
    storage: Arc<dyn Storage>,
    playback: PlaybackConfig,
    closed: AtomicBool,
}

impl Room {
    /// Build a fresh record with a generated id
    pub fn new_record(
        name: &str,
        password: Option<&str>,
        settings: RoomSettings,
    ) -> Result<RoomRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidArgument("room name is empty".into()));
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        Ok(RoomRecord {
            hashed_password: password.map(|pw| auth::hash_password(&id, pw)),
            id,
            name: name.to_string(),
            settings,
            version: 1,
            current: Current::new(),
        })
    }

    /// Bring a loaded record to life with a new hub and live app
    ///
    /// The persisted playback state is restored as saved.
    pub async fn load(record: RoomRecord, deps: &RoomDeps) -> Arc<Self> {
        let hub = Hub::new(record.id.clone(), deps.hub);
        let live = deps.live.new_app(&record.id).await;
        let movies = MovieList::new(
            record.id.clone(),
            Arc::clone(&deps.storage),
            Arc::clone(&deps.movie_cache),
        );

        tracing::info!(room = %record.id, name = %record.name, "Room loaded");

        Arc::new(Self {
            id: record.id,
            state: RwLock::new(RoomState {
                name: record.name,
                hashed_password: record.hashed_password,
                settings: record.settings,
                version: record.version,
            }),
            update_lock: Mutex::new(()),
            current: Mutex::new(record.current),
            hub,
            movies,
            live,
            live_registry: Arc::clone(&deps.live),
            storage: Arc::clone(&deps.storage),
            playback: deps.playback,
            closed: AtomicBool::new(false),
        })
    }

    /// Get the room id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the display name
    pub fn name(&self) -> String {
        self.state.read().name.clone()
    }

    /// The broadcast bus of connected clients
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// The room's playlist
    pub fn movies(&self) -> &MovieList {
        &self.movies
    }

    /// The room's live-stream channels
    pub fn live_app(&self) -> &Arc<LiveApp> {
        &self.live
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(HubError::Closed.into());
        }
        Ok(())
    }

    // Credentials

    /// Credential version; bumped by every password change
    pub fn version(&self) -> u32 {
        self.state.read().version
    }

    /// Fail with [`Error::StaleVersion`] unless `version` is current
    pub fn check_version(&self, version: u32) -> Result<()> {
        if self.version() == version {
            Ok(())
        } else {
            Err(Error::StaleVersion)
        }
    }

    /// Whether joining requires the room password
    pub fn needs_password(&self) -> bool {
        self.state.read().hashed_password.is_some()
    }

    /// Fail with [`Error::InvalidPassword`] unless `password` matches
    ///
    /// A room without a password accepts anything.
    pub fn check_password(&self, password: &str) -> Result<()> {
        let state = self.state.read();
        if auth::verify_password(&self.id, state.hashed_password.as_deref(), password) {
            Ok(())
        } else {
            Err(Error::InvalidPassword)
        }
    }

    /// Set or remove the password; returns the new version
    ///
    /// Credentials issued against the old version stop working.
    pub async fn set_password(&self, password: Option<&str>) -> Result<u32> {
        let hashed = password.map(|pw| auth::hash_password(&self.id, pw));
        let version = self
            .update(|state| {
                state.hashed_password = hashed;
                state.version = state.version.wrapping_add(1);
            })
            .await?;

        tracing::info!(room = %self.id, version, "Room password changed");
        Ok(version)
    }

    /// Get a copy of the settings
    pub fn settings(&self) -> RoomSettings {
        self.state.read().settings.clone()
    }

    /// Replace the settings and tell every client
    pub async fn update_settings(&self, settings: RoomSettings) -> Result<()> {
        self.check_open()?;
        let broadcast = settings.clone();
        self.update(|state| state.settings = settings).await?;

        self.notify(
            OutboundMessage::Settings { settings: broadcast },
            BroadcastOptions::new(),
        )
        .await;
        Ok(())
    }

    /// Snapshot as a storage row
    pub async fn record(&self) -> RoomRecord {
        let current = self.current.lock().await.clone();
        let state = self.state.read();
        RoomRecord {
            id: self.id.clone(),
            name: state.name.clone(),
            hashed_password: state.hashed_password.clone(),
            settings: state.settings.clone(),
            version: state.version,
            current,
        }
    }

    /// Persist a changed copy of the state, then commit it
    async fn update<F>(&self, change: F) -> Result<u32>
    where
        F: FnOnce(&mut RoomState),
    {
        let _guard = self.update_lock.lock().await;
        // Held so the saved row cannot carry a playback state older than memory
        let current = self.current.lock().await;

        let mut staged = {
            let state = self.state.read();
            RoomState {
                name: state.name.clone(),
                hashed_password: state.hashed_password.clone(),
                settings: state.settings.clone(),
                version: state.version,
            }
        };
        change(&mut staged);
        let next = RoomRecord {
            id: self.id.clone(),
            name: staged.name.clone(),
            hashed_password: staged.hashed_password.clone(),
            settings: staged.settings.clone(),
            version: staged.version,
            current: current.clone(),
        };

        self.storage.save_room(&next).await?;

        let version = staged.version;
        *self.state.write() = staged;
        Ok(version)
    }

    // Playback

    /// Current movie and status, rolled forward to now
    pub async fn current(&self) -> Current {
        self.current.lock().await.snapshot()
    }

    /// Play/pause with position and rate, broadcast to everyone
    pub async fn set_status(
        &self,
        playing: bool,
        seek: f64,
        rate: f64,
        time_diff: f64,
    ) -> Result<Status> {
        self.apply_status(
            BroadcastOptions::new(),
            |current, diff| current.set_status(playing, seek, rate, diff),
            seek,
            rate,
            time_diff,
        )
        .await
    }

    /// Seek and change rate, keeping play/pause
    pub async fn set_seek_rate(&self, seek: f64, rate: f64, time_diff: f64) -> Result<Status> {
        self.apply_status(
            BroadcastOptions::new(),
            |current, diff| current.set_seek_rate(seek, rate, diff),
            seek,
            rate,
            time_diff,
        )
        .await
    }

    /// Seek, keeping play/pause and rate
    pub async fn set_seek(&self, seek: f64, time_diff: f64) -> Result<Status> {
        self.apply_status(
            BroadcastOptions::new(),
            |current, diff| current.set_seek(seek, diff),
            seek,
            1.0,
            time_diff,
        )
        .await
    }

    async fn apply_status<F>(
        &self,
        options: BroadcastOptions,
        transition: F,
        seek: f64,
        rate: f64,
        time_diff: f64,
    ) -> Result<Status>
    where
        F: FnOnce(&mut Current, f64) -> Status,
    {
        self.check_open()?;
        if !seek.is_finite() || seek < 0.0 {
            return Err(Error::InvalidArgument(format!("invalid seek: {seek}")));
        }
        if !rate.is_finite() || rate <= 0.0 {
            return Err(Error::InvalidArgument(format!("invalid rate: {rate}")));
        }
        let diff = self.playback.clamp_time_diff(time_diff);

        let mut current = self.current.lock().await;
        let mut next = current.clone();
        let status = transition(&mut next, diff);

        self.storage.save_current(&self.id, &next).await?;
        *current = next;

        tracing::debug!(
            room = %self.id,
            playing = status.is_playing,
            time = status.current_time,
            rate = status.rate,
            "Status changed"
        );
        // Broadcast under the lock so clients see changes in commit order
        self.notify(OutboundMessage::Status { status }, options).await;
        Ok(status)
    }

    /// Switch to a movie of this room's list and restart playback
    pub async fn set_current_movie(&self, movie_id: &str, autoplay: bool) -> Result<Current> {
        self.check_open()?;
        let movie = self.movies.get(movie_id).await?;
        self.replace_current(
            Some(CurrentMovie::new(movie.id.clone(), movie.base.is_live)),
            autoplay,
        )
        .await
    }

    /// Deselect the current movie
    pub async fn clear_current_movie(&self) -> Result<Current> {
        self.check_open()?;
        self.replace_current(None, false).await
    }

    async fn replace_current(
        &self,
        movie: Option<CurrentMovie>,
        autoplay: bool,
    ) -> Result<Current> {
        let mut current = self.current.lock().await;
        let next = match movie {
            Some(movie) => {
                let mut next = current.clone();
                next.set_movie(movie, autoplay);
                next
            }
            None => Current::new(),
        };

        self.storage.save_current(&self.id, &next).await?;
        *current = next.clone();

        tracing::info!(room = %self.id, movie = %next.movie.id, "Current movie changed");
        self.notify(
            OutboundMessage::Current {
                current: next.clone(),
            },
            BroadcastOptions::new(),
        )
        .await;
        Ok(next)
    }

    // Movies

    /// Append one movie and tell every client the new count
    pub async fn add_movie(&self, creator_id: &str, base: MovieBase) -> Result<Arc<MovieRecord>> {
        self.check_open()?;
        let movie = self.movies.add(creator_id, base).await?;
        self.notify_movies().await;
        Ok(movie)
    }

    /// Append movies in order and tell every client the new count
    pub async fn add_movies(
        &self,
        creator_id: &str,
        bases: Vec<MovieBase>,
    ) -> Result<Vec<Arc<MovieRecord>>> {
        self.check_open()?;
        let movies = self.movies.add_many(creator_id, bases).await?;
        self.notify_movies().await;
        Ok(movies)
    }

    /// Look up a movie by id
    pub async fn get_movie(&self, id: &str) -> Result<Arc<MovieRecord>> {
        self.movies.get(id).await
    }

    /// One page of movies plus the total count; `page` starts at 1
    pub async fn movies_page(
        &self,
        page: usize,
        size: usize,
    ) -> Result<(usize, Vec<Arc<MovieRecord>>)> {
        self.movies.page(page, size).await
    }

    /// Number of movies in the playlist
    pub async fn movie_count(&self) -> Result<usize> {
        self.movies.len().await
    }

    /// Delete movies; resets the current movie if it was among them
    pub async fn delete_movies(&self, ids: &[String]) -> Result<()> {
        self.check_open()?;
        let mut live_channels = Vec::new();
        for id in ids {
            let movie = self.movies.get(id).await?;
            if movie.base.rtmp_source {
                live_channels.push(movie.id.clone());
            }
        }

        self.movies.delete(ids).await?;
        for channel in live_channels {
            self.live.remove_channel(&channel).await;
        }

        let current_id = self.current.lock().await.movie.id.clone();
        if ids.contains(&current_id) {
            self.replace_current(None, false).await?;
        }
        self.notify_movies().await;
        Ok(())
    }

    /// Exchange the positions of two movies
    pub async fn swap_movies(&self, a: &str, b: &str) -> Result<()> {
        self.check_open()?;
        self.movies.swap(a, b).await?;
        self.notify_movies().await;
        Ok(())
    }

    /// Delete every movie and reset the current movie
    pub async fn clear_movies(&self) -> Result<()> {
        self.check_open()?;
        let live_channels: Vec<_> = self
            .movies
            .all()
            .await?
            .iter()
            .filter(|m| m.base.rtmp_source)
            .map(|m| m.id.clone())
            .collect();

        self.movies.clear().await?;
        for channel in live_channels {
            self.live.remove_channel(&channel).await;
        }

        let has_current = !self.current.lock().await.movie.is_empty();
        if has_current {
            self.replace_current(None, false).await?;
        }
        self.notify_movies().await;
        Ok(())
    }

    async fn notify_movies(&self) {
        match self.movies.len().await {
            Ok(count) => {
                self.notify(OutboundMessage::Movies { count }, BroadcastOptions::new())
                    .await
            }
            Err(e) => tracing::warn!(room = %self.id, error = %e, "Failed to count movies"),
        }
    }

    // Connections

    /// Connect one of `user`'s sockets to the room
    ///
    /// Spawns the client's writer onto `sink`, sends the client the current
    /// state and broadcasts the new viewer count.
    pub async fn join<S>(&self, user: &User, sink: S) -> Result<Arc<Client>>
    where
        S: MessageSink + 'static,
    {
        self.check_open()?;
        if user.room_id() != self.id {
            return Err(Error::PermissionDenied);
        }
        if !self.settings().has_room_for(self.hub.client_count()) {
            return Err(Error::RoomFull);
        }

        let (client, outbox) = self.hub.new_client(user.id(), user.name());
        self.hub.register_client(Arc::clone(&client))?;
        tokio::spawn(run_writer(Arc::clone(&client), outbox, sink));

        let current = self.current().await;
        client.send(OutboundMessage::Current { current }).await?;
        self.notify_viewer_count().await;

        tracing::debug!(room = %self.id, user = %user.id(), client_id = client.id(), "User joined");
        Ok(client)
    }

    /// Disconnect a client; returns whether it was connected
    pub async fn leave(&self, client_id: ClientId) -> Result<bool> {
        let removed = self.hub.unregister_client(client_id)?;
        if removed.is_some() {
            self.notify_viewer_count().await;
        }
        Ok(removed.is_some())
    }

    /// Number of connected clients
    pub fn viewer_count(&self) -> usize {
        self.hub.client_count()
    }

    async fn notify_viewer_count(&self) {
        let count = self.hub.client_count();
        self.notify(OutboundMessage::ViewerCount { count }, BroadcastOptions::new())
            .await;
    }

    /// Tell every client of a user that their credential expired, then
    /// disconnect them; returns how many clients were dropped
    pub async fn kick_user(&self, user_id: &str) -> Result<usize> {
        self.check_open()?;
        self.hub.send_to_user(user_id, OutboundMessage::Expired).await?;

        let mut kicked = 0;
        for client in self.hub.user_clients(user_id) {
            if self.hub.unregister_client(client.id())?.is_some() {
                kicked += 1;
            }
        }
        if kicked > 0 {
            self.notify_viewer_count().await;
            tracing::info!(room = %self.id, user = %user_id, clients = kicked, "User kicked");
        }
        Ok(kicked)
    }

    // Inbound messages

    /// Post a chat line to everyone, the sender included
    pub async fn send_chat(
        &self,
        user: &User,
        sender: Option<ClientId>,
        message: &str,
    ) -> Result<()> {
        self.check_open()?;
        user.require(Permissions::SEND_CHAT)?;
        if !self.settings().can_send_chat && !user.has_permission(Permissions::ADMIN) {
            return Err(Error::PermissionDenied);
        }

        let message = message.trim();
        if message.is_empty() {
            return Err(Error::InvalidArgument("chat message is empty".into()));
        }
        if message.chars().count() > self.playback.max_chat_length {
            return Err(Error::InvalidArgument("chat message is too long".into()));
        }

        let options = match sender {
            Some(id) => BroadcastOptions::from_sender(id).include_self(),
            None => BroadcastOptions::new(),
        };
        let chat = OutboundMessage::chat(user.id(), user.name(), message);
        self.hub.broadcast(chat, options).await?;
        Ok(())
    }

    /// Act on one message from a connected client
    pub async fn handle_message(
        &self,
        client: &Client,
        user: &User,
        message: InboundMessage,
    ) -> Result<()> {
        match message {
            InboundMessage::Chat { message } => {
                self.send_chat(user, Some(client.id()), &message).await
            }
            InboundMessage::Status {
                is_playing,
                current_time,
                rate,
                time_diff,
            } => {
                user.require(Permissions::SET_STATUS)?;
                self.apply_status(
                    BroadcastOptions::from_sender(client.id()),
                    |current, diff| current.set_status(is_playing, current_time, rate, diff),
                    current_time,
                    rate,
                    time_diff,
                )
                .await
                .map(|_| ())
            }
            InboundMessage::CheckStatus {
                is_playing,
                current_time,
                rate,
                time_diff,
            } => {
                let current = self.current().await;
                let diff = self.playback.clamp_time_diff(time_diff);
                let reported = if is_playing {
                    current_time + diff * rate
                } else {
                    current_time
                };
                let status = current.status;
                let drifted = !current.is_live()
                    && (reported - status.current_time).abs()
                        > self.playback.check_status_tolerance.as_secs_f64();

                if is_playing != status.is_playing || rate != status.rate || drifted {
                    client.send(OutboundMessage::Status { status }).await?;
                }
                Ok(())
            }
            InboundMessage::Sync => {
                let current = self.current().await;
                client.send(OutboundMessage::Current { current }).await?;
                Ok(())
            }
        }
    }

    /// Decode and act on one raw frame, replying with an error message on
    /// failure
    pub async fn handle_frame(&self, client: &Client, user: &User, frame: &[u8]) -> Result<()> {
        let result = match InboundMessage::decode(frame) {
            Ok(message) => self.handle_message(client, user, message).await,
            Err(e) => Err(e),
        };

        if let Err(ref e) = result {
            if !e.is_closed() {
                let _ = client.send(OutboundMessage::error(e.to_string())).await;
            }
        }
        result
    }

    async fn notify(&self, message: OutboundMessage, options: BroadcastOptions) {
        let kind = message.kind();
        if let Err(e) = self.hub.broadcast(message, options).await {
            tracing::debug!(room = %self.id, kind, error = %e, "Broadcast dropped");
        }
    }

    /// Close the hub and live app and drop the cached movie list
    ///
    /// Only the first call succeeds.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(HubError::Closed.into());
        }

        let _ = self.hub.close();
        self.live_registry.release_app(&self.id, &self.live).await;
        self.movies.invalidate().await;

        tracing::info!(room = %self.id, "Room closed");
        Ok(())
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("version", &self.version())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::*;
    use crate::storage::MemoryStorage;

    struct Fixture {
        storage: Arc<MemoryStorage>,
        deps: RoomDeps,
    }

    impl Fixture {
        fn new() -> Self {
            let storage = Arc::new(MemoryStorage::new());
            let dyn_storage: Arc<dyn Storage> = storage.clone();
            let deps = RoomDeps {
                movie_cache: Arc::new(MovieCache::new(Arc::clone(&dyn_storage), 1_000)),
                storage: dyn_storage,
                live: Arc::new(LiveRegistry::new()),
                hub: HubConfig::default(),
                playback: PlaybackConfig::default(),
            };
            Self { storage, deps }
        }

        async fn room(&self, settings: RoomSettings) -> Arc<Room> {
            let record = Room::new_record("movie night", Some("pw"), settings).unwrap();
            self.storage.save_room(&record).await.unwrap();
            Room::load(record, &self.deps).await
        }

        async fn user(&self, room: &Room, permissions: Permissions) -> User {
            let record = User::new_record(room.id(), "alice", None, permissions).unwrap();
            self.storage.save_user(&record).await.unwrap();
            User::from_record(record, self.deps.storage.clone())
        }
    }

    fn movie(name: &str) -> MovieBase {
        MovieBase {
            name: name.to_string(),
            url: format!("https://cdn.example/{name}.mp4"),
            ..Default::default()
        }
    }

    async fn next_json(frames: &mut mpsc::Receiver<Bytes>) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    /// Skip frames until one of type `kind` arrives
    async fn next_of(frames: &mut mpsc::Receiver<Bytes>, kind: &str) -> Value {
        loop {
            let value = next_json(frames).await;
            if value["type"] == kind {
                return value;
            }
        }
    }

    #[tokio::test]
    async fn test_password_change_invalidates_version() {
        let fx = Fixture::new();
        let room = fx.room(RoomSettings::default()).await;
        let old = room.version();

        assert!(room.needs_password());
        room.check_password("pw").unwrap();

        let new = room.set_password(Some("next")).await.unwrap();
        assert!(matches!(room.check_version(old), Err(Error::StaleVersion)));
        room.check_version(new).unwrap();
        assert!(matches!(room.check_password("pw"), Err(Error::InvalidPassword)));

        room.set_password(None).await.unwrap();
        assert!(!room.needs_password());
        assert_eq!(fx.storage.load_room(room.id()).await.unwrap().version, new + 1);
    }

    #[tokio::test]
    async fn test_status_persisted_and_broadcast() {
        let fx = Fixture::new();
        let room = fx.room(RoomSettings::default()).await;
        let user = fx.user(&room, Permissions::MEMBER).await;
        let (sink, mut frames) = mpsc::channel(16);
        room.join(&user, sink).await.unwrap();

        let m = room.add_movie(user.id(), movie("a")).await.unwrap();
        room.set_current_movie(&m.id, false).await.unwrap();
        let status = room.set_status(true, 100.0, 1.0, 0.5).await.unwrap();
        assert_eq!(status.current_time, 100.5);

        let value = next_of(&mut frames, "status").await;
        assert_eq!(value["status"]["is_playing"], json!(true));

        let saved = fx.storage.load_room(room.id()).await.unwrap();
        assert_eq!(saved.current.movie.id, m.id);
        assert!(saved.current.status.is_playing);
    }

    #[tokio::test]
    async fn test_time_diff_is_clamped() {
        let fx = Fixture::new();
        let room = fx.room(RoomSettings::default()).await;
        let m = room.add_movie("u1", movie("a")).await.unwrap();
        room.set_current_movie(&m.id, false).await.unwrap();

        let status = room.set_status(true, 10.0, 1.0, 60.0).await.unwrap();
        assert_eq!(status.current_time, 11.5);
        let status = room.set_status(true, 10.0, 1.0, -3.0).await.unwrap();
        assert_eq!(status.current_time, 10.0);

        assert!(matches!(
            room.set_status(true, f64::NAN, 1.0, 0.0).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            room.set_seek_rate(1.0, 0.0, 0.0).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_state() {
        let fx = Fixture::new();
        let room = fx.room(RoomSettings::default()).await;
        let m = room.add_movie("u1", movie("a")).await.unwrap();
        room.set_current_movie(&m.id, false).await.unwrap();

        fx.storage.fail_writes(true);
        assert!(room.set_status(true, 50.0, 1.0, 0.0).await.is_err());
        assert!(room.set_password(Some("x")).await.is_err());

        let current = room.current().await;
        assert!(!current.status.is_playing);
        assert_eq!(current.status.current_time, 0.0);
        room.check_password("pw").unwrap();
    }

    #[tokio::test]
    async fn test_deleting_current_movie_resets_current() {
        let fx = Fixture::new();
        let room = fx.room(RoomSettings::default()).await;
        let added = room
            .add_movies("u1", vec![movie("a"), movie("b")])
            .await
            .unwrap();
        room.set_current_movie(&added[0].id, true).await.unwrap();

        room.delete_movies(&[added[1].id.clone()]).await.unwrap();
        assert_eq!(room.current().await.movie.id, added[0].id);

        room.delete_movies(&[added[0].id.clone()]).await.unwrap();
        let current = room.current().await;
        assert!(current.movie.is_empty());
        assert!(!current.status.is_playing);
        assert_eq!(room.movie_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_live_movie_overrides_status() {
        let fx = Fixture::new();
        let room = fx.room(RoomSettings::default()).await;
        let live = MovieBase {
            name: "stream".into(),
            is_live: true,
            rtmp_source: true,
            ..Default::default()
        };
        let m = room.add_movie("u1", live).await.unwrap();
        room.set_current_movie(&m.id, false).await.unwrap();

        let status = room.set_status(false, 30.0, 2.0, 0.0).await.unwrap();
        assert!(status.is_playing);
        assert_eq!(status.rate, 1.0);
        assert_eq!(status.current_time, 0.0);

        room.live_app().register_publisher(&m.id, 7).await.unwrap();
        room.delete_movies(&[m.id.clone()]).await.unwrap();
        assert_eq!(room.live_app().channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_chat_includes_sender() {
        let fx = Fixture::new();
        let room = fx.room(RoomSettings::default()).await;
        let user = fx.user(&room, Permissions::MEMBER).await;
        let (sink, mut frames) = mpsc::channel(16);
        let client = room.join(&user, sink).await.unwrap();

        room.handle_message(&client, &user, InboundMessage::Chat { message: " hi ".into() })
            .await
            .unwrap();

        let chat = next_of(&mut frames, "chat").await;
        assert_eq!(chat["message"], json!("hi"));
        assert_eq!(chat["sender"], json!("alice"));
    }

    #[tokio::test]
    async fn test_chat_rules() {
        let fx = Fixture::new();
        let room = fx.room(RoomSettings::default().can_send_chat(false)).await;
        let member = fx.user(&room, Permissions::MEMBER).await;
        let muted = fx.user(&room, Permissions::GET_MOVIE_LIST).await;
        let admin = fx.user(&room, Permissions::ADMIN).await;

        assert!(matches!(
            room.send_chat(&member, None, "hi").await,
            Err(Error::PermissionDenied)
        ));
        assert!(matches!(
            room.send_chat(&muted, None, "hi").await,
            Err(Error::PermissionDenied)
        ));
        room.send_chat(&admin, None, "hi").await.unwrap();

        let long = "x".repeat(4097);
        assert!(matches!(
            room.send_chat(&admin, None, &long).await,
            Err(Error::InvalidArgument(_))
        ));
        room.send_chat(&admin, None, &"é".repeat(4096)).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_message_needs_permission() {
        let fx = Fixture::new();
        let room = fx.room(RoomSettings::default()).await;
        let viewer = fx.user(&room, Permissions::GET_MOVIE_LIST).await;
        let (sink, _frames) = mpsc::channel(16);
        let client = room.join(&viewer, sink).await.unwrap();

        let message = InboundMessage::Status {
            is_playing: true,
            current_time: 5.0,
            rate: 1.0,
            time_diff: 0.0,
        };
        let err = room.handle_message(&client, &viewer, message).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied));
    }

    #[tokio::test]
    async fn test_check_status_replies_only_on_drift() {
        let fx = Fixture::new();
        let room = fx.room(RoomSettings::default()).await;
        let user = fx.user(&room, Permissions::MEMBER).await;

        let m = room.add_movie(user.id(), movie("a")).await.unwrap();
        room.set_current_movie(&m.id, false).await.unwrap();
        room.set_status(false, 40.0, 1.0, 0.0).await.unwrap();
        // Let the setup broadcasts drain before anyone is connected
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (sink, mut frames) = mpsc::channel(16);
        let client = room.join(&user, sink).await.unwrap();

        let in_sync = InboundMessage::CheckStatus {
            is_playing: false,
            current_time: 40.5,
            rate: 1.0,
            time_diff: 0.0,
        };
        room.handle_message(&client, &user, in_sync).await.unwrap();

        let drifted = InboundMessage::CheckStatus {
            is_playing: false,
            current_time: 10.0,
            rate: 1.0,
            time_diff: 0.0,
        };
        room.handle_message(&client, &user, drifted).await.unwrap();
        room.handle_message(&client, &user, InboundMessage::Sync).await.unwrap();

        // Join sends one current, the sync reply another
        let (mut statuses, mut currents) = (0, 0);
        while currents < 2 {
            let value = next_json(&mut frames).await;
            match value["type"].as_str() {
                Some("status") => {
                    assert_eq!(value["status"]["current_time"], json!(40.0));
                    statuses += 1;
                }
                Some("current") => currents += 1,
                _ => {}
            }
        }
        assert_eq!(statuses, 1);
    }

    #[tokio::test]
    async fn test_bad_frame_gets_error_reply() {
        let fx = Fixture::new();
        let room = fx.room(RoomSettings::default()).await;
        let user = fx.user(&room, Permissions::MEMBER).await;
        let (sink, mut frames) = mpsc::channel(16);
        let client = room.join(&user, sink).await.unwrap();

        assert!(room.handle_frame(&client, &user, b"{\"type\":\"nope\"}").await.is_err());
        let value = next_of(&mut frames, "error").await;
        assert!(value["message"].as_str().unwrap().contains("encoding"));
    }

    #[tokio::test]
    async fn test_max_viewers() {
        let fx = Fixture::new();
        let room = fx.room(RoomSettings::default().max_viewers(1)).await;
        let user = fx.user(&room, Permissions::MEMBER).await;

        let (sink, _a) = mpsc::channel(16);
        let client = room.join(&user, sink).await.unwrap();
        let (sink, _b) = mpsc::channel(16);
        assert!(matches!(room.join(&user, sink).await, Err(Error::RoomFull)));

        assert!(room.leave(client.id()).await.unwrap());
        assert!(!room.leave(client.id()).await.unwrap());
        let (sink, _c) = mpsc::channel(16);
        room.join(&user, sink).await.unwrap();
    }

    #[tokio::test]
    async fn test_kick_user_sends_expired() {
        let fx = Fixture::new();
        let room = fx.room(RoomSettings::default()).await;
        let user = fx.user(&room, Permissions::MEMBER).await;
        let (sink, mut frames) = mpsc::channel(16);
        let client = room.join(&user, sink).await.unwrap();

        assert_eq!(room.kick_user(user.id()).await.unwrap(), 1);
        next_of(&mut frames, "expired").await;
        assert!(client.is_closed());
        assert_eq!(room.viewer_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let fx = Fixture::new();
        let room = fx.room(RoomSettings::default()).await;
        let user = fx.user(&room, Permissions::MEMBER).await;
        let (sink, mut frames) = mpsc::channel(16);
        let client = room.join(&user, sink).await.unwrap();

        room.close().await.unwrap();
        assert!(room.close().await.unwrap_err().is_closed());
        assert!(client.is_closed());
        assert!(room.live_app().is_closed());
        assert!(room.set_status(true, 0.0, 1.0, 0.0).await.unwrap_err().is_closed());

        // The writer drains and ends the connection
        while frames.recv().await.is_some() {}
    }
}
