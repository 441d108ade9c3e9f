//! Room synchronization and broadcast engine
//!
//! `roomsync` keeps the live state of shared viewing rooms in memory: who is
//! connected, what is playing, where playback is, and which movies are queued.
//! State changes are turned into typed messages and fanned out to every
//! connected client of the room.
//!
//! # Architecture
//!
//! ```text
//!                            Arc<SyncContext>
//!          ┌──────────────────────────────────────────────────┐
//!          │ rooms: TtlRegistry<Arc<Room>>                    │
//!          │ users: TtlRegistry<Arc<User>>                    │
//!          │ live:  LiveRegistry     movies: MovieCache       │
//!          └────────────┬─────────────────────────────────────┘
//!                       │ load_or_init_room()
//!                       ▼
//!                    [Room] ── current: Current (play/pause/seek/rate)
//!                       │   ── movies:  MovieList
//!                       │   ── hub:     Hub ──► dispatch task
//!                       │                          │
//!          ┌────────────┼──────────────┐           │ fan-out
//!          ▼            ▼              ▼           ▼
//!      [Client]     [Client]       [Client] ◄── outbox (bounded)
//!      writer()     writer()       writer() ──► MessageSink (socket)
//! ```
//!
//! The HTTP/WebSocket layer, persistence schema and vendor integrations live
//! outside this crate. Persistence is reached through the [`storage::Storage`]
//! trait and sockets through [`hub::MessageSink`].

pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod hub;
pub mod live;
pub mod room;
pub mod storage;
pub mod user;

pub use config::SyncConfig;
pub use context::{Credentials, SyncContext};
pub use error::{Error, Result};
pub use hub::{BroadcastOptions, Client, Hub, InboundMessage, MessageSink, OutboundMessage};
pub use room::{Current, CurrentMovie, MovieList, Room, RoomSettings, Status};
pub use storage::{MemoryStorage, Storage};
pub use user::{Permissions, User};
