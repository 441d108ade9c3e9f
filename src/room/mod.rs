//! Rooms and their synchronized state
//!
//! A [`Room`] owns:
//!
//! - a [`Hub`](crate::hub::Hub) fanning messages out to connected clients
//! - the playback [`Current`] (movie + play/pause/seek/rate)
//! - the ordered [`MovieList`]
//! - a [`LiveApp`](crate::live::LiveApp) for live-stream channels
//!
//! Rooms are created and resolved through [`SyncContext`](crate::SyncContext),
//! which keeps at most one live `Room` per id.

pub mod current;
pub mod entry;
pub mod movies;
pub mod settings;

pub use current::{Current, CurrentMovie, Status};
pub use entry::{Room, RoomDeps};
pub use movies::{MovieCache, MovieChain, MovieList};
pub use settings::RoomSettings;
