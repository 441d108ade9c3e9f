//! Live-stream channels
//!
//! Every room owns one [`LiveApp`]: a set of named channels that a publisher
//! pushes frames into and any number of viewers subscribe to. Fan-out uses
//! `tokio::sync::broadcast`, and frame payloads are `bytes::Bytes`, so all
//! subscribers share one allocation per frame.
//!
//! ```text
//!                     Arc<LiveRegistry>
//!                ┌─────────────────────────┐
//!                │ apps: HashMap<room_id,  │
//!                │   LiveApp { channels }  │
//!                └───────────┬─────────────┘
//!                            │
//!        ┌───────────────────┼───────────────────┐
//!        ▼                   ▼                   ▼
//!   [Publisher]         [Subscriber]        [Subscriber]
//!   app.publish() ──►   rx.recv()           rx.recv()
//! ```
//!
//! The app lives as long as its room: closing or evicting the room removes
//! the app, which ends every subscriber stream.

pub mod app;
pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod registry;

pub use app::LiveApp;
pub use channel::{ChannelState, ChannelStats};
pub use config::LiveConfig;
pub use error::LiveError;
pub use frame::{FrameKind, LiveFrame};
pub use registry::LiveRegistry;
