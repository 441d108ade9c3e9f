//! Per-room broadcast hub
//!
//! A [`Hub`] owns the set of connected [`Client`]s of one room and fans
//! messages out to them. Every broadcast goes through one bounded queue that
//! a single dispatch task drains, so all clients see broadcasts in the same
//! order.
//!
//! ```text
//!   broadcast() ──► [bounded queue] ──► dispatch task
//!                                         │ filters (sender / ignore list)
//!                     ┌───────────────────┼───────────────────┐
//!                     ▼                   ▼                   ▼
//!                 outbox (A)          outbox (B)          outbox (C)
//!                     │                   │                   │
//!                 run_writer()        run_writer()        run_writer()
//!                     ▼                   ▼                   ▼
//!                MessageSink         MessageSink         MessageSink
//! ```
//!
//! Pushes into a client's outbox never wait. A client whose outbox is full or
//! closed is dropped from the hub, so one slow connection cannot stall the
//! room.

pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod writer;

pub use bus::{BroadcastOptions, Hub};
pub use client::{Client, ClientId, Outbox};
pub use config::HubConfig;
pub use error::HubError;
pub use message::{InboundMessage, OutboundMessage};
pub use writer::{run_writer, MessageSink};
