//! Caching primitives shared by every subsystem
//!
//! Three layers, each built on the one before:
//!
//! - [`RefreshCache`]: one time-boxed value with single-flight refresh.
//! - [`KeyedCache`]: lazily created `RefreshCache`s keyed by id.
//! - [`TtlRegistry`]: live objects keyed by id, evicted after an idle period.
//!
//! Refresh functions receive a [`CancellationToken`] supplied by the caller
//! and are expected to abandon outstanding I/O once it is cancelled.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod keyed;
pub mod refresh;
pub mod ttl;

pub use keyed::KeyedCache;
pub use refresh::{RefreshCache, RefreshFn};
pub use ttl::{EvictFn, TtlRegistry};
