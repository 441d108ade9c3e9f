//! Single-value refresh cache
//!
//! A [`RefreshCache`] memoizes the result of an async refresh function for
//! `max_age`. Concurrent readers that find the value stale queue up on the
//! entry's write lock; the first one refreshes and everyone after it sees the
//! fresh value, so a burst of readers costs exactly one refresh.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Boxed refresh function stored by a [`RefreshCache`]
pub type RefreshFn<T, A, E> =
    Arc<dyn Fn(CancellationToken, A) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

struct Slot<T> {
    data: Option<T>,
    last_refresh: Option<Instant>,
}

impl<T> Slot<T> {
    /// The cached value, if it may still be served
    fn fresh(&self, max_age: Duration) -> Option<&T> {
        let data = self.data.as_ref()?;
        if max_age.is_zero() {
            return Some(data);
        }
        match self.last_refresh {
            Some(at) if at.elapsed() < max_age => Some(data),
            _ => None,
        }
    }

    fn store(&mut self, data: T) {
        self.data = Some(data);
        self.last_refresh = Some(Instant::now());
    }
}

/// Time-boxed memoizing cache around one value
///
/// `max_age == 0` disables expiry: once populated, the value is served until
/// [`refresh`](Self::refresh) or [`clear`](Self::clear) is called.
///
/// A failed refresh returns the refresh function's error unchanged and keeps
/// the previous value and refresh timestamp.
pub struct RefreshCache<T, A = (), E = Error> {
    slot: RwLock<Slot<T>>,
    max_age: Duration,
    refresh_fn: RefreshFn<T, A, E>,
}

impl<T, A, E> RefreshCache<T, A, E>
where
    T: Clone + Send + Sync,
    A: Send + 'static,
    E: Send + 'static,
{
    /// Create an empty cache with the given default refresh function
    pub fn new<F, Fut>(max_age: Duration, refresh: F) -> Self
    where
        F: Fn(CancellationToken, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: 'static,
    {
        let refresh_fn: RefreshFn<T, A, E> =
            Arc::new(move |ctx: CancellationToken, arg: A| refresh(ctx, arg).boxed());
        Self::from_fn(max_age, refresh_fn)
    }

    /// Create an empty cache around an already boxed refresh function
    pub fn from_fn(max_age: Duration, refresh_fn: RefreshFn<T, A, E>) -> Self {
        Self {
            slot: RwLock::new(Slot {
                data: None,
                last_refresh: None,
            }),
            max_age,
            refresh_fn,
        }
    }

    /// Maximum age of a served value (zero = never expires)
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Return the cached value, refreshing it first if it is missing or stale
    pub async fn get(&self, ctx: &CancellationToken, arg: A) -> Result<T, E> {
        let refresh_fn = Arc::clone(&self.refresh_fn);
        self.get_with(ctx, arg, move |ctx, arg| refresh_fn(ctx, arg))
            .await
    }

    /// Like [`get`](Self::get), but with a one-off refresh function
    ///
    /// The override shares the cached slot and the locking of the default
    /// function; it is only used if this call ends up refreshing.
    pub async fn get_with<F, Fut>(
        &self,
        ctx: &CancellationToken,
        arg: A,
        refresh: F,
    ) -> Result<T, E>
    where
        F: FnOnce(CancellationToken, A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(data) = self.slot.read().await.fresh(self.max_age) {
            return Ok(data.clone());
        }

        let mut slot = self.slot.write().await;
        // Another caller may have refreshed while we waited for the lock
        if let Some(data) = slot.fresh(self.max_age) {
            return Ok(data.clone());
        }

        let data = refresh(ctx.clone(), arg).await?;
        slot.store(data.clone());
        Ok(data)
    }

    /// Unconditionally run the refresh function and store its result
    pub async fn refresh(&self, ctx: &CancellationToken, arg: A) -> Result<T, E> {
        let refresh_fn = Arc::clone(&self.refresh_fn);
        self.refresh_with(ctx, arg, move |ctx, arg| refresh_fn(ctx, arg))
            .await
    }

    /// Like [`refresh`](Self::refresh), but with a one-off refresh function
    pub async fn refresh_with<F, Fut>(
        &self,
        ctx: &CancellationToken,
        arg: A,
        refresh: F,
    ) -> Result<T, E>
    where
        F: FnOnce(CancellationToken, A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut slot = self.slot.write().await;
        let data = refresh(ctx.clone(), arg).await?;
        slot.store(data.clone());
        Ok(data)
    }

    /// The stored value without checking its age or refreshing
    pub async fn data(&self) -> Option<T> {
        self.slot.read().await.data.clone()
    }

    /// When the value was last stored
    pub async fn last_refresh(&self) -> Option<Instant> {
        self.slot.read().await.last_refresh
    }

    /// Store a value as if it had just been refreshed
    pub async fn set(&self, data: T) {
        self.slot.write().await.store(data);
    }

    /// Drop the stored value so the next `get` refreshes
    pub async fn clear(&self) {
        let mut slot = self.slot.write().await;
        slot.data = None;
        slot.last_refresh = None;
    }
}
