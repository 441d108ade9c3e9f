//! Registry of refresh caches keyed by id

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::refresh::{RefreshCache, RefreshFn};
use crate::error::Error;

type KeyedRefreshFn<K, T, A, E> =
    Arc<dyn Fn(CancellationToken, K, A) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// Lazily populated map of independent [`RefreshCache`]s
///
/// Each key gets its own entry (and its own lock), created on first access
/// with the registry's default refresh function bound to that key.
pub struct KeyedCache<K, T, A = (), E = Error> {
    entries: RwLock<HashMap<K, Arc<RefreshCache<T, A, E>>>>,
    max_age: Duration,
    refresh_fn: KeyedRefreshFn<K, T, A, E>,
}

impl<K, T, A, E> KeyedCache<K, T, A, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    A: Send + 'static,
    E: Send + 'static,
{
    /// Create an empty cache; `refresh` loads the value of one key
    pub fn new<F, Fut>(max_age: Duration, refresh: F) -> Self
    where
        F: Fn(CancellationToken, K, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_age,
            refresh_fn: Arc::new(move |ctx: CancellationToken, key: K, arg: A| {
                refresh(ctx, key, arg).boxed()
            }),
        }
    }

    /// Get the entry for `key`, creating it if this is the first access
    pub fn entry(&self, key: &K) -> Arc<RefreshCache<T, A, E>> {
        if let Some(entry) = self.entries.read().get(key) {
            return Arc::clone(entry);
        }

        let mut entries = self.entries.write();
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(self.new_entry(key.clone())));
        Arc::clone(entry)
    }

    fn new_entry(&self, key: K) -> RefreshCache<T, A, E> {
        let refresh_fn = Arc::clone(&self.refresh_fn);
        let bound: RefreshFn<T, A, E> =
            Arc::new(move |ctx: CancellationToken, arg: A| refresh_fn(ctx, key.clone(), arg));
        RefreshCache::from_fn(self.max_age, bound)
    }

    /// Return the cached value for `key`, loading it on miss or expiry
    pub async fn load_or_store(&self, ctx: &CancellationToken, key: &K, arg: A) -> Result<T, E> {
        self.entry(key).get(ctx, arg).await
    }

    /// Force a refresh of `key` and return the new value
    pub async fn store_or_refresh(
        &self,
        ctx: &CancellationToken,
        key: &K,
        arg: A,
    ) -> Result<T, E> {
        self.entry(key).refresh(ctx, arg).await
    }

    /// [`load_or_store`](Self::load_or_store) with a one-off refresh function
    pub async fn load_or_store_with<F, Fut>(
        &self,
        ctx: &CancellationToken,
        key: &K,
        arg: A,
        refresh: F,
    ) -> Result<T, E>
    where
        F: FnOnce(CancellationToken, A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.entry(key).get_with(ctx, arg, refresh).await
    }

    /// Existing entry for `key`, without creating one
    pub fn get_entry(&self, key: &K) -> Option<Arc<RefreshCache<T, A, E>>> {
        self.entries.read().get(key).cloned()
    }

    /// Drop the entry for `key`
    pub fn remove(&self, key: &K) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Drop every entry at once
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of entries (populated or not)
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no entry exists
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
