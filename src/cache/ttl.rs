//! Idle-evicting registry of live objects
//!
//! Used for the process-wide room and user registries. Every successful
//! lookup touches the entry; a background sweep removes entries that were not
//! touched within the TTL and hands each removed value to the eviction
//! callback exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::config::RegistryConfig;

/// Callback receiving each evicted `(id, value)` pair
pub type EvictFn<V> = Arc<dyn Fn(String, V) + Send + Sync>;

/// Predicate marking a value as in use regardless of lookups
pub type InUseFn<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

struct Slot<V> {
    value: OnceCell<V>,
    /// Milliseconds since the registry epoch
    last_access: AtomicU64,
    /// Callers inside `load_or_init` for this slot; only changes under the
    /// map lock while the value is unset
    loading: AtomicUsize,
}

impl<V> Slot<V> {
    fn new(now: u64) -> Self {
        Self {
            value: OnceCell::new(),
            last_access: AtomicU64::new(now),
            loading: AtomicUsize::new(0),
        }
    }

    fn touch(&self, now: u64) {
        self.last_access.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_access.load(Ordering::Relaxed))
    }
}

/// One caller's stake in a slot during `load_or_init`
///
/// Dropping the last stake of a slot that never got a value removes it from
/// the map, whether the caller failed or was cancelled.
struct Loading<'a, V> {
    entries: &'a RwLock<HashMap<String, Arc<Slot<V>>>>,
    id: &'a str,
    slot: Arc<Slot<V>>,
}

impl<'a, V> Loading<'a, V> {
    fn new(registry: &'a TtlRegistry<V>, id: &'a str, slot: Arc<Slot<V>>) -> Self {
        Self {
            entries: &registry.entries,
            id,
            slot,
        }
    }
}

impl<V> Drop for Loading<'_, V> {
    fn drop(&mut self) {
        if self.slot.value.initialized() {
            self.slot.loading.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        let mut entries = self.entries.write();
        let last = self.slot.loading.fetch_sub(1, Ordering::AcqRel) == 1;
        if last && !self.slot.value.initialized() {
            if let Some(current) = entries.get(self.id) {
                if Arc::ptr_eq(current, &self.slot) {
                    entries.remove(self.id);
                }
            }
        }
    }
}

/// Concurrent id → value map with idle-based eviction
pub struct TtlRegistry<V> {
    entries: RwLock<HashMap<String, Arc<Slot<V>>>>,
    config: RegistryConfig,
    epoch: Instant,
    on_evict: Option<EvictFn<V>>,
    in_use: Option<InUseFn<V>>,
}

impl<V> TtlRegistry<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty registry
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            epoch: Instant::now(),
            on_evict: None,
            in_use: None,
        }
    }

    /// Install the callback run for every evicted value
    ///
    /// The callback runs after the value has been removed and outside the
    /// registry lock, so it may call back into the registry.
    pub fn on_evict<F>(mut self, callback: F) -> Self
    where
        F: Fn(String, V) + Send + Sync + 'static,
    {
        self.on_evict = Some(Arc::new(callback));
        self
    }

    /// Install a predicate for values that must not be evicted
    ///
    /// A value reported in use during a sweep is touched instead, so it gets a
    /// full TTL once it stops being used.
    pub fn in_use<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&V) -> bool + Send + Sync + 'static,
    {
        self.in_use = Some(Arc::new(predicate));
        self
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Look up a live value and mark it as used
    pub fn get(&self, id: &str) -> Option<V> {
        let entries = self.entries.read();
        let slot = entries.get(id)?;
        let value = slot.value.get()?;
        slot.touch(self.now());
        Some(value.clone())
    }

    /// Look up a live value without extending its lifetime
    pub fn peek(&self, id: &str) -> Option<V> {
        self.entries.read().get(id)?.value.get().cloned()
    }

    /// Return the live value for `id`, constructing it with `init` on miss
    ///
    /// Concurrent callers for the same missing id share a single `init` run.
    /// If `init` fails, its error goes to the caller that ran it and a waiting
    /// caller retries with its own `init` on the same slot. The empty slot is
    /// dropped once the last caller working on it has given up.
    pub async fn load_or_init<F, Fut, E>(&self, id: &str, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let loading = self.enter(id);
        loading.slot.touch(self.now());

        let value = loading.slot.value.get_or_try_init(init).await?;
        Ok(value.clone())
    }

    fn enter<'a>(&'a self, id: &'a str) -> Loading<'a, V> {
        {
            let entries = self.entries.read();
            if let Some(slot) = entries.get(id) {
                slot.loading.fetch_add(1, Ordering::AcqRel);
                return Loading::new(self, id, Arc::clone(slot));
            }
        }

        let now = self.now();
        let mut entries = self.entries.write();
        let slot = entries
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Slot::new(now)));
        slot.loading.fetch_add(1, Ordering::AcqRel);
        Loading::new(self, id, Arc::clone(slot))
    }

    /// Remove `id` without running the eviction callback
    ///
    /// Used for intentional deletion where the caller releases the value's
    /// resources itself.
    pub fn delete(&self, id: &str) -> Option<V> {
        let slot = self.entries.write().remove(id)?;
        slot.value.get().cloned()
    }

    /// Whether `id` currently holds a live value
    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .read()
            .get(id)
            .is_some_and(|slot| slot.value.initialized())
    }

    /// Number of entries, including ones still being constructed
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All live values, without touching them
    pub fn values(&self) -> Vec<V> {
        self.entries
            .read()
            .values()
            .filter_map(|slot| slot.value.get().cloned())
            .collect()
    }

    /// Remove every entry without running the eviction callback
    pub fn drain(&self) -> Vec<(String, V)> {
        let entries = std::mem::take(&mut *self.entries.write());
        entries
            .into_iter()
            .filter_map(|(id, slot)| slot.value.get().cloned().map(|value| (id, value)))
            .collect()
    }

    /// Run one eviction pass
    ///
    /// Returns the number of evicted entries. Entries still being constructed
    /// are never evicted.
    pub fn sweep(&self) -> usize {
        let now = self.now();
        let ttl = self.config.ttl.as_millis() as u64;

        let evicted: Vec<(String, V)> = {
            let mut entries = self.entries.write();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, slot)| slot.idle_for(now) > ttl)
                .filter(|(_, slot)| match slot.value.get() {
                    Some(value) if self.is_in_use(value) => {
                        slot.touch(now);
                        false
                    }
                    Some(_) => true,
                    None => false,
                })
                .map(|(id, _)| id.clone())
                .collect();

            expired
                .into_iter()
                .filter_map(|id| {
                    let slot = entries.remove(&id)?;
                    slot.value.get().cloned().map(|value| (id, value))
                })
                .collect()
        };

        let count = evicted.len();
        for (id, value) in evicted {
            tracing::debug!(id = %id, "Evicting idle entry");
            if let Some(ref callback) = self.on_evict {
                callback(id, value);
            }
        }

        if count > 0 {
            tracing::info!(evicted = count, remaining = self.len(), "Registry sweep finished");
        }
        count
    }

    fn is_in_use(&self, value: &V) -> bool {
        self.in_use.as_ref().is_some_and(|in_use| in_use(value))
    }

    /// Spawn a background task that sweeps every `sweep_interval`
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.sweep();
            }
        })
    }
}
