//! Ordered per-room playlist
//!
//! A room's movies are loaded from storage on first use and kept in a
//! [`MovieChain`]: a doubly linked list laid out in a slab with an id index,
//! so appends, removals and swaps are O(1) while iteration stays in position
//! order.
//!
//! Loaded chains live in a process-wide [`MovieCache`] bounded by total movie
//! count. A chain dropped from the cache is simply reloaded from storage next
//! time, since every mutation is written to storage before it is applied to
//! the chain. Each chain carries the generation it was loaded or last written
//! at; a reader that finds a chain older than its room's last committed write
//! drops it and loads again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::future::{Cache, CacheBuilder};
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::storage::{MovieBase, MovieRecord, Storage};

struct Node {
    movie: Arc<MovieRecord>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// In-memory ordered list of one room's movies
#[derive(Default)]
pub struct MovieChain {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl MovieChain {
    /// Build from records already sorted by position
    pub fn from_records(records: Vec<MovieRecord>) -> Self {
        let mut chain = Self::default();
        for record in records {
            chain.push_back(record);
        }
        chain
    }

    /// Number of movies
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Position of the last movie, 0 when empty
    pub fn last_position(&self) -> u64 {
        self.tail
            .and_then(|slot| self.node(slot))
            .map(|node| node.movie.position)
            .unwrap_or(0)
    }

    fn node(&self, slot: usize) -> Option<&Node> {
        self.nodes.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node> {
        self.nodes.get_mut(slot).and_then(Option::as_mut)
    }

    /// Append a movie; a movie with the same id is replaced
    pub fn push_back(&mut self, record: MovieRecord) -> Arc<MovieRecord> {
        self.remove(&record.id);

        let movie = Arc::new(record);
        let node = Node {
            movie: Arc::clone(&movie),
            prev: self.tail,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };

        match self.tail.and_then(|tail| self.node_mut(tail)) {
            Some(tail) => tail.next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.index.insert(movie.id.clone(), slot);
        movie
    }

    /// Unlink a movie by id
    pub fn remove(&mut self, id: &str) -> Option<Arc<MovieRecord>> {
        let slot = self.index.remove(id)?;
        let node = self.nodes.get_mut(slot)?.take()?;

        match node.prev.and_then(|prev| self.node_mut(prev)) {
            Some(prev) => prev.next = node.next,
            None => self.head = node.next,
        }
        match node.next.and_then(|next| self.node_mut(next)) {
            Some(next) => next.prev = node.prev,
            None => self.tail = node.prev,
        }
        self.free.push(slot);
        Some(node.movie)
    }

    /// Exchange the places (and positions) of two movies
    pub fn swap(&mut self, a: &str, b: &str) -> Result<()> {
        let slot_a = *self
            .index
            .get(a)
            .ok_or_else(|| Error::MovieNotFound(a.to_string()))?;
        let slot_b = *self
            .index
            .get(b)
            .ok_or_else(|| Error::MovieNotFound(b.to_string()))?;
        if slot_a == slot_b {
            return Ok(());
        }

        let (Some(node_a), Some(node_b)) = (self.node(slot_a), self.node(slot_b)) else {
            return Err(Error::MovieNotFound(a.to_string()));
        };
        let mut moved_a = MovieRecord::clone(&node_a.movie);
        let mut moved_b = MovieRecord::clone(&node_b.movie);
        std::mem::swap(&mut moved_a.position, &mut moved_b.position);

        if let Some(node) = self.node_mut(slot_a) {
            node.movie = Arc::new(moved_b);
        }
        if let Some(node) = self.node_mut(slot_b) {
            node.movie = Arc::new(moved_a);
        }
        self.index.insert(a.to_string(), slot_b);
        self.index.insert(b.to_string(), slot_a);
        Ok(())
    }

    /// Look up a movie by id
    pub fn get(&self, id: &str) -> Option<Arc<MovieRecord>> {
        let slot = *self.index.get(id)?;
        self.node(slot).map(|node| Arc::clone(&node.movie))
    }

    /// Iterate in position order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<MovieRecord>> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = self.node(cursor?)?;
            cursor = node.next;
            Some(&node.movie)
        })
    }

    /// One page of movies; `page` starts at 1
    pub fn page(&self, page: usize, size: usize) -> Vec<Arc<MovieRecord>> {
        let skip = page.max(1).saturating_sub(1).saturating_mul(size);
        self.iter().skip(skip).take(size).cloned().collect()
    }

    /// Drop every movie
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

struct CachedChain {
    chain: RwLock<MovieChain>,
    weight: u32,
    generation: AtomicU64,
}

/// Bounded cache of loaded movie chains, shared by all rooms
pub struct MovieCache {
    chains: Cache<String, Arc<CachedChain>>,
    storage: Arc<dyn Storage>,
    generations: AtomicU64,
}

impl MovieCache {
    /// Create a cache holding at most about `capacity` movies
    pub fn new(storage: Arc<dyn Storage>, capacity: u64) -> Self {
        let chains = CacheBuilder::new(capacity)
            .weigher(|_k, v: &Arc<CachedChain>| v.weight)
            .build();
        Self {
            chains,
            storage,
            generations: AtomicU64::new(0),
        }
    }

    /// A generation number never handed out before
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Get the room's chain, loading it on miss stamped with `generation`
    async fn load(&self, room_id: &str, generation: u64) -> Result<Arc<CachedChain>> {
        let storage = Arc::clone(&self.storage);
        let id = room_id.to_string();
        self.chains
            .try_get_with(room_id.to_string(), async move {
                let records = storage.load_movies(&id).await?;
                let weight = u32::try_from(records.len()).unwrap_or(u32::MAX).max(1);
                tracing::debug!(room = %id, movies = records.len(), "Movie list loaded");
                Ok::<_, Error>(Arc::new(CachedChain {
                    chain: RwLock::new(MovieChain::from_records(records)),
                    weight,
                    generation: AtomicU64::new(generation),
                }))
            })
            .await
            .map_err(Error::Shared)
    }

    /// Drop a room's chain; the next access reloads it
    pub async fn invalidate(&self, room_id: &str) {
        self.chains.invalidate(room_id).await;
    }

    /// Whether a room's chain is currently loaded
    pub fn is_loaded(&self, room_id: &str) -> bool {
        self.chains.contains_key(room_id)
    }
}

/// Playlist operations for one room
///
/// Mutations are serialized and write through to storage before the cached
/// chain changes, so a storage failure leaves the list untouched.
pub struct MovieList {
    room_id: String,
    storage: Arc<dyn Storage>,
    cache: Arc<MovieCache>,
    op_lock: Mutex<()>,
    /// Generation of the last committed write
    generation: AtomicU64,
}

impl MovieList {
    /// Create the playlist view of one room
    pub fn new(
        room_id: impl Into<String>,
        storage: Arc<dyn Storage>,
        cache: Arc<MovieCache>,
    ) -> Self {
        let generation = AtomicU64::new(cache.next_generation());
        Self {
            room_id: room_id.into(),
            storage,
            cache,
            op_lock: Mutex::new(()),
            generation,
        }
    }

    /// Id of the room this list belongs to
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// The cached chain, reloaded if it predates the last committed write
    ///
    /// A chain loaded while a write was in flight may miss that write; its
    /// generation is older than the one the write committed with.
    async fn chain(&self) -> Result<Arc<CachedChain>> {
        loop {
            let generation = self.generation.load(Ordering::Acquire);
            let cached = self.cache.load(&self.room_id, generation).await?;
            let committed = self.generation.load(Ordering::Acquire);
            if cached.generation.load(Ordering::Acquire) == committed {
                return Ok(cached);
            }
            tracing::debug!(room = %self.room_id, "Dropping movie list loaded before a write");
            self.cache.invalidate(&self.room_id).await;
        }
    }

    /// Apply a change that storage already holds to the cached chain
    async fn commit<R, F>(&self, cached: &CachedChain, change: F) -> R
    where
        F: FnOnce(&mut MovieChain) -> R,
    {
        let generation = self.cache.next_generation();
        self.generation.store(generation, Ordering::Release);

        let mut chain = cached.chain.write().await;
        let result = change(&mut *chain);
        cached.generation.store(generation, Ordering::Release);
        result
    }

    /// Number of movies
    pub async fn len(&self) -> Result<usize> {
        let cached = self.chain().await?;
        let len = cached.chain.read().await.len();
        Ok(len)
    }

    /// Look up a movie by id
    pub async fn get(&self, id: &str) -> Result<Arc<MovieRecord>> {
        let cached = self.chain().await?;
        let movie = cached.chain.read().await.get(id);
        movie.ok_or_else(|| Error::MovieNotFound(id.to_string()))
    }

    /// Every movie in position order
    pub async fn all(&self) -> Result<Vec<Arc<MovieRecord>>> {
        let cached = self.chain().await?;
        let movies = cached.chain.read().await.iter().cloned().collect();
        Ok(movies)
    }

    /// One page of movies plus the total count; `page` starts at 1
    pub async fn page(&self, page: usize, size: usize) -> Result<(usize, Vec<Arc<MovieRecord>>)> {
        let cached = self.chain().await?;
        let chain = cached.chain.read().await;
        Ok((chain.len(), chain.page(page, size)))
    }

    /// Append one movie
    pub async fn add(&self, creator_id: &str, base: MovieBase) -> Result<Arc<MovieRecord>> {
        let mut added = self.add_many(creator_id, vec![base]).await?;
        added
            .pop()
            .ok_or_else(|| Error::InvalidArgument("no movie added".into()))
    }

    /// Append movies in the given order
    pub async fn add_many(
        &self,
        creator_id: &str,
        bases: Vec<MovieBase>,
    ) -> Result<Vec<Arc<MovieRecord>>> {
        if bases.is_empty() {
            return Err(Error::InvalidArgument("movie list is empty".into()));
        }
        for base in &bases {
            validate(base)?;
        }

        let _op = self.op_lock.lock().await;
        let cached = self.chain().await?;

        let first = cached.chain.read().await.last_position() + 1;
        let records: Vec<_> = bases
            .into_iter()
            .zip(first..)
            .map(|(base, position)| MovieRecord {
                id: uuid::Uuid::new_v4().simple().to_string(),
                room_id: self.room_id.clone(),
                position,
                creator_id: creator_id.to_string(),
                base,
            })
            .collect();

        self.storage.insert_movies(&records).await?;

        let added = self
            .commit(&cached, |chain| {
                records
                    .into_iter()
                    .map(|record| chain.push_back(record))
                    .collect::<Vec<_>>()
            })
            .await;
        Ok(added)
    }

    /// Delete movies by id; fails without changes if any id is unknown
    pub async fn delete(&self, ids: &[String]) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let cached = self.chain().await?;

        {
            let chain = cached.chain.read().await;
            if let Some(missing) = ids.iter().find(|id| chain.get(id).is_none()) {
                return Err(Error::MovieNotFound(missing.clone()));
            }
        }

        self.storage.delete_movies(&self.room_id, ids).await?;

        self.commit(&cached, |chain| {
            for id in ids {
                chain.remove(id);
            }
        })
        .await;
        Ok(())
    }

    /// Exchange the positions of two movies
    pub async fn swap(&self, a: &str, b: &str) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let cached = self.chain().await?;

        {
            let chain = cached.chain.read().await;
            for id in [a, b] {
                if chain.get(id).is_none() {
                    return Err(Error::MovieNotFound(id.to_string()));
                }
            }
        }

        self.storage.swap_movie_positions(&self.room_id, a, b).await?;
        let swapped = self.commit(&cached, |chain| chain.swap(a, b)).await;
        swapped
    }

    /// Remove every movie
    pub async fn clear(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let cached = self.chain().await?;

        self.storage.clear_movies(&self.room_id).await?;
        self.commit(&cached, MovieChain::clear).await;
        Ok(())
    }

    /// Drop the cached chain of this room
    pub async fn invalidate(&self) {
        self.cache.invalidate(&self.room_id).await;
    }
}

fn validate(base: &MovieBase) -> Result<()> {
    if base.name.trim().is_empty() {
        return Err(Error::InvalidArgument("movie name is empty".into()));
    }
    if base.url.trim().is_empty() && !base.rtmp_source {
        return Err(Error::InvalidArgument("movie url is empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time;

    use super::*;
    use crate::storage::MemoryStorage;

    fn record(id: &str, position: u64) -> MovieRecord {
        MovieRecord {
            id: id.to_string(),
            room_id: "r1".to_string(),
            position,
            creator_id: "u1".to_string(),
            base: MovieBase::default(),
        }
    }

    fn base(name: &str) -> MovieBase {
        MovieBase {
            name: name.to_string(),
            url: format!("https://cdn.example/{name}.mp4"),
            ..Default::default()
        }
    }

    fn ids(chain: &MovieChain) -> Vec<&str> {
        chain.iter().map(|m| m.id.as_str()).collect()
    }

    fn names(movies: &[Arc<MovieRecord>]) -> Vec<&str> {
        movies.iter().map(|m| m.base.name.as_str()).collect()
    }

    fn list(storage: &Arc<MemoryStorage>) -> MovieList {
        let storage: Arc<dyn Storage> = storage.clone();
        let cache = Arc::new(MovieCache::new(Arc::clone(&storage), 1_000));
        MovieList::new("r1", storage, cache)
    }

    #[test]
    fn test_chain_remove_reuses_slots() {
        let mut chain = MovieChain::from_records(vec![record("a", 1), record("b", 2), record("c", 3)]);

        assert!(chain.remove("b").is_some());
        assert!(chain.remove("b").is_none());
        assert_eq!(ids(&chain), ["a", "c"]);

        chain.push_back(record("d", 4));
        assert_eq!(chain.nodes.len(), 3);
        assert_eq!(ids(&chain), ["a", "c", "d"]);

        chain.remove("a");
        chain.remove("d");
        assert_eq!(ids(&chain), ["c"]);
        assert_eq!(chain.last_position(), 3);
    }

    #[test]
    fn test_chain_swap_exchanges_positions() {
        let mut chain = MovieChain::from_records(vec![record("a", 1), record("b", 2), record("c", 3)]);

        chain.swap("a", "c").unwrap();
        assert_eq!(ids(&chain), ["c", "b", "a"]);
        assert_eq!(chain.get("c").unwrap().position, 1);
        assert_eq!(chain.get("a").unwrap().position, 3);

        assert!(matches!(chain.swap("a", "zz"), Err(Error::MovieNotFound(_))));
    }

    #[test]
    fn test_chain_page() {
        let chain = MovieChain::from_records((1..=5).map(|i| record(&i.to_string(), i)).collect());

        let page: Vec<_> = chain.page(2, 2).iter().map(|m| m.id.clone()).collect();
        assert_eq!(page, ["3", "4"]);
        assert_eq!(chain.page(3, 2).len(), 1);
        assert!(chain.page(4, 2).is_empty());
        assert_eq!(chain.page(0, 2).len(), 2);
    }

    #[tokio::test]
    async fn test_list_writes_through() {
        let storage = Arc::new(MemoryStorage::new());
        let movies = list(&storage);

        let added = movies.add_many("u1", vec![base("a"), base("b")]).await.unwrap();
        assert_eq!(added[0].position + 1, added[1].position);

        movies.swap(&added[0].id, &added[1].id).await.unwrap();
        assert_eq!(names(&movies.all().await.unwrap()), ["b", "a"]);

        // A fresh cache reloads the same order from storage
        let reloaded = list(&storage);
        assert_eq!(names(&reloaded.all().await.unwrap()), ["b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_loaded_during_write_is_reloaded() {
        let storage = Arc::new(MemoryStorage::new());
        let movies = list(&storage);
        movies.add("u1", base("a")).await.unwrap();

        storage.write_delay(Duration::from_millis(50));
        let write = movies.add("u1", base("b"));
        let read = async {
            time::sleep(Duration::from_millis(10)).await;
            movies.invalidate().await;
            movies.all().await.unwrap()
        };
        let (added, seen) = tokio::join!(write, read);

        assert_eq!(added.unwrap().base.name, "b");
        assert_eq!(names(&seen), ["a"]);
        assert_eq!(names(&movies.all().await.unwrap()), ["a", "b"]);
        assert_eq!(movies.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_unknown_is_atomic() {
        let storage = Arc::new(MemoryStorage::new());
        let movies = list(&storage);
        let a = movies.add("u1", base("a")).await.unwrap();

        let err = movies
            .delete(&[a.id.clone(), "missing".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(movies.len().await.unwrap(), 1);

        movies.delete(&[a.id.clone()]).await.unwrap();
        assert_eq!(movies.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_leaves_list_untouched() {
        let storage = Arc::new(MemoryStorage::new());
        let movies = list(&storage);
        movies.add("u1", base("a")).await.unwrap();

        storage.fail_writes(true);
        assert!(movies.add("u1", base("b")).await.is_err());
        assert!(movies.clear().await.is_err());
        assert_eq!(movies.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_movie_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let movies = list(&storage);

        let err = movies.add("u1", MovieBase::default()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let live = MovieBase {
            name: "stream".into(),
            is_live: true,
            rtmp_source: true,
            ..Default::default()
        };
        movies.add("u1", live).await.unwrap();
    }
}
