//! The [FetchCache] drives a [Fetcher] and an [Asset] decoder, keeping decoded values in an [LruStore].
//!
//! Lookups never block.  A hit returns the value; a miss returns `None` and queues a task on the [WorkerPool] which
//! fetches the bytes, decodes them, stores the result, and then tells whoever is interested through the
//! [Dispatcher].  Failed fetches and decodes are logged and counted but otherwise dropped: the key just stays
//! absent, and the next lookup tries again.
//!
//! By default two misses for the same key start two fetches, and the store ends up with whichever finished last.
//! Setting [FetchCacheConfig::dedupe_in_flight] makes later misses wait on the first fetch instead.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::stats::StatsCounters;
use crate::*;

type Handler<K, V> = Arc<dyn Fn(&K, Arc<V>) + Send + Sync>;
type Callback<K, V> = Box<dyn FnOnce(&K, Arc<V>) + Send>;
type WaiterMap<K, V> = HashMap<K, Vec<Callback<K, V>>, ahash::RandomState>;

struct Inner<F: Fetcher, V: Asset> {
    store: Mutex<LruStore<F::Key, V>>,
    fetcher: F,
    dispatcher: Box<dyn Dispatcher>,
    on_fetched: RwLock<Option<Handler<F::Key, V>>>,
    /// Keys being fetched, with the callbacks waiting on them.  Only present when deduplicating.
    in_flight: Option<Mutex<WaiterMap<F::Key, V>>>,
    stats: StatsCounters,
    /// Cleared when the owning [FetchCache] is dropped.  Workers may still hold an `Arc` for a while after that.
    live: AtomicBool,
}

pub struct FetchCache<F: Fetcher, V: Asset> {
    inner: Arc<Inner<F, V>>,
    pool: WorkerPool,
}

impl<F: Fetcher, V: Asset> Inner<F, V> {
    fn lock_store(&self) -> MutexGuard<'_, LruStore<F::Key, V>> {
        // User code never runs under this lock, so a poisoned store is still consistent.
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn fetch_and_decode(&self, key: &F::Key) -> Result<V, CacheError<V::Error>> {
        let bytes = self.fetcher.fetch(key).map_err(CacheError::Fetch)?;
        if bytes.is_empty() {
            return Err(CacheError::Fetch(FetchError::Empty));
        }
        V::decode(&bytes).map_err(CacheError::Decode)
    }

    fn record_failure(&self, key: &F::Key, error: &CacheError<V::Error>) {
        match error {
            CacheError::Fetch(_) => self.stats.record_fetch_failure(),
            CacheError::Decode(_) => self.stats.record_decode_failure(),
        }
        warn!(key = ?key, error = ?error, "could not populate cache entry");
    }

    fn take_waiters(&self, key: &F::Key) -> Vec<Callback<F::Key, V>> {
        match &self.in_flight {
            Some(m) => m
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(key)
                .unwrap_or_default(),
            None => vec![],
        }
    }

    /// Store a freshly decoded value and queue the notifications for it.
    fn complete(
        &self,
        weak: &Weak<Inner<F, V>>,
        key: F::Key,
        value: Arc<V>,
        callback: Option<Callback<F::Key, V>>,
    ) {
        let waiters = {
            let mut store = self.lock_store();
            store.insert_shared(key.clone(), value.clone());
            // Still under the store lock, so anyone who misses the registry from here on will hit the store.
            self.take_waiters(&key)
        };

        let handler = self
            .on_fetched
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let callbacks = callback.into_iter().chain(waiters).collect::<Vec<_>>();
        if handler.is_none() && callbacks.is_empty() {
            return;
        }

        let weak = weak.clone();
        self.dispatcher.dispatch(Box::new(move || {
            let live = weak.upgrade().map(|i| i.is_live()).unwrap_or(false);
            if !live {
                debug!(key = ?key, "cache is gone; dropping notification");
                return;
            }
            if let Some(h) = handler {
                h(&key, value.clone());
            }
            for cb in callbacks {
                cb(&key, value.clone());
            }
        }));
    }
}

/// Clears a key's registry entry if its worker leaves without settling it, e.g. because the fetcher or decoder
/// panicked.  Otherwise every later miss would join a fetch which no longer exists.
struct RegistryGuard<'a, F: Fetcher, V: Asset> {
    inner: &'a Inner<F, V>,
    key: Option<F::Key>,
}

impl<'a, F: Fetcher, V: Asset> RegistryGuard<'a, F, V> {
    fn new(inner: &'a Inner<F, V>, key: &F::Key) -> RegistryGuard<'a, F, V> {
        let key = inner.in_flight.as_ref().map(|_| key.clone());
        RegistryGuard { inner, key }
    }

    /// The entry was settled (or belongs to someone else now), so leave it alone.
    fn disarm(&mut self) {
        self.key = None;
    }
}

impl<'a, F: Fetcher, V: Asset> Drop for RegistryGuard<'a, F, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            warn!(key = ?key, "fetch abandoned; dropping its waiters");
            drop(self.inner.take_waiters(&key));
        }
    }
}

/// The body of a worker task.
fn populate<F: Fetcher, V: Asset>(
    weak: Weak<Inner<F, V>>,
    key: F::Key,
    callback: Option<Callback<F::Key, V>>,
) {
    let inner = match weak.upgrade() {
        Some(i) if i.is_live() => i,
        _ => {
            debug!(key = ?key, "cache is gone; skipping fetch");
            return;
        }
    };
    let mut guard = RegistryGuard::new(&inner, &key);

    match inner.fetch_and_decode(&key) {
        Ok(value) => {
            if !inner.is_live() {
                debug!(key = ?key, "cache is gone; dropping fetched value");
                return;
            }
            guard.disarm();
            inner.complete(&weak, key, Arc::new(value), callback);
        }
        Err(e) => {
            guard.disarm();
            inner.record_failure(&key, &e);
            // Failures notify nobody, including anyone who joined this fetch.
            drop(inner.take_waiters(&key));
        }
    }
}

impl<F: Fetcher, V: Asset> FetchCache<F, V> {
    /// Build a cache with its own worker pool.
    pub fn new<D: Dispatcher>(
        fetcher: F,
        dispatcher: D,
        config: FetchCacheConfig,
    ) -> Result<FetchCache<F, V>, ConfigError> {
        config.validate()?;
        let pool = WorkerPool::new(&config.pool_name, config.max_concurrent_fetches)?;
        FetchCache::from_parts(fetcher, Box::new(dispatcher), config, pool)
    }

    /// Build a cache whose workers run on an existing tokio runtime.
    pub fn with_handle<D: Dispatcher>(
        handle: Handle,
        fetcher: F,
        dispatcher: D,
        config: FetchCacheConfig,
    ) -> Result<FetchCache<F, V>, ConfigError> {
        config.validate()?;
        let pool = WorkerPool::with_handle(handle, config.max_concurrent_fetches)?;
        FetchCache::from_parts(fetcher, Box::new(dispatcher), config, pool)
    }

    fn from_parts(
        fetcher: F,
        dispatcher: Box<dyn Dispatcher>,
        config: FetchCacheConfig,
        pool: WorkerPool,
    ) -> Result<FetchCache<F, V>, ConfigError> {
        let in_flight = if config.dedupe_in_flight {
            Some(Mutex::new(Default::default()))
        } else {
            None
        };

        Ok(FetchCache {
            inner: Arc::new(Inner {
                store: Mutex::new(LruStore::new(config.capacity)?),
                fetcher,
                dispatcher,
                on_fetched: RwLock::new(None),
                in_flight,
                stats: Default::default(),
                live: AtomicBool::new(true),
            }),
            pool,
        })
    }

    /// Get an item if it is cached, otherwise start fetching it and return `None`.
    ///
    /// Once the fetch succeeds, the handler registered with [FetchCache::set_on_fetched] is notified.
    pub fn lookup(&self, key: &F::Key) -> Option<Arc<V>> {
        self.lookup_inner(key, None)
    }

    /// Like [FetchCache::lookup], but also call `on_fetched` when this miss is filled.
    ///
    /// `on_fetched` runs at most once, on the dispatcher, and only on success.  On a hit it is dropped without being
    /// called, since the value is already in hand.
    pub fn lookup_with<C>(&self, key: &F::Key, on_fetched: C) -> Option<Arc<V>>
    where
        C: FnOnce(&F::Key, Arc<V>) + Send + 'static,
    {
        self.lookup_inner(key, Some(Box::new(on_fetched)))
    }

    fn lookup_inner(
        &self,
        key: &F::Key,
        callback: Option<Callback<F::Key, V>>,
    ) -> Option<Arc<V>> {
        let hit = self.inner.lock_store().get(key);
        if let Some(v) = hit {
            self.inner.stats.record_hit();
            return Some(v);
        }

        self.inner.stats.record_miss();
        self.schedule(key.clone(), callback);
        None
    }

    fn schedule(&self, key: F::Key, callback: Option<Callback<F::Key, V>>) {
        let mut callback = callback;
        if let Some(m) = &self.inner.in_flight {
            let mut guard = m.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(waiters) = guard.get_mut(&key) {
                waiters.extend(callback);
                self.inner.stats.record_fetch_joined();
                debug!(key = ?key, "cache miss; joining fetch in flight");
                return;
            }
            // The worker collects these from the registry, along with anyone who joins later.
            guard.insert(key.clone(), callback.take().into_iter().collect());
        }

        debug!(key = ?key, "cache miss; scheduling fetch");
        self.inner.stats.record_fetch_started();
        let weak = Arc::downgrade(&self.inner);
        self.pool.spawn(move || populate(weak, key, callback));
    }

    /// Get an item, fetching and decoding it on the calling thread if it isn't cached.
    ///
    /// This blocks for as long as the fetcher does, and reports errors instead of swallowing them.  No notifications
    /// are sent: the caller already has the value.
    pub fn load(&self, key: &F::Key) -> Result<Arc<V>, CacheError<V::Error>> {
        let hit = self.inner.lock_store().get(key);
        if let Some(v) = hit {
            self.inner.stats.record_hit();
            return Ok(v);
        }

        self.inner.stats.record_miss();
        match self.inner.fetch_and_decode(key) {
            Ok(decoded) => {
                let value = Arc::new(decoded);
                self.inner
                    .lock_store()
                    .insert_shared(key.clone(), value.clone());
                Ok(value)
            }
            Err(e) => {
                self.inner.record_failure(key, &e);
                Err(e)
            }
        }
    }

    /// Put a value in directly, replacing any previous one.  Returns the replaced value.
    pub fn insert(&self, key: F::Key, value: V) -> Option<Arc<V>> {
        self.inner.lock_store().insert(key, value)
    }

    /// Remove an item from the cache.
    pub fn remove(&self, key: &F::Key) -> Option<Arc<V>> {
        self.inner.lock_store().remove(key)
    }

    /// Is this key cached?  Doesn't fetch, and doesn't count as a use.
    pub fn contains_key(&self, key: &F::Key) -> bool {
        self.inner.lock_store().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock_store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock_store().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock_store().capacity()
    }

    /// Drop every cached entry.  Fetches in flight keep going and will populate the store when they land.
    pub fn clear(&self) {
        self.inner.lock_store().clear();
    }

    /// Register the cache-wide handler for successful fetches, replacing any previous one.
    pub fn set_on_fetched<H>(&self, handler: H)
    where
        H: Fn(&F::Key, Arc<V>) + Send + Sync + 'static,
    {
        *self
            .inner
            .on_fetched
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    pub fn clear_on_fetched(&self) {
        *self
            .inner
            .on_fetched
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn stats(&self) -> CacheStats {
        let (evictions, entries) = {
            let store = self.inner.lock_store();
            (store.evictions(), store.len())
        };
        self.inner.stats.snapshot(evictions, entries)
    }

    pub fn fetcher(&self) -> &F {
        &self.inner.fetcher
    }

    pub fn max_concurrent_fetches(&self) -> usize {
        self.pool.max_concurrent()
    }

    /// Fetches queued or running.
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Block until no fetches are queued or running, or the timeout passes.  Returns whether the pool went idle.
    ///
    /// Notifications for the finished fetches have been handed to the dispatcher by then, but may not have run.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.pool.wait_idle(timeout)
    }

    /// Tear the cache down, giving in-flight fetches up to `timeout` to finish first.  Returns whether they did.
    pub fn shutdown(mut self, timeout: Duration) -> bool {
        self.pool.shutdown(timeout)
    }
}

impl<F: Fetcher, V: Asset> Drop for FetchCache<F, V> {
    fn drop(&mut self) {
        // Workers and queued notifications check this before touching anything.
        self.inner.live.store(false, Ordering::Release);
    }
}
