//! Capacity-bounded key/value cache.
//!
//! Entries are evicted coldest-first (least recently touched) when the
//! cache fills up, or by an optional background sweeper once the map
//! crosses its retain threshold. Nothing expires on elapsed time alone.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default sweep period for [`BoundedCache::start_sweeper`].
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Errors produced when building a cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
}

/// Sizing and sweep settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Hard upper bound on the number of entries.
    pub capacity: usize,
    /// Fraction of `capacity` kept after an eviction pass, in `(0, 1]`.
    /// With 0.8 the coldest 20% (plus any overflow) is dropped.
    pub threshold: f64,
    /// Period of the background sweeper.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            threshold: 0.8,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Invoked for every evicted entry, while the cache lock is held.
pub type RemovalCallback<K, V> = Box<dyn Fn(K, V) + Send + Sync>;

struct Entry<V> {
    value: V,
    touched_at: Instant,
    touch_seq: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    next_seq: u64,
    evictions: u64,
    on_removal: Option<RemovalCallback<K, V>>,
}

struct Shared<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
    retain: usize,
    sweep_interval: Duration,
    sweeper: Mutex<Option<CancellationToken>>,
}

/// Thread-safe bounded cache. Clones share the same storage.
pub struct BoundedCache<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for BoundedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> std::fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("capacity", &self.shared.capacity)
            .field("retain", &self.shared.retain)
            .finish_non_exhaustive()
    }
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty cache.
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        if config.capacity == 0 {
            return Err(CacheError::InvalidConfig("capacity must be > 0".into()));
        }
        if !(config.threshold > 0.0 && config.threshold <= 1.0) {
            return Err(CacheError::InvalidConfig(format!(
                "threshold must be in (0, 1], got {}",
                config.threshold
            )));
        }
        if config.sweep_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "sweep interval must be non-zero".into(),
            ));
        }
        let retain = (config.capacity as f64 * config.threshold).floor() as usize;
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    entries: HashMap::new(),
                    next_seq: 0,
                    evictions: 0,
                    on_removal: None,
                }),
                capacity: config.capacity,
                retain,
                sweep_interval: config.sweep_interval,
                sweeper: Mutex::new(None),
            }),
        })
    }

    /// Registers the eviction callback, replacing any previous one.
    pub fn on_removal(&self, callback: RemovalCallback<K, V>) {
        self.lock().on_removal = Some(callback);
    }

    /// Inserts or replaces a value and refreshes its touch time.
    ///
    /// Inserting a new key into a full cache first evicts the coldest
    /// entries down to the retain bound.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let mut inner = self.lock();
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.shared.capacity {
            let target = self.shared.retain.min(self.shared.capacity - 1);
            evict_to(&mut inner, target);
        }
        let entry = Entry {
            value,
            touched_at: Instant::now(),
            touch_seq: inner.bump_seq(),
        };
        inner.entries.insert(key, entry).map(|old| old.value)
    }

    /// Removes a value without invoking the eviction callback.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().entries.remove(key).map(|e| e.value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Total entries evicted by capacity pressure or the sweeper.
    pub fn evictions(&self) -> u64 {
        self.lock().evictions
    }

    /// Drops every entry without invoking the eviction callback.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Runs one sweep: if the map holds more than the retain bound, evicts
    /// the coldest entries down to it. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        sweep_shared(&self.shared)
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Returns a clone of the value and refreshes its touch time.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.lock();
        let seq = inner.bump_seq();
        let entry = inner.entries.get_mut(key)?;
        entry.touched_at = Instant::now();
        entry.touch_seq = seq;
        Some(entry.value.clone())
    }
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    /// Starts the background sweeper on the current tokio runtime.
    ///
    /// Restarting replaces the previous sweeper. The task exits when
    /// [`stop_sweeper`](Self::stop_sweeper) is called or every cache handle
    /// has been dropped.
    pub fn start_sweeper(&self) {
        let cancel = CancellationToken::new();
        {
            let mut slot = self
                .shared
                .sweeper
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = slot.replace(cancel.clone()) {
                previous.cancel();
            }
        }

        let weak: Weak<Shared<K, V>> = Arc::downgrade(&self.shared);
        let period = self.shared.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(shared) = weak.upgrade() else {
                            break;
                        };
                        let evicted = sweep_shared(&shared);
                        if evicted > 0 {
                            debug!(evicted, "cache sweep evicted entries");
                        }
                    }
                }
            }
        });
    }

    /// Stops the background sweeper, if running.
    pub fn stop_sweeper(&self) {
        let mut slot = self
            .shared
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(cancel) = slot.take() {
            cancel.cancel();
        }
    }
}

impl<K, V> Inner<K, V> {
    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

fn sweep_shared<K: Eq + Hash + Clone, V>(shared: &Shared<K, V>) -> usize {
    let mut inner = shared.inner.lock().unwrap_or_else(PoisonError::into_inner);
    if inner.entries.len() <= shared.retain {
        return 0;
    }
    evict_to(&mut inner, shared.retain)
}

/// Removes coldest entries until at most `target` remain.
fn evict_to<K: Eq + Hash + Clone, V>(inner: &mut Inner<K, V>, target: usize) -> usize {
    let excess = inner.entries.len().saturating_sub(target);
    if excess == 0 {
        return 0;
    }

    let mut order: Vec<(Instant, u64, K)> = inner
        .entries
        .iter()
        .map(|(k, e)| (e.touched_at, e.touch_seq, k.clone()))
        .collect();
    order.sort_unstable_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    for (_, _, key) in order.into_iter().take(excess) {
        if let Some(entry) = inner.entries.remove(&key)
            && let Some(callback) = &inner.on_removal
        {
            callback(key, entry.value);
        }
    }
    inner.evictions += excess as u64;
    excess
}
