//! Read-through command caches.
//!
//! A [`CommandCache`] pairs a named, pluggable [`CacheStore`] with an
//! optional hook pair translating between the storage form `F` and the
//! client-visible form `T`. A lookup answers [`CacheLookup::Miss`] or
//! [`CacheLookup::Hit`]; since `T` may itself be an `Option`, a present
//! value that is absent (`Hit(None)`) stays distinguishable from a miss.
//!
//! Distributed backends are external collaborators: implement [`CacheStore`]
//! over the remote client and build the cache with
//! [`CacheConfig::external`], which leaves `put_enabled` off because the
//! server is assumed authoritative.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Truncation bound for [`CommandCache::dump`] output.
const DUMP_MAX_CHARS: usize = 4096;

/// Outcome of a cache lookup.
///
/// `Miss` means no usable entry (no entry, expired entry, disabled cache,
/// or a get-hook veto). `Hit` carries the client-visible value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup<T> {
    Miss,
    Hit(T),
}

impl<T> CacheLookup<T> {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, CacheLookup::Miss)
    }

    /// Extract the hit value, if any.
    pub fn into_hit(self) -> Option<T> {
        match self {
            CacheLookup::Hit(v) => Some(v),
            CacheLookup::Miss => None,
        }
    }
}

/// Cache behavior switches.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Master switch; a disabled cache always misses and never stores.
    pub enabled: bool,
    /// Gate for write-through on success.
    pub put_enabled: bool,
    /// Entry bound for size-aware stores.
    pub max_size: Option<usize>,
    /// Entry lifetime for TTL-aware stores.
    pub ttl: Option<Duration>,
    /// Name of the backing cache on an external server, when one exists.
    pub external_name: Option<String>,
}

impl CacheConfig {
    pub fn new() -> Self {
        Self { enabled: true, put_enabled: true, max_size: None, ttl: None, external_name: None }
    }

    /// Config for an adapter over an external cache server. The server is
    /// assumed authoritative, so write-through starts disabled.
    pub fn external(external_name: impl Into<String>) -> Self {
        Self {
            enabled: true,
            put_enabled: false,
            max_size: None,
            ttl: None,
            external_name: Some(external_name.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::new() }
    }

    pub fn with_put_enabled(mut self, put_enabled: bool) -> Self {
        self.put_enabled = put_enabled;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Backing store holding values in their storage form.
pub trait CacheStore<F>: Send + Sync {
    fn get(&self, key: &str) -> Option<F>;
    /// False signals a backend error; the caller treats it as a degraded
    /// store, never a command failure.
    fn put(&self, key: &str, value: F) -> bool;
    fn clear(&self);
    fn len(&self) -> usize;
    /// Keys currently held, for diagnostics.
    fn keys(&self) -> Vec<String>;
}

/// Unbounded in-memory store. No eviction; entries live until cleared.
#[derive(Debug)]
pub struct MemoryStore<F> {
    entries: Mutex<HashMap<String, F>>,
}

impl<F> MemoryStore<F> {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }
}

impl<F> Default for MemoryStore<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Clone + Send + Sync> CacheStore<F> for MemoryStore<F> {
    fn get(&self, key: &str) -> Option<F> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).get(key).cloned()
    }

    fn put(&self, key: &str, value: F) -> bool {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).insert(key.to_string(), value);
        true
    }

    fn clear(&self) {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn keys(&self) -> Vec<String> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).keys().cloned().collect()
    }
}

struct TtlEntry<F> {
    value: F,
    inserted_at: Instant,
    last_access: Instant,
}

/// Size-bounded store with TTL expiry and access-recency eviction.
pub struct TtlStore<F> {
    entries: Mutex<HashMap<String, TtlEntry<F>>>,
    max_size: usize,
    ttl: Option<Duration>,
}

impl<F> TtlStore<F> {
    pub fn new(max_size: usize, ttl: Option<Duration>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), max_size: max_size.max(1), ttl }
    }

    fn is_expired(&self, entry: &TtlEntry<F>) -> bool {
        match self.ttl {
            Some(ttl) => entry.inserted_at.elapsed() > ttl,
            None => false,
        }
    }
}

impl<F> std::fmt::Debug for TtlStore<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlStore")
            .field("max_size", &self.max_size)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl<F: Clone + Send + Sync> CacheStore<F> for TtlStore<F> {
    fn get(&self, key: &str) -> Option<F> {
        let mut guard = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let expired = match guard.get(key) {
            Some(entry) => self.is_expired(entry),
            None => return None,
        };
        if expired {
            guard.remove(key);
            return None;
        }
        let entry = guard.get_mut(key).expect("entry checked above");
        entry.last_access = Instant::now();
        Some(entry.value.clone())
    }

    fn put(&self, key: &str, value: F) -> bool {
        let mut guard = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if !guard.contains_key(key) && guard.len() >= self.max_size {
            // Evict the least-recently-accessed entry to make room.
            if let Some(stalest) = guard
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            {
                guard.remove(&stalest);
            }
        }
        let now = Instant::now();
        guard.insert(
            key.to_string(),
            TtlEntry { value, inserted_at: now, last_access: now },
        );
        true
    }

    fn clear(&self) {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn keys(&self) -> Vec<String> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).keys().cloned().collect()
    }
}

type GetHook<T, F> = Arc<dyn Fn(F) -> Option<T> + Send + Sync>;
type PutHook<T, F> = Arc<dyn Fn(&T) -> Option<F> + Send + Sync>;

/// Named read-through cache with a hook pair bridging storage and client
/// forms.
pub struct CommandCache<T, F = T> {
    name: String,
    config: CacheConfig,
    store: Arc<dyn CacheStore<F>>,
    get_hook: GetHook<T, F>,
    put_hook: PutHook<T, F>,
}

impl<T, F> Clone for CommandCache<T, F> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            config: self.config.clone(),
            store: self.store.clone(),
            get_hook: self.get_hook.clone(),
            put_hook: self.put_hook.clone(),
        }
    }
}

impl<T, F> std::fmt::Debug for CommandCache<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandCache")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("entries", &self.store.len())
            .finish()
    }
}

impl<T> CommandCache<T, T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Cache storing values as-is (identity hooks).
    pub fn new(
        name: impl Into<String>,
        config: CacheConfig,
        store: Arc<dyn CacheStore<T>>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            store,
            get_hook: Arc::new(|raw| Some(raw)),
            put_hook: Arc::new(|value: &T| Some(value.clone())),
        }
    }

    /// Unbounded in-memory cache with default config.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::new(name, CacheConfig::new(), Arc::new(MemoryStore::new()))
    }

    /// Size-bounded TTL cache; bounds come from the config.
    pub fn bounded(name: impl Into<String>, config: CacheConfig) -> Self {
        let store = Arc::new(TtlStore::new(config.max_size.unwrap_or(1024), config.ttl));
        Self::new(name, config, store)
    }
}

impl<T, F> CommandCache<T, F>
where
    T: Send + Sync + 'static,
    F: Send + Sync + 'static,
{
    /// Cache with explicit translation hooks.
    ///
    /// The get hook maps a raw stored value to the client form and may veto
    /// the hit by returning None (the lookup becomes a miss). The put hook
    /// stages the value for storage and may skip the store by returning
    /// None. Hooks are infallible by construction; vetoes are not errors.
    pub fn with_hooks(
        name: impl Into<String>,
        config: CacheConfig,
        store: Arc<dyn CacheStore<F>>,
        get_hook: impl Fn(F) -> Option<T> + Send + Sync + 'static,
        put_hook: impl Fn(&T) -> Option<F> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            store,
            get_hook: Arc::new(get_hook),
            put_hook: Arc::new(put_hook),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a key. Disabled caches and empty keys always miss.
    pub fn get(&self, key: &str) -> CacheLookup<T> {
        if !self.config.enabled || key.is_empty() {
            return CacheLookup::Miss;
        }
        match self.store.get(key) {
            None => CacheLookup::Miss,
            Some(raw) => match (self.get_hook)(raw) {
                Some(value) => CacheLookup::Hit(value),
                None => {
                    tracing::debug!(cache = %self.name, key, "get hook vetoed cache hit");
                    CacheLookup::Miss
                }
            },
        }
    }

    /// Write a value through. The put hook stages first, then the
    /// enabled/put_enabled flags gate the store. Returns false only on a
    /// backend error.
    pub fn put(&self, key: &str, value: &T) -> bool {
        if key.is_empty() {
            return true;
        }
        let staged = match (self.put_hook)(value) {
            Some(staged) => staged,
            None => {
                tracing::debug!(cache = %self.name, key, "put hook skipped store");
                return true;
            }
        };
        if !self.config.enabled || !self.config.put_enabled {
            return true;
        }
        let stored = self.store.put(key, staged);
        if !stored {
            tracing::warn!(cache = %self.name, key, "cache backend rejected put");
        }
        stored
    }

    /// Purge all entries.
    pub fn empty(&self) {
        self.store.clear();
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.len() == 0
    }

    /// Diagnostic listing of the cache contents, truncated past a fixed
    /// bound.
    pub fn dump(&self) -> String {
        let mut keys = self.store.keys();
        keys.sort();
        let mut out = format!("{}[{}]{{", self.name, keys.len());
        for (i, key) in keys.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(key);
            if out.len() > DUMP_MAX_CHARS {
                out.truncate(DUMP_MAX_CHARS);
                out.push_str("...");
                return out;
            }
        }
        out.push('}');
        out
    }
}

/// Type-erased view of a named cache, for the engine's registry and
/// operational tooling.
pub trait AnyCache: Send + Sync {
    fn name(&self) -> &str;
    fn empty(&self);
    fn dump(&self) -> String;
    fn len(&self) -> usize;
}

impl<T, F> AnyCache for CommandCache<T, F>
where
    T: Send + Sync + 'static,
    F: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.name()
    }

    fn empty(&self) {
        self.empty()
    }

    fn dump(&self) -> String {
        self.dump()
    }

    fn len(&self) -> usize {
        self.len()
    }
}
