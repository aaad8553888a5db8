//! The two cache tiers and the detached cache writer
//!
//! Both caches are non-throwing by contract: a failed read is a miss and a
//! failed write is a logged no-op. Caching must never fail the request path.

use eyre::Result;
use serde_json::Value;
use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

/// Short-TTL in-memory cache for full JSON response bodies
///
/// Serves repeated cacheable calls at the HTTP boundary without touching the
/// dispatcher. Entries expire after their per-entry TTL and the map is capped;
/// when full, the entries closest to expiry are dropped first.
pub struct EdgeCache {
    entries: RwLock<HashMap<String, EdgeEntry>>,
    max_items: usize,
}

struct EdgeEntry {
    body: Value,
    expires_at: Instant,
}

impl EdgeCache {
    /// Creates an edge cache holding at most `max_items` bodies
    pub fn new(max_items: usize) -> Self {
        Self { entries: RwLock::new(HashMap::new()), max_items }
    }

    /// Retrieves a cached body, treating expired entries as misses
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                debug!("Edge cache hit: {}", key);
                Some(entry.body.clone())
            }
            Some(_) => {
                debug!("Edge cache entry expired: {}", key);
                entries.remove(key);
                None
            }
            None => {
                debug!("Edge cache miss: {}", key);
                None
            }
        }
    }

    /// Stores a body under `key` for `ttl`
    pub async fn put(&self, key: String, body: Value, ttl: Duration) {
        let mut entries = self.entries.write().await;

        if entries.len() >= self.max_items {
            Self::evict(&mut entries, self.max_items);
        }

        entries.insert(key.clone(), EdgeEntry { body, expires_at: Instant::now() + ttl });
        debug!("Edge cache stored: {}", key);
    }

    /// Number of live entries (expired entries may still be counted)
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when the cache holds no entries
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn evict(entries: &mut HashMap<String, EdgeEntry>, max_items: usize) {
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);

        if entries.len() < max_items {
            return;
        }

        // Still full after dropping expired entries: shed those closest to expiry.
        let count = entries.len() / 10 + 1;
        let mut by_expiry: Vec<(String, Instant)> =
            entries.iter().map(|(k, e)| (k.clone(), e.expires_at)).collect();
        by_expiry.sort_by_key(|(_, expires_at)| *expires_at);

        for (key, _) in by_expiry.into_iter().take(count) {
            entries.remove(&key);
        }

        debug!("Evicted {} edge cache entries to stay under {}", count, max_items);
    }
}

/// Long-lived cache for name-resolution results with JSON file persistence
///
/// Keys map to the cached `result` value of a resolution call. The store has
/// no TTL of its own; expiry is the owning deployment's policy. Persistence
/// failures are logged and swallowed so the in-memory cache keeps serving.
pub struct ResolverCache {
    entries: RwLock<HashMap<String, Value>>,
    file_path: Option<PathBuf>,
}

impl ResolverCache {
    /// Creates a resolver cache, loading prior entries from `file_path`
    ///
    /// A missing or unreadable file starts the cache empty rather than
    /// failing; `None` disables persistence (useful in tests).
    pub fn new(file_path: Option<PathBuf>) -> Self {
        let entries = match &file_path {
            Some(path) if path.exists() => match fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str::<HashMap<String, Value>>(&content) {
                    Ok(loaded) => {
                        info!("Loaded {} resolver cache entries from disk", loaded.len());
                        loaded
                    }
                    Err(e) => {
                        warn!("Failed to parse resolver cache file, starting empty: {}", e);
                        HashMap::new()
                    }
                },
                Err(e) => {
                    warn!("Failed to read resolver cache file, starting empty: {}", e);
                    HashMap::new()
                }
            },
            _ => HashMap::new(),
        };

        Self { entries: RwLock::new(entries), file_path }
    }

    /// Retrieves a cached resolution result
    pub async fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().await;
        let hit = entries.get(key).cloned();
        if hit.is_some() {
            debug!("Resolver cache hit: {}", key);
        } else {
            debug!("Resolver cache miss: {}", key);
        }
        hit
    }

    /// Stores a resolution result under `key`
    pub async fn put(&self, key: String, value: Value) {
        let mut entries = self.entries.write().await;
        entries.insert(key.clone(), value);
        debug!("Resolver cache stored: {}", key);
    }

    /// Number of cached entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when the cache holds no entries
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Saves the cache to disk with an atomic temp-file write
    ///
    /// Errors are logged as warnings but not propagated; the in-memory cache
    /// remains available either way.
    pub async fn save_to_disk(&self) -> Result<()> {
        let Some(path) = &self.file_path else { return Ok(()) };

        let snapshot = self.entries.read().await.clone();
        match Self::write_atomically(path, &snapshot) {
            Ok(()) => {
                info!("Saved {} resolver cache entries to disk", snapshot.len());
                Ok(())
            }
            Err(e) => {
                warn!("Failed to save resolver cache: {}. In-memory cache remains available.", e);
                Ok(())
            }
        }
    }

    fn write_atomically(path: &PathBuf, snapshot: &HashMap<String, Value>) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_file = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(snapshot)?;

        fs::write(&temp_file, &content)?;
        fs::rename(&temp_file, path)?; // Atomic on most filesystems

        Ok(())
    }
}

/// A pending cache write
enum CacheWrite {
    Edge { key: String, body: Value, ttl: Duration },
    Resolver { key: String, value: Value },
    Flush(oneshot::Sender<()>),
}

/// Detached writer decoupling cache fills from the response path
///
/// Writes are enqueued and applied by a background task; the response is
/// never blocked on them and their failures are only logged. Tests call
/// [`CacheWriteQueue::flush`] to await all previously enqueued writes
/// deterministically.
#[derive(Clone)]
pub struct CacheWriteQueue {
    tx: mpsc::UnboundedSender<CacheWrite>,
}

impl CacheWriteQueue {
    /// Spawns the writer task over the given cache tiers
    pub fn spawn(edge: Arc<EdgeCache>, resolver: Arc<ResolverCache>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(write) = rx.recv().await {
                match write {
                    CacheWrite::Edge { key, body, ttl } => edge.put(key, body, ttl).await,
                    CacheWrite::Resolver { key, value } => resolver.put(key, value).await,
                    CacheWrite::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Cache write queue drained, worker exiting");
        });

        Self { tx }
    }

    /// Enqueues an edge-cache body write
    pub fn write_edge(&self, key: String, body: Value, ttl: Duration) {
        if self.tx.send(CacheWrite::Edge { key, body, ttl }).is_err() {
            warn!("Cache writer is gone, dropping edge cache write");
        }
    }

    /// Enqueues a resolver-cache result write
    pub fn write_resolver(&self, key: String, value: Value) {
        if self.tx.send(CacheWrite::Resolver { key, value }).is_err() {
            warn!("Cache writer is gone, dropping resolver cache write");
        }
    }

    /// Waits until every write enqueued before this call has been applied
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(CacheWrite::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}
