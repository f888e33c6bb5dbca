//! The executor's response cache: at-most-one execution per duplicate correlation, plus
//! cost/benefit-weighted eviction and background time-based expiry.
//!
//! Stale priority-queue entries are expected and tolerated; every pop is revalidated
//! against the authoritative primary map before anything is acted on.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::transport::PublishProperties;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache is not running")]
    NotRunning,
    #[error("cache queue corruption detected: peeked entry did not match the popped entry")]
    QueueCorruption,
}

/// Correlation data is opaque wire bytes (nominally a 16-byte UUID) — the cache keys on
/// the raw bytes rather than requiring them to parse, since its job is to echo a response
/// back verbatim, not to interpret the identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub response_topic: String,
    pub correlation: Vec<u8>,
}

/// A fully-built response message, ready to republish verbatim for a duplicate request.
#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub properties: PublishProperties,
}

/// The cost/benefit inputs needed to score an entry for eviction, gathered at store time.
#[derive(Debug, Clone, Copy)]
pub struct CacheCostInputs {
    pub unit_overhead: u64,
    pub request_len: u64,
    pub response_len: u64,
    pub fixed_proc_ms: u64,
    pub execution_ms: u64,
    pub idempotent: bool,
    pub command_expiration: Instant,
}

impl CacheCostInputs {
    fn cost(&self) -> u64 {
        self.unit_overhead + self.request_len + self.response_len
    }

    fn benefit(&self) -> u64 {
        self.fixed_proc_ms + self.execution_ms
    }

    fn score(&self) -> f64 {
        let cost = self.cost().max(1) as f64;
        self.benefit() as f64 / cost
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Fulfilled,
}

struct Entry {
    generation: u64,
    state: EntryState,
    sender: watch::Sender<Option<Arc<CachedMessage>>>,
    command_expiration: Instant,
    storage_size: u64,
}

struct ExpiryItem {
    expiration: Instant,
    key: CacheKey,
    generation: u64,
}

impl PartialEq for ExpiryItem {
    fn eq(&self, other: &Self) -> bool {
        self.expiration == other.expiration
    }
}
impl Eq for ExpiryItem {}
impl PartialOrd for ExpiryItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ExpiryItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest expiration sorts highest.
        other.expiration.cmp(&self.expiration)
    }
}

struct ScoreItem {
    score: f64,
    key: CacheKey,
    generation: u64,
}

impl PartialEq for ScoreItem {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}
impl Eq for ScoreItem {}
impl PartialOrd for ScoreItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScoreItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap inverted so the lowest score (first to evict) sorts highest.
        other.score.total_cmp(&self.score)
    }
}

struct Inner {
    map: HashMap<CacheKey, Entry>,
    expiry_queue: BinaryHeap<ExpiryItem>,
    score_queue: BinaryHeap<ScoreItem>,
    aggregate_payload_bytes: u64,
    next_generation: u64,
    running: bool,
    /// Set once the expiry worker observes the expiry queue disagreeing with itself under
    /// its own lock. Fatal: every subsequent call reports `QueueCorruption` instead of the
    /// ordinary `NotRunning`, since the cache's invariants can no longer be trusted.
    poisoned: bool,
}

pub struct ResponseCacheConfig {
    pub max_entry_count: usize,
    pub max_aggregate_payload_bytes: u64,
    pub max_wait: Duration,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            max_entry_count: 10_000,
            max_aggregate_payload_bytes: 64 * 1024 * 1024,
            max_wait: Duration::from_secs(60),
        }
    }
}

/// A process-scoped, mutex-guarded cache of in-flight and completed command responses.
pub struct ResponseCache {
    inner: Arc<Mutex<Inner>>,
    config: ResponseCacheConfig,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
}

impl ResponseCache {
    pub fn new(config: ResponseCacheConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                map: HashMap::new(),
                expiry_queue: BinaryHeap::new(),
                score_queue: BinaryHeap::new(),
                aggregate_payload_bytes: 0,
                next_generation: 0,
                running: false,
                poisoned: false,
            })),
            config,
            expiry_task: Mutex::new(None),
        }
    }

    pub async fn start(&self) {
        let mut guard = self.inner.lock().await;
        guard.running = true;
        drop(guard);

        let inner = Arc::clone(&self.inner);
        let max_wait = self.config.max_wait;
        let handle = tokio::spawn(async move {
            expiry_loop(inner, max_wait).await;
        });
        *self.expiry_task.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        let mut guard = self.inner.lock().await;
        guard.running = false;
        drop(guard);
        if let Some(handle) = self.expiry_task.lock().await.take() {
            handle.abort();
        }
    }

    /// Looks up `key`. A hit returns a receiver that will observe the fulfilled response
    /// (shared by every concurrent duplicate); a miss inserts a pending placeholder so
    /// later duplicates join this caller's in-flight computation, and returns `None`.
    pub async fn retrieve(
        &self,
        key: CacheKey,
    ) -> Result<Option<watch::Receiver<Option<Arc<CachedMessage>>>>, CacheError> {
        let mut inner = self.inner.lock().await;
        if inner.poisoned {
            return Err(CacheError::QueueCorruption);
        }
        if !inner.running {
            return Err(CacheError::NotRunning);
        }
        if let Some(entry) = inner.map.get(&key) {
            debug!(response_topic = %key.response_topic, correlation = ?key.correlation, "cache hit");
            return Ok(Some(entry.sender.subscribe()));
        }
        let generation = inner.next_generation;
        inner.next_generation += 1;
        let (sender, _receiver) = watch::channel(None);
        inner.map.insert(
            key,
            Entry {
                generation,
                state: EntryState::Pending,
                sender,
                command_expiration: Instant::now(),
                storage_size: 0,
            },
        );
        Ok(None)
    }

    /// Fulfills the pending entry for `key` with `message`, then enqueues it for expiry
    /// and (if evictable) eviction scoring, and trims the cache.
    pub async fn store(
        &self,
        key: CacheKey,
        message: CachedMessage,
        cost: CacheCostInputs,
    ) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().await;
        if inner.poisoned {
            return Err(CacheError::QueueCorruption);
        }
        if !inner.running {
            return Err(CacheError::NotRunning);
        }

        let generation = {
            let Some(entry) = inner.map.get_mut(&key) else {
                // The executor had already evicted the placeholder under pressure.
                return Ok(());
            };
            entry.sender.send_replace(Some(Arc::new(message)));
            entry.state = EntryState::Fulfilled;
            entry.command_expiration = cost.command_expiration;
            entry.storage_size = cost.request_len + cost.response_len;
            inner.aggregate_payload_bytes += entry.storage_size;
            entry.generation
        };

        if Instant::now() >= cost.command_expiration {
            if let Some(entry) = inner.map.remove(&key) {
                inner.aggregate_payload_bytes = inner.aggregate_payload_bytes.saturating_sub(entry.storage_size);
            }
            return Ok(());
        }

        inner.expiry_queue.push(ExpiryItem {
            expiration: cost.command_expiration,
            key: key.clone(),
            generation,
        });

        let evictable = cost.idempotent || Instant::now() >= cost.command_expiration;
        if evictable {
            inner.score_queue.push(ScoreItem {
                score: cost.score(),
                key: key.clone(),
                generation,
            });
        }

        trim(&mut inner, &self.config);
        Ok(())
    }
}

fn trim(inner: &mut Inner, config: &ResponseCacheConfig) {
    while inner.map.len() > config.max_entry_count
        || inner.aggregate_payload_bytes > config.max_aggregate_payload_bytes
    {
        let Some(candidate) = inner.score_queue.pop() else {
            break;
        };
        let still_valid = inner
            .map
            .get(&candidate.key)
            .map(|entry| entry.generation == candidate.generation)
            .unwrap_or(false);
        if !still_valid {
            continue;
        }
        if let Some(entry) = inner.map.remove(&candidate.key) {
            inner.aggregate_payload_bytes = inner.aggregate_payload_bytes.saturating_sub(entry.storage_size);
        }
    }
}

async fn expiry_loop(inner: Arc<Mutex<Inner>>, max_wait: Duration) {
    loop {
        let next_wait = {
            let guard = inner.lock().await;
            if !guard.running {
                return;
            }
            match guard.expiry_queue.peek() {
                Some(item) => item
                    .expiration
                    .saturating_duration_since(Instant::now())
                    .min(max_wait),
                None => max_wait,
            }
        };

        tokio::time::sleep(next_wait).await;

        let mut guard = inner.lock().await;
        if !guard.running {
            return;
        }
        let Some(peeked_key) = guard.expiry_queue.peek().map(|item| (item.key.clone(), item.generation)) else {
            continue;
        };
        let Some(popped) = guard.expiry_queue.pop() else {
            continue;
        };
        if popped.key != peeked_key.0 || popped.generation != peeked_key.1 {
            // The only fatal condition: the queue disagreed with itself under a single lock.
            // Poisons the cache rather than just stopping it, so callers see `QueueCorruption`
            // and surface an internal-logic-error response instead of treating this like an
            // ordinary `stop()`.
            warn!("response cache expiry queue corruption detected");
            guard.running = false;
            guard.poisoned = true;
            return;
        }
        let still_current = guard
            .map
            .get(&popped.key)
            .map(|entry| entry.generation == popped.generation)
            .unwrap_or(false);
        if still_current {
            if let Some(entry) = guard.map.remove(&popped.key) {
                guard.aggregate_payload_bytes = guard.aggregate_payload_bytes.saturating_sub(entry.storage_size);
                debug!(response_topic = %popped.key.response_topic, "cache entry expired");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(correlation: u128) -> CacheKey {
        CacheKey {
            response_topic: "clients/a/req".to_string(),
            correlation: correlation.to_be_bytes().to_vec(),
        }
    }

    fn cost(idempotent: bool) -> CacheCostInputs {
        CacheCostInputs {
            unit_overhead: 8,
            request_len: 10,
            response_len: 10,
            fixed_proc_ms: 1,
            execution_ms: 1,
            idempotent,
            command_expiration: Instant::now() + Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn duplicate_correlation_reuses_the_same_promise() {
        let cache = ResponseCache::new(ResponseCacheConfig::default());
        cache.start().await;
        let correlation = 1u128;

        let first = cache.retrieve(key(correlation)).await.unwrap();
        assert!(first.is_none());

        let mut second = cache.retrieve(key(correlation)).await.unwrap().unwrap();

        let message = CachedMessage {
            topic: "clients/a/req".to_string(),
            payload: b"{}".to_vec(),
            properties: PublishProperties::default(),
        };
        cache.store(key(correlation), message, cost(true)).await.unwrap();

        second.changed().await.unwrap();
        assert!(second.borrow().is_some());
        cache.stop().await;
    }

    #[tokio::test]
    async fn store_without_prior_retrieve_is_dropped_silently() {
        let cache = ResponseCache::new(ResponseCacheConfig::default());
        cache.start().await;
        let message = CachedMessage {
            topic: "clients/a/req".to_string(),
            payload: b"{}".to_vec(),
            properties: PublishProperties::default(),
        };
        cache
            .store(key(2u128), message, cost(true))
            .await
            .unwrap();
        cache.stop().await;
    }

    #[tokio::test]
    async fn trim_evicts_lowest_score_first() {
        let config = ResponseCacheConfig {
            max_entry_count: 1,
            ..ResponseCacheConfig::default()
        };
        let cache = ResponseCache::new(config);
        cache.start().await;

        let low = 10u128;
        let high = 20u128;
        cache.retrieve(key(low)).await.unwrap();
        let mut low_cost = cost(true);
        low_cost.fixed_proc_ms = 0;
        low_cost.execution_ms = 0;
        cache
            .store(
                key(low),
                CachedMessage {
                    topic: "t".into(),
                    payload: vec![],
                    properties: PublishProperties::default(),
                },
                low_cost,
            )
            .await
            .unwrap();

        cache.retrieve(key(high)).await.unwrap();
        let mut high_cost = cost(true);
        high_cost.fixed_proc_ms = 1000;
        cache
            .store(
                key(high),
                CachedMessage {
                    topic: "t".into(),
                    payload: vec![],
                    properties: PublishProperties::default(),
                },
                high_cost,
            )
            .await
            .unwrap();

        let inner = cache.inner.lock().await;
        assert!(!inner.map.contains_key(&key(low)));
        assert!(inner.map.contains_key(&key(high)));
        drop(inner);
        cache.stop().await;
    }

    #[tokio::test]
    async fn a_poisoned_cache_reports_queue_corruption_instead_of_not_running() {
        let cache = ResponseCache::new(ResponseCacheConfig::default());
        cache.start().await;
        {
            let mut inner = cache.inner.lock().await;
            inner.poisoned = true;
            inner.running = false;
        }

        assert!(matches!(
            cache.retrieve(key(1)).await,
            Err(CacheError::QueueCorruption)
        ));
        let message = CachedMessage {
            topic: "t".into(),
            payload: vec![],
            properties: PublishProperties::default(),
        };
        assert!(matches!(
            cache.store(key(1), message, cost(true)).await,
            Err(CacheError::QueueCorruption)
        ));
    }
}
