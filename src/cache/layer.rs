//! Cache layer that orchestrates caching logic with network fetching.

use chrono::Duration;
use futures::FutureExt as _;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::batch::{BatchOptions, BatchResult, BatchThrottler};
use super::clock::{Clock, SystemClock};
use super::dedupe::{FetchDeduplicator, SharedFetch};
use super::entry::{CacheEntry, CacheResult, EntryStatus};
use super::error::{CacheError, TransportError};
use super::invalidate::{InvalidateOptions, Invalidation, InvalidationEngine, InvalidationReport};
use super::key::CacheKey;
use super::mutation::{MutationCoordinator, MutationOutcome, MutationPlan};
use super::store::{CacheStore, Fetcher, StoreConfig, SubscriberId};

/// Settings for a [`CacheLayer`].
#[derive(Debug, Clone, Default)]
pub struct LayerConfig {
  pub store: StoreConfig,
  pub batch: BatchOptions,
}

/// Per-read options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
  /// Freshness budget for this key; the store default when unset
  pub stale_after: Option<Duration>,
}

impl QueryOptions {
  pub fn stale_after(stale_after: Duration) -> Self {
    Self {
      stale_after: Some(stale_after),
    }
  }
}

/// Cache layer that manages caching logic and network fetching.
///
/// One instance owns one store; clone it to share the same cache between
/// callers. Independent instances never see each other's data.
#[derive(Clone)]
pub struct CacheLayer {
  store: CacheStore,
  dedupe: FetchDeduplicator,
  invalidation: InvalidationEngine,
  mutations: MutationCoordinator,
  batches: BatchThrottler,
}

impl CacheLayer {
  pub fn new(config: LayerConfig) -> Self {
    Self::with_clock(config, Arc::new(SystemClock))
  }

  pub fn with_clock(config: LayerConfig, clock: Arc<dyn Clock>) -> Self {
    let store = CacheStore::with_clock(config.store, clock);
    let dedupe = FetchDeduplicator::new(store.clone());
    let invalidation = InvalidationEngine::new(store.clone(), dedupe.clone());
    let mutations = MutationCoordinator::new(store.clone(), invalidation.clone());
    Self {
      store,
      dedupe,
      invalidation,
      mutations,
      batches: BatchThrottler::new(config.batch),
    }
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  pub fn deduplicator(&self) -> &FetchDeduplicator {
    &self.dedupe
  }

  fn prepare<F, Fut>(&self, key: &CacheKey, options: QueryOptions, fetcher: F) -> Fetcher
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TransportError>> + Send + 'static,
  {
    let stale_after = options
      .stale_after
      .unwrap_or(self.store.config().default_stale_after);
    self.store.set_stale_after(key, stale_after);
    let fetcher: Fetcher = Arc::new(move || fetcher().boxed());
    self.store.register_fetcher(key, Arc::clone(&fetcher));
    fetcher
  }

  fn start_fetch(&self, key: &CacheKey, fetcher: Fetcher) -> SharedFetch {
    self.dedupe.fetch(key, move || fetcher())
  }

  /// Read a key with stale-while-revalidate semantics.
  ///
  /// 1. Fresh cache: return it, no network
  /// 2. Stale cache: return it immediately and refetch in the background
  /// 3. Last fetch failed: return the last good value (offline) and retry
  /// 4. No cached value: wait for the (deduplicated) fetch
  pub async fn fetch<F, Fut>(
    &self,
    key: &CacheKey,
    options: QueryOptions,
    fetcher: F,
  ) -> Result<CacheResult<Value>, CacheError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TransportError>> + Send + 'static,
  {
    let fetcher = self.prepare(key, options, fetcher);
    let entry = self.store.get(key);

    if self.store.is_fresh(&entry) {
      if let Some(value) = entry.value.clone() {
        trace!(key = %key, "cache hit");
        return Ok(CacheResult::from_cache(value, entry.fetched_at, false));
      }
    }

    match entry.value.clone() {
      Some(value) => {
        debug!(key = %key, status = ?entry.status, "serving stale value, revalidating");
        // The spawned fetch writes its result into the store on its own
        drop(self.start_fetch(key, fetcher));
        if entry.status == EntryStatus::Error {
          Ok(CacheResult::offline(value, entry.fetched_at))
        } else {
          Ok(CacheResult::from_cache(value, entry.fetched_at, true))
        }
      }
      None => {
        let value = self.start_fetch(key, fetcher).await?;
        Ok(CacheResult::from_network(value))
      }
    }
  }

  /// Start fetching a key unless it is fresh. Returns the pending fetch, if any.
  pub fn prefetch<F, Fut>(&self, key: &CacheKey, options: QueryOptions, fetcher: F) -> Option<SharedFetch>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TransportError>> + Send + 'static,
  {
    let fetcher = self.prepare(key, options, fetcher);
    let entry = self.store.get(key);
    if self.store.is_fresh(&entry) {
      return None;
    }
    Some(self.start_fetch(key, fetcher))
  }

  /// Subscribe to a key. The listener sees every later transition; the
  /// current state is available from [`Subscription::snapshot`].
  ///
  /// A missing or stale entry is fetched right away.
  pub fn watch<F, Fut, L>(
    &self,
    key: CacheKey,
    options: QueryOptions,
    fetcher: F,
    listener: L,
  ) -> Subscription
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TransportError>> + Send + 'static,
    L: Fn(&CacheEntry) + Send + Sync + 'static,
  {
    let fetcher = self.prepare(&key, options, fetcher);
    let id = self.store.subscribe(&key, Arc::new(listener));
    let entry = self.store.get(&key);
    if !self.store.is_fresh(&entry) {
      drop(self.start_fetch(&key, fetcher));
    }
    Subscription {
      store: self.store.clone(),
      key,
      id: Some(id),
    }
  }

  /// Invalidate every entry at or below `prefix`.
  pub fn invalidate(&self, prefix: &CacheKey, options: InvalidateOptions) -> InvalidationReport {
    self.invalidation.invalidate(prefix, options)
  }

  pub fn invalidate_all(&self, invalidations: &[Invalidation]) -> InvalidationReport {
    self.invalidation.invalidate_all(invalidations)
  }

  /// Run a mutation through the coordinator.
  pub async fn mutate<F, Fut>(
    &self,
    plan: MutationPlan,
    mutate_fn: F,
  ) -> Result<MutationOutcome, CacheError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, TransportError>>,
  {
    self.mutations.mutate(plan, mutate_fn).await
  }

  /// Run independent operations one at a time with this layer's throttling.
  pub async fn run_batch<I, T, E, F, Fut>(
    &self,
    label: &str,
    items: Vec<I>,
    executor: F,
  ) -> BatchResult<I, T, E>
  where
    I: Clone,
    E: std::fmt::Display,
    F: FnMut(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    self.batches.run_batch(label, items, executor).await
  }

  /// Evict entries that have been unwatched for the grace period.
  pub fn collect_garbage(&self) -> usize {
    self.store.collect_garbage().len()
  }

  /// Periodically collect garbage until the returned handle is aborted.
  pub fn spawn_janitor(&self, every: std::time::Duration) -> JoinHandle<()> {
    let store = self.store.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        store.collect_garbage();
      }
    })
  }
}

/// A registered listener. Dropping it unsubscribes.
///
/// Unsubscribing never cancels a fetch that is already in flight.
pub struct Subscription {
  store: CacheStore,
  key: CacheKey,
  id: Option<SubscriberId>,
}

impl Subscription {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Current state of the watched entry.
  pub fn snapshot(&self) -> Arc<CacheEntry> {
    self.store.get(&self.key)
  }

  pub fn unsubscribe(mut self) {
    self.release();
  }

  fn release(&mut self) {
    if let Some(id) = self.id.take() {
      self.store.unsubscribe(&self.key, id);
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.release();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("id", &self.id)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use crate::cache::entry::CacheSource;
  use crate::cache_key;
  use parking_lot::Mutex;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn layer() -> (CacheLayer, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    (CacheLayer::with_clock(LayerConfig::default(), clock.clone()), clock)
  }

  /// Returns `{"n": <call number>}` after a short delay.
  fn numbered(
    calls: Arc<AtomicUsize>,
  ) -> impl Fn() -> futures::future::BoxFuture<'static, Result<Value, TransportError>> + Send + Sync
  {
    move || {
      let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
      async move {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        Ok(json!({ "n": n }))
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn cold_read_goes_to_network_then_hits_cache() {
    let (layer, _) = layer();
    let key = cache_key!["campaigns", "stats"];
    let calls = Arc::new(AtomicUsize::new(0));
    let opts = QueryOptions::stale_after(Duration::minutes(5));

    let first = layer.fetch(&key, opts, numbered(calls.clone())).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = layer.fetch(&key, opts, numbered(calls.clone())).await.unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data, json!({"n": 1}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn stale_read_returns_old_value_while_revalidating() {
    let (layer, clock) = layer();
    let key = cache_key!["campaigns", "detail", 1];
    let calls = Arc::new(AtomicUsize::new(0));
    let opts = QueryOptions::stale_after(Duration::seconds(30));

    layer.fetch(&key, opts, numbered(calls.clone())).await.unwrap();
    clock.advance(Duration::seconds(31));

    let stale = layer.fetch(&key, opts, numbered(calls.clone())).await.unwrap();
    assert_eq!(stale.source, CacheSource::CacheStale);
    assert_eq!(stale.data, json!({"n": 1}));
    assert!(layer.deduplicator().is_in_flight(&key));

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    let entry = layer.store().get(&key);
    assert_eq!(entry.value, Some(json!({"n": 2})));
    assert!(layer.store().is_fresh(&entry));
  }

  #[tokio::test]
  async fn failed_revalidation_serves_offline_value() {
    let (layer, clock) = layer();
    let key = cache_key!["invoices", "stats"];
    let opts = QueryOptions::stale_after(Duration::seconds(30));
    layer.store().set_stale_after(&key, Duration::seconds(30));
    layer.store().write(&key, json!({"open": 2}));
    clock.advance(Duration::minutes(1));

    let failing = || async { Err::<Value, _>(TransportError::Timeout) };
    let stale = layer.fetch(&key, opts, failing).await.unwrap();
    assert_eq!(stale.source, CacheSource::CacheStale);
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let offline = layer.fetch(&key, opts, failing).await.unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.data, json!({"open": 2}));
  }

  #[tokio::test]
  async fn cold_read_failure_is_an_error() {
    let (layer, _) = layer();
    let key = cache_key!["tasks", "list"];
    let err = layer
      .fetch(&key, QueryOptions::default(), || async {
        Err::<Value, _>(TransportError::Network("down".into()))
      })
      .await
      .unwrap_err();
    assert!(matches!(err, CacheError::Fetch { .. }));
    assert_eq!(layer.store().get(&key).status, EntryStatus::Error);
  }

  #[tokio::test]
  async fn watch_fetches_and_notifies_until_dropped() {
    let (layer, _) = layer();
    let key = cache_key!["entities", "list"];
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let subscription = layer.watch(
      key.clone(),
      QueryOptions::default(),
      numbered(calls.clone()),
      move |entry: &CacheEntry| sink.lock().push(entry.status),
    );
    assert_eq!(subscription.snapshot().status, EntryStatus::Loading);
    assert_eq!(subscription.snapshot().subscriber_count, 1);

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert_eq!(*seen.lock(), vec![EntryStatus::Loading, EntryStatus::Fresh]);

    drop(subscription);
    assert_eq!(layer.store().get(&key).subscriber_count, 0);

    layer
      .invalidate(&key, InvalidateOptions::default())
      .settled()
      .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(seen.lock().len(), 2);
  }

  #[tokio::test]
  async fn watching_a_fresh_entry_does_not_fetch() {
    let (layer, _) = layer();
    let key = cache_key!["contracts", "detail", 3];
    layer.store().set_stale_after(&key, Duration::minutes(5));
    layer.store().write(&key, json!({"id": 3}));
    let calls = Arc::new(AtomicUsize::new(0));

    let subscription = layer.watch(
      key.clone(),
      QueryOptions::stale_after(Duration::minutes(5)),
      numbered(calls.clone()),
      |_: &CacheEntry| {},
    );
    assert_eq!(subscription.snapshot().status, EntryStatus::Fresh);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn janitor_evicts_idle_entries() {
    let (layer, clock) = layer();
    let key = cache_key!["tasks", "detail", 1];
    layer.store().write(&key, json!({}));

    let janitor = layer.spawn_janitor(std::time::Duration::from_secs(60));
    clock.advance(Duration::minutes(6));
    tokio::time::sleep(std::time::Duration::from_secs(61)).await;

    assert!(layer.store().peek(&key).is_none());
    janitor.abort();
  }
}
