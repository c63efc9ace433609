//! Prefix invalidation with refetch of watched entries.

use futures::future::join_all;
use tracing::debug;

use super::dedupe::{FetchDeduplicator, SharedFetch};
use super::key::CacheKey;
use super::store::CacheStore;

/// How an invalidation treats matching entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidateOptions {
  /// Refetch matching entries that have subscribers right away
  pub refetch_active: bool,
  /// Discard values instead of marking them stale (use when a list's
  /// cardinality changed, e.g. after create or delete)
  pub reset: bool,
}

impl Default for InvalidateOptions {
  fn default() -> Self {
    Self {
      refetch_active: true,
      reset: false,
    }
  }
}

impl InvalidateOptions {
  pub fn reset() -> Self {
    Self {
      reset: true,
      ..Self::default()
    }
  }

  /// Mark stale without refetching anything now.
  pub fn lazy() -> Self {
    Self {
      refetch_active: false,
      ..Self::default()
    }
  }
}

/// A prefix together with how to invalidate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
  pub prefix: CacheKey,
  pub options: InvalidateOptions,
}

impl Invalidation {
  pub fn stale(prefix: CacheKey) -> Self {
    Self {
      prefix,
      options: InvalidateOptions::default(),
    }
  }

  pub fn reset(prefix: CacheKey) -> Self {
    Self {
      prefix,
      options: InvalidateOptions::reset(),
    }
  }
}

/// What an invalidation touched.
#[derive(Default)]
pub struct InvalidationReport {
  /// Number of entries at or below the prefix
  pub matched: usize,
  /// Keys whose refetch was started
  pub refetching: Vec<CacheKey>,
  pending: Vec<SharedFetch>,
}

impl InvalidationReport {
  fn merge(&mut self, other: InvalidationReport) {
    self.matched += other.matched;
    self.refetching.extend(other.refetching);
    self.pending.extend(other.pending);
  }

  /// Wait until every refetch started by this invalidation has settled.
  /// Failures are already recorded on the entries.
  pub async fn settled(self) {
    join_all(self.pending).await;
  }
}

impl std::fmt::Debug for InvalidationReport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InvalidationReport")
      .field("matched", &self.matched)
      .field("refetching", &self.refetching)
      .finish_non_exhaustive()
  }
}

/// Marks entries stale (or resets them) and refetches the watched ones.
#[derive(Clone)]
pub struct InvalidationEngine {
  store: CacheStore,
  dedupe: FetchDeduplicator,
}

impl InvalidationEngine {
  pub fn new(store: CacheStore, dedupe: FetchDeduplicator) -> Self {
    Self { store, dedupe }
  }

  /// Invalidate every entry equal to or below `prefix`.
  ///
  /// Must be called from within a tokio runtime when `refetch_active` is set.
  pub fn invalidate(&self, prefix: &CacheKey, options: InvalidateOptions) -> InvalidationReport {
    let touched = if options.reset {
      self.store.reset(prefix)
    } else {
      self.store.mark_stale(prefix)
    };

    let mut report = InvalidationReport {
      matched: touched.matched,
      ..InvalidationReport::default()
    };
    if !options.refetch_active {
      return report;
    }

    for key in touched.subscribed {
      // Unwatched entries refetch lazily on their next subscription
      let Some(pending) = self.refetch(&key) else {
        continue;
      };
      report.refetching.push(key);
      report.pending.push(pending);
    }
    debug!(
      prefix = %prefix,
      matched = report.matched,
      refetching = report.refetching.len(),
      reset = options.reset,
      "invalidated"
    );
    report
  }

  /// Refetch one key with its registered fetcher, joining any fetch already
  /// in flight. Returns `None` when no fetcher is registered.
  pub fn refetch(&self, key: &CacheKey) -> Option<SharedFetch> {
    let fetcher = self.store.fetcher(key)?;
    Some(self.dedupe.fetch(key, move || fetcher()))
  }

  /// Apply a list of invalidations in order.
  pub fn invalidate_all(&self, invalidations: &[Invalidation]) -> InvalidationReport {
    let mut report = InvalidationReport::default();
    for invalidation in invalidations {
      report.merge(self.invalidate(&invalidation.prefix, invalidation.options));
    }
    report
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::entry::{CacheEntry, EntryStatus};
  use crate::cache::error::TransportError;
  use crate::cache::key::Params;
  use crate::cache::store::{Fetcher, Listener, StoreConfig};
  use crate::cache_key;
  use futures::FutureExt as _;
  use serde_json::{json, Value};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  fn engine() -> (CacheStore, InvalidationEngine) {
    let store = CacheStore::new(StoreConfig::default());
    let dedupe = FetchDeduplicator::new(store.clone());
    (store.clone(), InvalidationEngine::new(store, dedupe))
  }

  fn fetcher(calls: Arc<AtomicUsize>, result: Result<Value, TransportError>) -> Fetcher {
    Arc::new(move || {
      calls.fetch_add(1, Ordering::SeqCst);
      let result = result.clone();
      async move { result }.boxed()
    })
  }

  fn noop_listener() -> Listener {
    Arc::new(|_: &CacheEntry| {})
  }

  #[tokio::test]
  async fn refetches_only_subscribed_entries() {
    let (store, engine) = engine();
    let watched = cache_key!["campaigns", "list", Params::new().with("status", "active")];
    let unwatched = cache_key!["campaigns", "list", Params::new().with("status", "draft")];
    let watched_calls = Arc::new(AtomicUsize::new(0));
    let unwatched_calls = Arc::new(AtomicUsize::new(0));

    store.write(&watched, json!([1]));
    store.write(&unwatched, json!([2]));
    store.register_fetcher(&watched, fetcher(watched_calls.clone(), Ok(json!([1, 3]))));
    store.register_fetcher(&unwatched, fetcher(unwatched_calls.clone(), Ok(json!([]))));
    store.subscribe(&watched, noop_listener());

    let report = engine.invalidate(&cache_key!["campaigns", "list"], InvalidateOptions::default());
    assert_eq!(report.matched, 2);
    assert_eq!(report.refetching, vec![watched.clone()]);
    report.settled().await;

    assert_eq!(watched_calls.load(Ordering::SeqCst), 1);
    assert_eq!(unwatched_calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.get(&watched).value, Some(json!([1, 3])));
    assert!(store.is_fresh(&store.get(&watched)));
    assert_eq!(store.get(&unwatched).status, EntryStatus::Stale);
  }

  #[tokio::test]
  async fn lazy_invalidation_refetches_nothing() {
    let (store, engine) = engine();
    let key = cache_key!["tasks", "detail", 1];
    let calls = Arc::new(AtomicUsize::new(0));
    store.write(&key, json!({}));
    store.register_fetcher(&key, fetcher(calls.clone(), Ok(json!({}))));
    store.subscribe(&key, noop_listener());

    let report = engine.invalidate(&key, InvalidateOptions::lazy());
    assert!(report.refetching.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.get(&key).status, EntryStatus::Stale);
  }

  #[tokio::test]
  async fn reset_shows_loading_instead_of_stale_data() {
    let (store, engine) = engine();
    let key = cache_key!["contracts", "list", Params::new()];
    let calls = Arc::new(AtomicUsize::new(0));
    store.write(&key, json!([1, 2]));
    store.register_fetcher(&key, fetcher(calls.clone(), Ok(json!([1, 2, 3]))));

    let statuses = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = statuses.clone();
    store.subscribe(
      &key,
      Arc::new(move |entry: &CacheEntry| sink.lock().push((entry.status, entry.value.clone()))),
    );

    engine
      .invalidate(&cache_key!["contracts"], InvalidateOptions::reset())
      .settled()
      .await;

    assert_eq!(
      *statuses.lock(),
      vec![
        (EntryStatus::Empty, None),
        (EntryStatus::Loading, None),
        (EntryStatus::Fresh, Some(json!([1, 2, 3]))),
      ]
    );
  }

  #[tokio::test]
  async fn reset_during_a_running_fetch_shows_loading() {
    let (store, engine) = engine();
    let key = cache_key!["campaigns", "list", Params::new()];
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let slow: Fetcher = Arc::new(move || {
      let round = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        Ok(json!({"round": round}))
      }
      .boxed()
    });
    store.write(&key, json!({"round": -1}));
    store.register_fetcher(&key, slow);
    store.subscribe(&key, noop_listener());

    let first = engine.refetch(&key).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let report = engine.invalidate(&cache_key!["campaigns"], InvalidateOptions::reset());
    assert_eq!(report.refetching, vec![key.clone()]);
    let entry = store.get(&key);
    assert_eq!(entry.status, EntryStatus::Loading);
    assert!(entry.value.is_none());

    report.settled().await;
    assert_eq!(first.await.unwrap(), json!({"round": 1}));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(store.is_fresh(&store.get(&key)));
  }

  #[tokio::test]
  async fn failed_refetch_leaves_entry_invalidated() {
    let (store, engine) = engine();
    let key = cache_key!["invoices", "stats"];
    store.write(&key, json!({"open": 4}));
    store.register_fetcher(
      &key,
      fetcher(Arc::new(AtomicUsize::new(0)), Err(TransportError::Network("reset".into()))),
    );
    store.subscribe(&key, noop_listener());

    engine
      .invalidate(&key, InvalidateOptions::default())
      .settled()
      .await;

    let entry = store.get(&key);
    assert!(entry.invalidated);
    assert!(!store.is_fresh(&entry));
    assert_eq!(entry.status, EntryStatus::Error);
    assert_eq!(entry.value, Some(json!({"open": 4})));
  }

  #[tokio::test]
  async fn invalidate_all_merges_reports() {
    let (store, engine) = engine();
    store.write(&cache_key!["campaigns", "list"], json!([]));
    store.write(&cache_key!["campaigns", "stats"], json!({}));
    store.write(&cache_key!["distributions", "list"], json!([]));

    let report = engine.invalidate_all(&[
      Invalidation::reset(cache_key!["campaigns", "list"]),
      Invalidation::stale(cache_key!["campaigns", "stats"]),
    ]);
    assert_eq!(report.matched, 2);
    assert!(store.is_fresh(&store.get(&cache_key!["distributions", "list"])));
  }
}
