//! In-memory cache store: one entry per key, plus listeners and fetchers.

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::entry::{CacheEntry, EntryStatus};
use super::error::{CacheError, TransportError};
use super::key::CacheKey;

/// Called with the new entry on every transition of the watched key.
pub type Listener = Arc<dyn Fn(&CacheEntry) + Send + Sync>;

/// Future returned by a fetch function.
pub type FetchFuture = BoxFuture<'static, Result<Value, TransportError>>;

/// Fetch function registered for a key, used for invalidation-driven refetch.
pub type Fetcher = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// Handle identifying one listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Store-wide settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
  /// Freshness budget for entries nobody configured explicitly
  pub default_stale_after: Duration,
  /// How long an unsubscribed entry is kept before eviction
  pub gc_grace: Duration,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      default_stale_after: Duration::seconds(30),
      gc_grace: Duration::minutes(5),
    }
  }
}

struct Slot {
  entry: Arc<CacheEntry>,
  listeners: Vec<(SubscriberId, Listener)>,
  fetcher: Option<Fetcher>,
  epoch: u64,
  /// A fetch began and has not settled yet
  fetching: bool,
}

#[derive(Default)]
struct StoreState {
  slots: HashMap<CacheKey, Slot>,
  next_subscriber: u64,
}

type Notification = (Arc<CacheEntry>, Vec<Listener>);

impl StoreState {
  fn slot_mut(&mut self, key: &CacheKey, stale_after: Duration, now: DateTime<Utc>) -> &mut Slot {
    self.slots.entry(key.clone()).or_insert_with(|| Slot {
      entry: Arc::new(CacheEntry::empty(key.clone(), stale_after, now)),
      listeners: Vec::new(),
      fetcher: None,
      epoch: 0,
      fetching: false,
    })
  }

  fn matching_keys(&self, prefix: &CacheKey) -> Vec<CacheKey> {
    self
      .slots
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect()
  }
}

impl Slot {
  /// Replace the entry and queue a notification for its listeners.
  fn replace(&mut self, entry: CacheEntry, pending: &mut Vec<Notification>) {
    self.entry = Arc::new(entry);
    if !self.listeners.is_empty() {
      let listeners = self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
      pending.push((Arc::clone(&self.entry), listeners));
    }
  }

  /// Replace the entry without notifying (bookkeeping-only changes).
  fn replace_quiet(&mut self, entry: CacheEntry) {
    self.entry = Arc::new(entry);
  }
}

/// Serializes listener delivery so each key's notifications arrive in write
/// order, including writes made from inside a listener.
#[derive(Default)]
struct Dispatcher {
  queue: RefCell<VecDeque<Notification>>,
  draining: Cell<bool>,
}

struct DrainGuard<'a>(&'a Cell<bool>);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.set(false);
  }
}

/// Outcome of settling a fetch against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSettlement {
  /// The value was written and the entry is fresh
  Committed,
  /// The key was invalidated after the fetch began; nothing was written
  Superseded,
}

/// The single shared mutable resource of the cache.
///
/// Cloning yields another handle to the same store. All changes go through
/// the methods below; each one replaces the affected entries and then
/// notifies listeners outside the data lock.
#[derive(Clone)]
pub struct CacheStore {
  state: Arc<Mutex<StoreState>>,
  dispatch: Arc<ReentrantMutex<Dispatcher>>,
  clock: Arc<dyn Clock>,
  config: StoreConfig,
}

impl CacheStore {
  pub fn new(config: StoreConfig) -> Self {
    Self::with_clock(config, Arc::new(SystemClock))
  }

  pub fn with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
    Self {
      state: Arc::new(Mutex::new(StoreState::default())),
      dispatch: Arc::new(ReentrantMutex::new(Dispatcher::default())),
      clock,
      config,
    }
  }

  pub fn config(&self) -> &StoreConfig {
    &self.config
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  /// Apply a change under the data lock, then deliver notifications.
  fn update<R>(&self, f: impl FnOnce(&mut StoreState, DateTime<Utc>, &mut Vec<Notification>) -> R) -> R {
    let dispatcher = self.dispatch.lock();
    let now = self.clock.now();
    let mut pending = Vec::new();
    let result = {
      let mut state = self.state.lock();
      f(&mut state, now, &mut pending)
    };

    dispatcher.queue.borrow_mut().extend(pending);
    if dispatcher.draining.get() {
      // An outer frame on this thread is already delivering
      return result;
    }

    dispatcher.draining.set(true);
    let _guard = DrainGuard(&dispatcher.draining);
    loop {
      let next = dispatcher.queue.borrow_mut().pop_front();
      let Some((entry, listeners)) = next else {
        break;
      };
      for listener in listeners {
        listener(&entry);
      }
    }
    result
  }

  /// Get the entry for a key, creating an empty one on first access.
  pub fn get(&self, key: &CacheKey) -> Arc<CacheEntry> {
    let now = self.clock.now();
    let mut state = self.state.lock();
    let slot = state.slot_mut(key, self.config.default_stale_after, now);
    Arc::clone(&slot.entry)
  }

  /// Get the entry for a key without creating it.
  pub fn peek(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
    let state = self.state.lock();
    state.slots.get(key).map(|slot| Arc::clone(&slot.entry))
  }

  /// Freshness check against the store's clock.
  pub fn is_fresh(&self, entry: &CacheEntry) -> bool {
    entry.is_fresh_at(self.clock.now())
  }

  /// Set the freshness budget for a key.
  pub fn set_stale_after(&self, key: &CacheKey, stale_after: Duration) {
    let now = self.clock.now();
    let mut state = self.state.lock();
    let slot = state.slot_mut(key, stale_after, now);
    if slot.entry.stale_after != stale_after {
      let entry = CacheEntry {
        stale_after,
        ..(*slot.entry).clone()
      };
      slot.replace_quiet(entry);
    }
  }

  /// Store a value as fresh.
  pub fn write(&self, key: &CacheKey, value: Value) {
    self.update(|state, now, pending| {
      let slot = state.slot_mut(key, self.config.default_stale_after, now);
      let entry = CacheEntry {
        value: Some(value),
        fetched_at: Some(now),
        status: EntryStatus::Fresh,
        last_error: None,
        invalidated: false,
        ..(*slot.entry).clone()
      };
      trace!(key = %key, "write");
      slot.replace(entry, pending);
    })
  }

  /// Current entry of a key together with its invalidation epoch, read
  /// atomically. Pass both back to [`CacheStore::restore`].
  pub fn snapshot(&self, key: &CacheKey) -> (Arc<CacheEntry>, u64) {
    let now = self.clock.now();
    let mut state = self.state.lock();
    let slot = state.slot_mut(key, self.config.default_stale_after, now);
    (Arc::clone(&slot.entry), slot.epoch)
  }

  /// Put a prior snapshot back in place. Used to roll back optimistic patches.
  ///
  /// The value, timestamp and error come back unchanged. The status never
  /// claims more than the slot knows now: `Loading` is only kept while a
  /// fetch is still running, and an entry invalidated after `epoch` (or
  /// whose fetch settled meanwhile) comes back stale and invalidated.
  pub fn restore(&self, key: &CacheKey, snapshot: &CacheEntry, epoch: u64) -> Restored {
    self.update(|state, now, pending| {
      let slot = state.slot_mut(key, self.config.default_stale_after, now);
      let fetch_settled = snapshot.status == EntryStatus::Loading && !slot.fetching;
      let outdated = slot.epoch != epoch || fetch_settled;

      let status = if slot.fetching {
        EntryStatus::Loading
      } else if snapshot.value.is_none() && outdated {
        EntryStatus::Empty
      } else if outdated {
        match snapshot.status {
          EntryStatus::Error => EntryStatus::Error,
          _ => EntryStatus::Stale,
        }
      } else {
        snapshot.status
      };
      let entry = CacheEntry {
        value: snapshot.value.clone(),
        fetched_at: snapshot.fetched_at,
        status,
        last_error: snapshot.last_error.clone(),
        invalidated: snapshot.invalidated || (outdated && snapshot.value.is_some()),
        ..(*slot.entry).clone()
      };
      debug!(key = %key, status = ?entry.status, outdated, "restored snapshot");
      let restored = Restored {
        outdated,
        needs_refetch: outdated && !slot.fetching && !slot.listeners.is_empty(),
      };
      slot.replace(entry, pending);
      restored
    })
  }

  /// Mark a fetch as started. Returns the invalidation epoch the fetch
  /// observed, to be handed back to [`CacheStore::complete_fetch`].
  pub fn begin_fetch(&self, key: &CacheKey) -> u64 {
    self.update(|state, now, pending| {
      let slot = state.slot_mut(key, self.config.default_stale_after, now);
      slot.fetching = true;
      let entry = CacheEntry {
        status: EntryStatus::Loading,
        ..(*slot.entry).clone()
      };
      slot.replace(entry, pending);
      slot.epoch
    })
  }

  /// Show `Loading` for a key whose fetch is still running, e.g. after a
  /// reset emptied it mid-flight. Does nothing once the fetch has settled or
  /// when the entry already shows `Loading`.
  pub fn mark_loading(&self, key: &CacheKey) {
    self.update(|state, now, pending| {
      let slot = state.slot_mut(key, self.config.default_stale_after, now);
      if !slot.fetching || slot.entry.status == EntryStatus::Loading {
        return;
      }
      let entry = CacheEntry {
        status: EntryStatus::Loading,
        ..(*slot.entry).clone()
      };
      slot.replace(entry, pending);
    })
  }

  /// Settle a successful fetch. The value is only written when the key has
  /// not been invalidated since `epoch` was observed.
  pub fn complete_fetch(&self, key: &CacheKey, epoch: u64, value: Value) -> FetchSettlement {
    self.update(|state, now, pending| {
      let slot = state.slot_mut(key, self.config.default_stale_after, now);
      if slot.epoch != epoch {
        return FetchSettlement::Superseded;
      }
      slot.fetching = false;
      let entry = CacheEntry {
        value: Some(value),
        fetched_at: Some(now),
        status: EntryStatus::Fresh,
        last_error: None,
        invalidated: false,
        ..(*slot.entry).clone()
      };
      trace!(key = %key, "fetch committed");
      slot.replace(entry, pending);
      FetchSettlement::Committed
    })
  }

  /// Store a value that is already known to be outdated.
  pub fn write_stale(&self, key: &CacheKey, value: Value) {
    self.update(|state, now, pending| {
      let slot = state.slot_mut(key, self.config.default_stale_after, now);
      slot.fetching = false;
      let entry = CacheEntry {
        value: Some(value),
        fetched_at: Some(now),
        status: EntryStatus::Stale,
        last_error: None,
        invalidated: true,
        ..(*slot.entry).clone()
      };
      slot.replace(entry, pending);
    })
  }

  /// Record a failed fetch. The last good value is kept for display and an
  /// invalidated entry stays invalidated.
  pub fn fail_fetch(&self, key: &CacheKey, error: CacheError) {
    self.update(|state, now, pending| {
      let slot = state.slot_mut(key, self.config.default_stale_after, now);
      slot.fetching = false;
      let entry = CacheEntry {
        status: EntryStatus::Error,
        last_error: Some(error),
        ..(*slot.entry).clone()
      };
      slot.replace(entry, pending);
    })
  }

  /// Mark every entry at or below `prefix` as invalidated; fresh entries
  /// become stale. Returns the matched keys that have subscribers.
  pub fn mark_stale(&self, prefix: &CacheKey) -> Invalidated {
    self.update(|state, _now, pending| {
      let mut report = Invalidated::default();
      for key in state.matching_keys(prefix) {
        let Some(slot) = state.slots.get_mut(&key) else {
          continue;
        };
        slot.epoch += 1;
        let status = match slot.entry.status {
          EntryStatus::Fresh => EntryStatus::Stale,
          other => other,
        };
        let entry = CacheEntry {
          status,
          invalidated: true,
          ..(*slot.entry).clone()
        };
        report.record(&key, &entry);
        slot.replace(entry, pending);
      }
      debug!(prefix = %prefix, matched = report.matched, "marked stale");
      report
    })
  }

  /// Discard the values of every entry at or below `prefix`.
  pub fn reset(&self, prefix: &CacheKey) -> Invalidated {
    self.update(|state, _now, pending| {
      let mut report = Invalidated::default();
      for key in state.matching_keys(prefix) {
        let Some(slot) = state.slots.get_mut(&key) else {
          continue;
        };
        slot.epoch += 1;
        let entry = CacheEntry {
          value: None,
          fetched_at: None,
          status: EntryStatus::Empty,
          last_error: None,
          invalidated: false,
          ..(*slot.entry).clone()
        };
        report.record(&key, &entry);
        slot.replace(entry, pending);
      }
      debug!(prefix = %prefix, matched = report.matched, "reset");
      report
    })
  }

  /// Register a listener. The subscriber count goes up by one.
  pub fn subscribe(&self, key: &CacheKey, listener: Listener) -> SubscriberId {
    let now = self.clock.now();
    let mut state = self.state.lock();
    state.next_subscriber += 1;
    let id = SubscriberId(state.next_subscriber);
    let slot = state.slot_mut(key, self.config.default_stale_after, now);
    slot.listeners.push((id, listener));
    let entry = CacheEntry {
      subscriber_count: slot.entry.subscriber_count + 1,
      idle_since: None,
      ..(*slot.entry).clone()
    };
    slot.replace_quiet(entry);
    trace!(key = %key, subscribers = slot.entry.subscriber_count, "subscribed");
    id
  }

  /// Remove a listener. Returns false if it was not registered.
  pub fn unsubscribe(&self, key: &CacheKey, id: SubscriberId) -> bool {
    let now = self.clock.now();
    let mut state = self.state.lock();
    let Some(slot) = state.slots.get_mut(key) else {
      return false;
    };
    let before = slot.listeners.len();
    slot.listeners.retain(|(sid, _)| *sid != id);
    if slot.listeners.len() == before {
      return false;
    }
    let subscriber_count = slot.entry.subscriber_count.saturating_sub(1);
    let entry = CacheEntry {
      subscriber_count,
      idle_since: if subscriber_count == 0 { Some(now) } else { None },
      ..(*slot.entry).clone()
    };
    slot.replace_quiet(entry);
    trace!(key = %key, subscribers = subscriber_count, "unsubscribed");
    true
  }

  /// Remember how to refetch a key.
  pub fn register_fetcher(&self, key: &CacheKey, fetcher: Fetcher) {
    let now = self.clock.now();
    let mut state = self.state.lock();
    let slot = state.slot_mut(key, self.config.default_stale_after, now);
    slot.fetcher = Some(fetcher);
  }

  pub fn fetcher(&self, key: &CacheKey) -> Option<Fetcher> {
    let state = self.state.lock();
    state.slots.get(key).and_then(|slot| slot.fetcher.clone())
  }

  /// Current invalidation epoch of a key (0 for unknown keys).
  pub fn epoch(&self, key: &CacheKey) -> u64 {
    let state = self.state.lock();
    state.slots.get(key).map(|slot| slot.epoch).unwrap_or(0)
  }

  /// Keys equal to or below `prefix`.
  pub fn matching_keys(&self, prefix: &CacheKey) -> Vec<CacheKey> {
    self.state.lock().matching_keys(prefix)
  }

  pub fn len(&self) -> usize {
    self.state.lock().slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.state.lock().slots.is_empty()
  }

  /// Evict entries that have had no subscribers for the grace period.
  /// Entries with a fetch in flight are kept.
  pub fn collect_garbage(&self) -> Vec<CacheKey> {
    let now = self.clock.now();
    let grace = self.config.gc_grace;
    let mut state = self.state.lock();
    let expired: Vec<CacheKey> = state
      .slots
      .iter()
      .filter(|(_, slot)| {
        let entry = &slot.entry;
        entry.subscriber_count == 0
          && !slot.fetching
          && entry.idle_since.is_some_and(|idle| now - idle >= grace)
      })
      .map(|(key, _)| key.clone())
      .collect();
    for key in &expired {
      state.slots.remove(key);
    }
    if !expired.is_empty() {
      debug!(evicted = expired.len(), "collected idle entries");
    }
    expired
  }
}

/// How [`CacheStore::restore`] put a snapshot back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restored {
  /// The key was invalidated, or its fetch settled, after the snapshot
  pub outdated: bool,
  /// Outdated, watched, and with no fetch running to bring it up to date
  pub needs_refetch: bool,
}

/// Keys touched by [`CacheStore::mark_stale`] or [`CacheStore::reset`].
#[derive(Debug, Default, Clone)]
pub struct Invalidated {
  pub matched: usize,
  /// Matched keys with at least one subscriber
  pub subscribed: Vec<CacheKey>,
}

impl Invalidated {
  fn record(&mut self, key: &CacheKey, entry: &CacheEntry) {
    self.matched += 1;
    if entry.subscriber_count > 0 {
      self.subscribed.push(key.clone());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use crate::cache::key::Params;
  use crate::cache_key;
  use serde_json::json;

  fn store_with_clock() -> (CacheStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let store = CacheStore::with_clock(StoreConfig::default(), clock.clone());
    (store, clock)
  }

  fn recorder() -> (Listener, Arc<Mutex<Vec<(EntryStatus, Option<Value>)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener: Listener = Arc::new(move |entry: &CacheEntry| {
      sink.lock().push((entry.status, entry.value.clone()));
    });
    (listener, seen)
  }

  #[test]
  fn get_creates_empty_entry() {
    let (store, _) = store_with_clock();
    let key = cache_key!["campaigns", "detail", 1];
    assert!(store.peek(&key).is_none());

    let entry = store.get(&key);
    assert_eq!(entry.status, EntryStatus::Empty);
    assert!(entry.value.is_none());
    assert_eq!(store.len(), 1);
  }

  #[test]
  fn write_makes_entry_fresh_until_budget_elapses() {
    let (store, clock) = store_with_clock();
    let key = cache_key!["campaigns", "detail", 1];
    store.set_stale_after(&key, Duration::seconds(30));
    store.write(&key, json!({"id": 1}));

    assert!(store.is_fresh(&store.get(&key)));
    clock.advance(Duration::seconds(31));
    let entry = store.get(&key);
    assert!(!store.is_fresh(&entry));
    assert_eq!(entry.value, Some(json!({"id": 1})));
  }

  #[test]
  fn mark_stale_cascades_to_descendants_only() {
    let (store, _) = store_with_clock();
    let active = cache_key!["campaigns", "list", Params::new().with("status", "active")];
    let detail = cache_key!["campaigns", "detail", 7];
    let sibling = cache_key!["contracts", "list", Params::new()];
    for key in [&active, &detail, &sibling] {
      store.write(key, json!([]));
    }

    let report = store.mark_stale(&cache_key!["campaigns"]);
    assert_eq!(report.matched, 2);
    assert_eq!(store.get(&active).status, EntryStatus::Stale);
    assert_eq!(store.get(&detail).status, EntryStatus::Stale);
    assert_eq!(store.get(&sibling).status, EntryStatus::Fresh);
    assert!(store.is_fresh(&store.get(&sibling)));
  }

  #[test]
  fn mark_stale_reports_subscribed_keys() {
    let (store, _) = store_with_clock();
    let watched = cache_key!["tasks", "list", Params::new()];
    let unwatched = cache_key!["tasks", "detail", 3];
    store.write(&watched, json!([]));
    store.write(&unwatched, json!({}));
    let (listener, _) = recorder();
    store.subscribe(&watched, listener);

    let report = store.mark_stale(&cache_key!["tasks"]);
    assert_eq!(report.subscribed, vec![watched]);
  }

  #[test]
  fn reset_discards_values() {
    let (store, _) = store_with_clock();
    let key = cache_key!["invoices", "list", Params::new()];
    store.write(&key, json!([1, 2, 3]));

    store.reset(&cache_key!["invoices", "list"]);
    let entry = store.get(&key);
    assert_eq!(entry.status, EntryStatus::Empty);
    assert!(entry.value.is_none());
    assert!(entry.fetched_at.is_none());
  }

  #[test]
  fn listeners_see_every_transition_in_order() {
    let (store, _) = store_with_clock();
    let key = cache_key!["campaigns", "detail", 1];
    let (listener, seen) = recorder();
    store.subscribe(&key, listener);

    store.begin_fetch(&key);
    store.write(&key, json!(1));
    store.mark_stale(&key);
    store.write(&key, json!(2));

    let seen = seen.lock();
    assert_eq!(
      *seen,
      vec![
        (EntryStatus::Loading, None),
        (EntryStatus::Fresh, Some(json!(1))),
        (EntryStatus::Stale, Some(json!(1))),
        (EntryStatus::Fresh, Some(json!(2))),
      ]
    );
  }

  #[test]
  fn writes_from_listeners_are_delivered_after_the_current_one() {
    let (store, _) = store_with_clock();
    let key = cache_key!["campaigns", "detail", 1];

    let inner = store.clone();
    let echo_key = key.clone();
    store.subscribe(
      &key,
      Arc::new(move |entry: &CacheEntry| {
        if entry.value == Some(json!(1)) {
          inner.write(&echo_key, json!(2));
        }
      }),
    );
    let (listener, seen) = recorder();
    store.subscribe(&key, listener);

    store.write(&key, json!(1));

    let values: Vec<_> = seen.lock().iter().map(|(_, v)| v.clone()).collect();
    assert_eq!(values, vec![Some(json!(1)), Some(json!(2))]);
  }

  #[test]
  fn failed_fetch_keeps_last_value() {
    let (store, _) = store_with_clock();
    let key = cache_key!["entities", "detail", 9];
    store.write(&key, json!({"name": "Acme"}));
    store.mark_stale(&key);
    store.begin_fetch(&key);
    store.fail_fetch(
      &key,
      CacheError::Fetch {
        key: key.clone(),
        source: TransportError::Timeout,
      },
    );

    let entry = store.get(&key);
    assert_eq!(entry.status, EntryStatus::Error);
    assert_eq!(entry.value, Some(json!({"name": "Acme"})));
    assert!(entry.invalidated);
    assert!(entry.last_error.is_some());
  }

  #[test]
  fn complete_fetch_is_superseded_by_invalidation() {
    let (store, _) = store_with_clock();
    let key = cache_key!["campaigns", "list", Params::new()];
    let epoch = store.begin_fetch(&key);
    store.reset(&cache_key!["campaigns"]);

    assert_eq!(
      store.complete_fetch(&key, epoch, json!([1])),
      FetchSettlement::Superseded
    );
    assert!(store.get(&key).value.is_none());

    let epoch = store.begin_fetch(&key);
    assert_eq!(
      store.complete_fetch(&key, epoch, json!([1, 2])),
      FetchSettlement::Committed
    );
    assert_eq!(store.get(&key).value, Some(json!([1, 2])));
  }

  #[test]
  fn restore_puts_snapshot_back() {
    let (store, _) = store_with_clock();
    let key = cache_key!["contracts", "detail", 4];
    store.write(&key, json!({"v": 0}));
    let (snapshot, epoch) = store.snapshot(&key);

    store.write(&key, json!({"v": 1}));
    let restored = store.restore(&key, &snapshot, epoch);

    let entry = store.get(&key);
    assert!(!restored.outdated);
    assert_eq!(entry.value, Some(json!({"v": 0})));
    assert_eq!(entry.fetched_at, snapshot.fetched_at);
    assert_eq!(entry.status, EntryStatus::Fresh);
    assert!(!entry.invalidated);
  }

  #[test]
  fn restore_keeps_a_later_invalidation() {
    let (store, _) = store_with_clock();
    let key = cache_key!["campaigns", "list", Params::new()];
    store.write(&key, json!([0]));
    let (snapshot, epoch) = store.snapshot(&key);
    let (listener, _) = recorder();
    store.subscribe(&key, listener);

    store.write(&key, json!([0, 1]));
    store.mark_stale(&cache_key!["campaigns"]);
    let restored = store.restore(&key, &snapshot, epoch);

    let entry = store.get(&key);
    assert_eq!(entry.value, Some(json!([0])));
    assert_eq!(entry.fetched_at, snapshot.fetched_at);
    assert_eq!(entry.status, EntryStatus::Stale);
    assert!(entry.invalidated);
    assert!(!store.is_fresh(&entry));
    assert_eq!(
      restored,
      Restored {
        outdated: true,
        needs_refetch: true
      }
    );
  }

  #[test]
  fn restore_never_revives_a_settled_fetch() {
    let (store, clock) = store_with_clock();
    let key = cache_key!["campaigns", "detail", 1];
    store.write(&key, json!({"name": "v0"}));
    let fetch_epoch = store.begin_fetch(&key);
    let (snapshot, epoch) = store.snapshot(&key);
    assert_eq!(snapshot.status, EntryStatus::Loading);

    store.write(&key, json!({"name": "v1"}));
    store.complete_fetch(&key, fetch_epoch, json!({"name": "fetched"}));
    let restored = store.restore(&key, &snapshot, epoch);

    let entry = store.get(&key);
    assert_eq!(entry.status, EntryStatus::Stale);
    assert_eq!(entry.value, Some(json!({"name": "v0"})));
    assert!(entry.invalidated);
    assert!(restored.outdated);
    assert!(!restored.needs_refetch);

    clock.advance(Duration::hours(1));
    assert_eq!(store.collect_garbage(), vec![key]);
  }

  #[test]
  fn restore_keeps_loading_while_the_fetch_runs() {
    let (store, _) = store_with_clock();
    let key = cache_key!["tasks", "detail", 3];
    let (snapshot, epoch) = store.snapshot(&key);
    store.begin_fetch(&key);

    store.write(&key, json!({"state": "open"}));
    store.restore(&key, &snapshot, epoch);

    let entry = store.get(&key);
    assert_eq!(entry.status, EntryStatus::Loading);
    assert!(entry.value.is_none());
  }

  #[test]
  fn mark_loading_only_applies_to_running_fetches() {
    let (store, _) = store_with_clock();
    let key = cache_key!["invoices", "list", Params::new()];
    let (listener, seen) = recorder();
    store.subscribe(&key, listener);

    store.mark_loading(&key);
    assert_eq!(store.get(&key).status, EntryStatus::Empty);

    store.begin_fetch(&key);
    store.reset(&key);
    store.mark_loading(&key);
    store.mark_loading(&key);

    let statuses: Vec<_> = seen.lock().iter().map(|(status, _)| *status).collect();
    assert_eq!(
      statuses,
      vec![EntryStatus::Loading, EntryStatus::Empty, EntryStatus::Loading]
    );
  }

  #[test]
  fn subscriber_count_tracks_subscriptions() {
    let (store, _) = store_with_clock();
    let key = cache_key!["tasks", "detail", 2];
    let (a, _) = recorder();
    let (b, _) = recorder();
    let id_a = store.subscribe(&key, a);
    let id_b = store.subscribe(&key, b);
    assert_eq!(store.get(&key).subscriber_count, 2);
    assert!(store.get(&key).idle_since.is_none());

    assert!(store.unsubscribe(&key, id_a));
    assert!(!store.unsubscribe(&key, id_a));
    assert!(store.unsubscribe(&key, id_b));
    let entry = store.get(&key);
    assert_eq!(entry.subscriber_count, 0);
    assert!(entry.idle_since.is_some());
  }

  #[test]
  fn garbage_collection_waits_for_grace_period() {
    let (store, clock) = store_with_clock();
    let idle = cache_key!["campaigns", "detail", 1];
    let watched = cache_key!["campaigns", "detail", 2];
    store.write(&idle, json!(1));
    store.write(&watched, json!(2));
    let (listener, _) = recorder();
    store.subscribe(&watched, listener);

    clock.advance(Duration::minutes(4));
    assert!(store.collect_garbage().is_empty());

    clock.advance(Duration::minutes(1));
    assert_eq!(store.collect_garbage(), vec![idle.clone()]);
    assert!(store.peek(&idle).is_none());
    assert!(store.peek(&watched).is_some());
  }

  #[test]
  fn garbage_collection_skips_loading_entries() {
    let (store, clock) = store_with_clock();
    let key = cache_key!["invoices", "detail", 5];
    store.begin_fetch(&key);
    clock.advance(Duration::hours(1));
    assert!(store.collect_garbage().is_empty());
  }
}
