//! Observer over one cache key, with loading states for a UI loop.
//!
//! A `Query<T>` subscribes to a key on its first `fetch()` and receives every
//! transition of the entry through a channel. The owner calls `poll()` on its
//! own tick to pick up changes, so the state it renders never changes under it.
//!
//! # Example
//!
//! ```ignore
//! let api = api.clone();
//! let mut query: Query<Vec<Campaign>> = Query::new(&layer, key, move || {
//!     let api = api.clone();
//!     async move { api.list(ResourceKind::Campaigns, &filter).await }
//! });
//!
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match query.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(data) => render_data(data, query.is_stale()),
//!     QueryState::Error(e) => render_error(e),
//!     QueryState::Idle => {}
//! }
//! ```

use chrono::Duration;
use futures::FutureExt as _;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::cache::{
  CacheEntry, CacheError, CacheKey, CacheLayer, EntryStatus, Fetcher, InvalidateOptions,
  QueryOptions, Subscription, TransportError,
};

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Nothing cached and nothing requested yet
  Idle,
  /// First fetch in flight, no data to show
  Loading,
  /// Data is available (possibly stale, possibly being refetched)
  Success(T),
  /// The fetch failed and there is no previous data
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }

  fn from_entry(entry: &CacheEntry) -> Self
  where
    T: DeserializeOwned,
  {
    match entry.decode::<T>() {
      Ok(Some(data)) => QueryState::Success(data),
      Err(e) => QueryState::Error(e.to_string()),
      Ok(None) => match entry.status {
        EntryStatus::Loading => QueryState::Loading,
        EntryStatus::Error => QueryState::Error(
          entry
            .last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "fetch failed".to_string()),
        ),
        _ => QueryState::Idle,
      },
    }
  }
}

/// Cached query for one key.
///
/// Several queries on the same key share the entry and any in-flight fetch.
pub struct Query<T> {
  layer: CacheLayer,
  key: CacheKey,
  options: QueryOptions,
  fetcher: Fetcher,
  state: QueryState<T>,
  entry: Option<Arc<CacheEntry>>,
  receiver: Option<mpsc::UnboundedReceiver<Arc<CacheEntry>>>,
  subscription: Option<Subscription>,
}

impl<T: DeserializeOwned> Query<T> {
  /// Create a query for `key`. Nothing is fetched until `fetch()`.
  pub fn new<F, Fut>(layer: &CacheLayer, key: CacheKey, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TransportError>> + Send + 'static,
  {
    Self {
      layer: layer.clone(),
      key,
      options: QueryOptions::default(),
      fetcher: Arc::new(move || fetcher().boxed()),
      state: QueryState::Idle,
      entry: None,
      receiver: None,
      subscription: None,
    }
  }

  /// Set the freshness budget for this key.
  pub fn with_stale_time(mut self, stale_after: Duration) -> Self {
    self.options = QueryOptions::stale_after(stale_after);
    self
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Error from the last fetch, even when older data is still shown.
  pub fn last_error(&self) -> Option<&CacheError> {
    self.entry.as_ref().and_then(|e| e.last_error.as_ref())
  }

  /// A fetch is in flight, whether or not data is shown.
  pub fn is_fetching(&self) -> bool {
    self.entry.as_ref().is_some_and(|e| e.is_loading())
  }

  /// Shown data is past its budget or was invalidated.
  pub fn is_stale(&self) -> bool {
    self
      .entry
      .as_ref()
      .is_some_and(|e| e.is_stale_at(self.layer.store().now()))
  }

  /// Subscribe and fetch unless the cached value is fresh.
  ///
  /// This is a no-op while subscribed and the entry is fresh or loading.
  pub fn fetch(&mut self) {
    if self.subscription.is_none() {
      self.subscribe();
      return;
    }
    let fetching = self.layer.deduplicator().is_in_flight(&self.key);
    if !fetching {
      let fetcher = Arc::clone(&self.fetcher);
      // Resolves on its own; the result arrives through the subscription
      drop(self.layer.prefetch(&self.key, self.options, move || fetcher()));
    }
  }

  /// Mark the key stale and fetch it again.
  pub fn refetch(&mut self) {
    if self.subscription.is_none() {
      self.subscribe();
    }
    drop(self.layer.invalidate(&self.key, InvalidateOptions::default()));
  }

  /// Apply transitions received since the last call.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick.
  pub fn poll(&mut self) -> bool {
    let Some(receiver) = &mut self.receiver else {
      return false;
    };
    let mut latest = None;
    while let Ok(entry) = receiver.try_recv() {
      latest = Some(entry);
    }
    match latest {
      Some(entry) => {
        self.apply(entry);
        true
      }
      None => false,
    }
  }

  fn subscribe(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    let fetcher = Arc::clone(&self.fetcher);
    let subscription = self.layer.watch(
      self.key.clone(),
      self.options,
      move || fetcher(),
      move |entry: &CacheEntry| {
        // Receiver may have been dropped
        let _ = tx.send(Arc::new(entry.clone()));
      },
    );
    let snapshot = subscription.snapshot();
    self.receiver = Some(rx);
    self.subscription = Some(subscription);
    self.apply(snapshot);
  }

  fn apply(&mut self, entry: Arc<CacheEntry>) {
    self.state = QueryState::from_entry(&entry);
    self.entry = Some(entry);
  }
}

// Query is not Clone: it owns its subscription. Build another Query on the
// same key to observe it from elsewhere.

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}
