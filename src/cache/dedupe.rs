//! At most one outstanding fetch per key.
//!
//! Concurrent callers for the same key join a single [`Shared`] future. The
//! fetch itself runs on a spawned task, so it settles and writes into the
//! store even if every caller has gone away.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt as _;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn, Instrument};

use super::error::{CacheError, TransportError};
use super::key::CacheKey;
use super::store::{CacheStore, FetchSettlement};

/// A pending fetch that any number of callers can await.
pub type SharedFetch = Shared<BoxFuture<'static, Result<Value, CacheError>>>;

/// How many times a fetch is repeated when its key is invalidated while the
/// request is on the wire.
const MAX_SUPERSEDED_ROUNDS: usize = 3;

struct InFlight {
  generation: u64,
  shared: SharedFetch,
  waiters: usize,
}

/// Registry of in-flight fetches, keyed by cache key.
#[derive(Clone)]
pub struct FetchDeduplicator {
  store: CacheStore,
  in_flight: Arc<Mutex<HashMap<CacheKey, InFlight>>>,
  next_generation: Arc<AtomicU64>,
}

impl FetchDeduplicator {
  pub fn new(store: CacheStore) -> Self {
    Self {
      store,
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      next_generation: Arc::new(AtomicU64::new(0)),
    }
  }

  /// Start a fetch for `key`, or join the one already in flight.
  ///
  /// This is synchronous: the request is registered before it returns, so
  /// several callers in the same tick share one network round trip. Must be
  /// called from within a tokio runtime.
  pub fn fetch<F, Fut>(&self, key: &CacheKey, fetch_fn: F) -> SharedFetch
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TransportError>> + Send + 'static,
  {
    let (armed_tx, armed_rx) = oneshot::channel::<u64>();
    let shared = {
      let mut in_flight = self.in_flight.lock();
      if let Some(request) = in_flight.get_mut(key) {
        request.waiters += 1;
        debug!(key = %key, waiters = request.waiters, "joined in-flight fetch");
        let joined = request.shared.clone();
        drop(in_flight);
        // A reset while the request was on the wire leaves the entry Empty
        self.store.mark_loading(key);
        return joined;
      }

      let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
      let span = tracing::debug_span!("fetch", key = %key, fp = %key.fingerprint());
      let task = FetchTask {
        key: key.clone(),
        generation,
        store: self.store.clone(),
        registry: Arc::clone(&self.in_flight),
      };
      let handle = tokio::spawn(task.run(fetch_fn, armed_rx).instrument(span));

      let abandoned_key = key.clone();
      let shared = async move {
        handle
          .await
          .unwrap_or_else(|_| Err(CacheError::Abandoned { key: abandoned_key }))
      }
      .boxed()
      .shared();

      in_flight.insert(
        key.clone(),
        InFlight {
          generation,
          shared: shared.clone(),
          waiters: 1,
        },
      );
      shared
    };

    // Loading must be visible before the task can settle, and listeners may
    // re-enter `fetch`, so this happens after the registry lock is released.
    let epoch = self.store.begin_fetch(key);
    let _ = armed_tx.send(epoch);
    shared
  }

  pub fn is_in_flight(&self, key: &CacheKey) -> bool {
    self.in_flight.lock().contains_key(key)
  }

  /// Number of callers sharing the in-flight fetch for `key`.
  pub fn waiters(&self, key: &CacheKey) -> usize {
    self
      .in_flight
      .lock()
      .get(key)
      .map(|request| request.waiters)
      .unwrap_or(0)
  }

  pub fn in_flight_count(&self) -> usize {
    self.in_flight.lock().len()
  }
}

struct FetchTask {
  key: CacheKey,
  generation: u64,
  store: CacheStore,
  registry: Arc<Mutex<HashMap<CacheKey, InFlight>>>,
}

impl FetchTask {
  async fn run<F, Fut>(self, fetch_fn: F, armed: oneshot::Receiver<u64>) -> Result<Value, CacheError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TransportError>> + Send + 'static,
  {
    let mut epoch = match armed.await {
      Ok(epoch) => epoch,
      Err(_) => self.store.epoch(&self.key),
    };

    let mut rounds = 0;
    let outcome = loop {
      match fetch_fn().await {
        Ok(value) => match self.store.complete_fetch(&self.key, epoch, value.clone()) {
          FetchSettlement::Committed => break Ok(value),
          FetchSettlement::Superseded if rounds < MAX_SUPERSEDED_ROUNDS => {
            rounds += 1;
            debug!(round = rounds, "key invalidated during fetch, fetching again");
            epoch = self.store.begin_fetch(&self.key);
          }
          FetchSettlement::Superseded => {
            warn!("key kept changing during fetch, storing result as stale");
            self.store.write_stale(&self.key, value.clone());
            break Ok(value);
          }
        },
        Err(source) => {
          let error = CacheError::Fetch {
            key: self.key.clone(),
            source,
          };
          warn!(error = %error, "fetch failed");
          self.store.fail_fetch(&self.key, error.clone());
          break Err(error);
        }
      }
    };

    let mut registry = self.registry.lock();
    if registry
      .get(&self.key)
      .is_some_and(|request| request.generation == self.generation)
    {
      registry.remove(&self.key);
    }
    outcome
  }
}
