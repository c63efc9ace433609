//! Optimistic mutations with rollback.
//!
//! Each call to [`MutationCoordinator::mutate`] moves through
//! `Idle -> OptimisticallyApplied (optional) -> InFlight -> Committed | RolledBack`.
//! Concurrent mutations on overlapping keys are not serialized: whichever
//! settles last decides the cached value, and a rollback only ever restores
//! the snapshot its own mutation captured. A rollback never hides a newer
//! invalidation: a key invalidated after its snapshot comes back stale and
//! is refetched if watched.

use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

use super::entry::CacheEntry;
use super::error::{CacheError, TransportError};
use super::invalidate::{Invalidation, InvalidationEngine, InvalidationReport};
use super::key::CacheKey;
use super::store::CacheStore;

/// Computes the optimistic value of a key from its current value.
/// Returning `None` leaves the key untouched.
pub type Patch = Box<dyn FnOnce(Option<&Value>) -> Option<Value> + Send>;

/// Computes the committed value of a key from the server response and the
/// key's current value. Returning `None` leaves the key untouched.
pub type Merge = Box<dyn FnOnce(&Value, Option<&Value>) -> Option<Value> + Send>;

/// Declares what a mutation does to the cache.
#[derive(Default)]
pub struct MutationPlan {
  label: Option<String>,
  optimistic: Vec<(CacheKey, Patch)>,
  commits: Vec<(CacheKey, Merge)>,
  invalidations: Vec<Invalidation>,
}

impl MutationPlan {
  pub fn new() -> Self {
    Self::default()
  }

  /// Name used in logs, e.g. `"update campaigns/7"`.
  pub fn labeled(label: impl Into<String>) -> Self {
    Self {
      label: Some(label.into()),
      ..Self::default()
    }
  }

  /// Patch `key` before the remote call is issued.
  pub fn optimistic<P>(mut self, key: CacheKey, patch: P) -> Self
  where
    P: FnOnce(Option<&Value>) -> Option<Value> + Send + 'static,
  {
    self.optimistic.push((key, Box::new(patch)));
    self
  }

  /// Write the server response into `key` on success.
  pub fn commit_response(self, key: CacheKey) -> Self {
    self.commit_with(key, |response, _| Some(response.clone()))
  }

  /// Derive the committed value of `key` from the server response.
  pub fn commit_with<M>(mut self, key: CacheKey, merge: M) -> Self
  where
    M: FnOnce(&Value, Option<&Value>) -> Option<Value> + Send + 'static,
  {
    self.commits.push((key, Box::new(merge)));
    self
  }

  /// Mark `prefix` stale once the mutation commits.
  pub fn invalidate(mut self, prefix: CacheKey) -> Self {
    self.invalidations.push(Invalidation::stale(prefix));
    self
  }

  /// Reset `prefix` once the mutation commits.
  pub fn reset(mut self, prefix: CacheKey) -> Self {
    self.invalidations.push(Invalidation::reset(prefix));
    self
  }

  pub fn invalidations(mut self, invalidations: impl IntoIterator<Item = Invalidation>) -> Self {
    self.invalidations.extend(invalidations);
    self
  }

  /// Keys this plan patches optimistically.
  pub fn patched_keys(&self) -> impl Iterator<Item = &CacheKey> {
    self.optimistic.iter().map(|(key, _)| key)
  }
}

/// Where a mutation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
  Idle,
  OptimisticallyApplied,
  InFlight,
  Committed,
  RolledBack,
}

/// Result of a committed mutation.
#[derive(Debug)]
pub struct MutationOutcome {
  pub id: u64,
  /// The server's authoritative response
  pub value: Value,
  /// Invalidations run after the commit
  pub invalidation: InvalidationReport,
}

/// A key's entry as it was before the first patch, with the invalidation
/// epoch it was read at.
struct Snapshot {
  key: CacheKey,
  entry: Arc<CacheEntry>,
  epoch: u64,
}

/// Per-invocation state. Rolls back on drop if the mutation never settled.
struct MutationContext<'a> {
  id: u64,
  phase: MutationPhase,
  store: &'a CacheStore,
  invalidation: &'a InvalidationEngine,
  snapshots: Vec<Snapshot>,
}

impl<'a> MutationContext<'a> {
  fn new(id: u64, store: &'a CacheStore, invalidation: &'a InvalidationEngine) -> Self {
    Self {
      id,
      phase: MutationPhase::Idle,
      store,
      invalidation,
      snapshots: Vec::new(),
    }
  }

  fn transition(&mut self, next: MutationPhase) {
    debug!(id = self.id, from = ?self.phase, to = ?next, "mutation phase");
    self.phase = next;
  }

  fn apply(&mut self, patches: Vec<(CacheKey, Patch)>) {
    for (key, patch) in patches {
      let (current, epoch) = self.store.snapshot(&key);
      let Some(next) = patch(current.value.as_ref()) else {
        continue;
      };
      // Only the first patch of a key captures its pre-mutation state
      if !self.snapshots.iter().any(|snapshot| snapshot.key == key) {
        self.snapshots.push(Snapshot {
          key: key.clone(),
          entry: current,
          epoch,
        });
      }
      self.store.write(&key, next);
    }
    if !self.snapshots.is_empty() {
      self.transition(MutationPhase::OptimisticallyApplied);
    }
  }

  fn commit(&mut self, commits: Vec<(CacheKey, Merge)>, response: &Value) {
    for (key, merge) in commits {
      let current = self.store.peek(&key).and_then(|entry| entry.value.clone());
      if let Some(next) = merge(response, current.as_ref()) {
        self.store.write(&key, next);
      }
    }
    self.snapshots.clear();
    self.transition(MutationPhase::Committed);
  }

  fn rollback(&mut self) -> Vec<CacheKey> {
    let mut restored = Vec::with_capacity(self.snapshots.len());
    let mut refetch = Vec::new();
    for Snapshot { key, entry, epoch } in self.snapshots.drain(..).rev() {
      if self.store.restore(&key, &entry, epoch).needs_refetch {
        refetch.push(key.clone());
      }
      restored.push(key);
    }
    self.transition(MutationPhase::RolledBack);

    // Drop may run outside a runtime; those keys refetch on their next read
    if tokio::runtime::Handle::try_current().is_ok() {
      for key in refetch {
        debug!(id = self.id, key = %key, "refetching key invalidated during mutation");
        // The fetch runs on its own task; nobody needs to await it here
        let _ = self.invalidation.refetch(&key);
      }
    }
    restored
  }
}

impl Drop for MutationContext<'_> {
  fn drop(&mut self) {
    if matches!(
      self.phase,
      MutationPhase::OptimisticallyApplied | MutationPhase::InFlight
    ) && !self.snapshots.is_empty()
    {
      warn!(id = self.id, "mutation dropped before settling, rolling back");
      self.rollback();
    }
  }
}

/// Applies optimistic patches, issues remote writes, and commits or rolls
/// back.
#[derive(Clone)]
pub struct MutationCoordinator {
  store: CacheStore,
  invalidation: InvalidationEngine,
  next_id: Arc<AtomicU64>,
}

impl MutationCoordinator {
  pub fn new(store: CacheStore, invalidation: InvalidationEngine) -> Self {
    Self {
      store,
      invalidation,
      next_id: Arc::new(AtomicU64::new(1)),
    }
  }

  /// Run one mutation.
  ///
  /// On success the commit targets are written and the plan's invalidations
  /// run. On failure every patched key is restored to this mutation's own
  /// snapshot, no invalidation happens, and the error is returned.
  pub async fn mutate<F, Fut>(
    &self,
    plan: MutationPlan,
    mutate_fn: F,
  ) -> Result<MutationOutcome, CacheError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, TransportError>>,
  {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let MutationPlan {
      label,
      optimistic,
      commits,
      invalidations,
    } = plan;
    let span = info_span!("mutation", id, label = label.as_deref().unwrap_or("-"));

    async move {
      let mut ctx = MutationContext::new(id, &self.store, &self.invalidation);
      ctx.apply(optimistic);
      ctx.transition(MutationPhase::InFlight);

      match mutate_fn().await {
        Ok(value) => {
          ctx.commit(commits, &value);
          let invalidation = self.invalidation.invalidate_all(&invalidations);
          info!(
            invalidated = invalidation.matched,
            refetching = invalidation.refetching.len(),
            "mutation committed"
          );
          Ok(MutationOutcome {
            id,
            value,
            invalidation,
          })
        }
        Err(source) => {
          let rolled_back = ctx.rollback();
          warn!(error = %source, restored = rolled_back.len(), "mutation rolled back");
          Err(CacheError::Mutation {
            id,
            rolled_back,
            source,
          })
        }
      }
    }
    .instrument(span)
    .await
  }
}
