//! Dashboard client that wraps the resource API with transparent caching.

use futures::future::BoxFuture;
use futures::FutureExt as _;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::info;

use crate::cache::{
  BatchOutcome, BatchResult, CacheEntry, CacheError, CacheLayer, CacheResult, InvalidationReport,
  MutationPlan, QueryOptions, Subscription, TransportError,
};
use crate::config::CacheConfig;
use crate::query::Query;
use crate::resources::{self, ListFilter, ResourceKind};

use super::ResourceApi;

/// Resource API with caching, optimistic writes and throttled bulk actions.
///
/// This wraps a [`ResourceApi`] and provides the same operations, but reads
/// go through the cache and writes keep the cache consistent.
#[derive(Clone)]
pub struct DashboardClient<A> {
  api: A,
  cache: CacheLayer,
  settings: CacheConfig,
}

impl<A: ResourceApi> DashboardClient<A> {
  pub fn new(api: A, cache: CacheLayer, settings: CacheConfig) -> Self {
    Self {
      api,
      cache,
      settings,
    }
  }

  pub fn api(&self) -> &A {
    &self.api
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  fn options(&self, kind: ResourceKind) -> QueryOptions {
    QueryOptions::stale_after(self.settings.stale_after(kind))
  }

  fn list_fetcher(
    &self,
    kind: ResourceKind,
    filter: &ListFilter,
  ) -> impl Fn() -> BoxFuture<'static, Result<Value, TransportError>>
       + Send
       + Sync
       + 'static {
    let api = self.api.clone();
    let filter = filter.clone();
    move || {
      let api = api.clone();
      let filter = filter.clone();
      async move { api.list(kind, &filter).await }.boxed()
    }
  }

  fn detail_fetcher(
    &self,
    kind: ResourceKind,
    id: u64,
  ) -> impl Fn() -> BoxFuture<'static, Result<Value, TransportError>>
       + Send
       + Sync
       + 'static {
    let api = self.api.clone();
    move || {
      let api = api.clone();
      async move { api.get_one(kind, id).await }.boxed()
    }
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// List resources with caching.
  pub async fn list(
    &self,
    kind: ResourceKind,
    filter: &ListFilter,
  ) -> Result<CacheResult<Value>, CacheError> {
    let key = resources::list_key(kind, filter);
    self
      .cache
      .fetch(&key, self.options(kind), self.list_fetcher(kind, filter))
      .await
  }

  /// Get a single resource with caching.
  pub async fn detail(&self, kind: ResourceKind, id: u64) -> Result<CacheResult<Value>, CacheError> {
    let key = resources::detail_key(kind, id);
    self
      .cache
      .fetch(&key, self.options(kind), self.detail_fetcher(kind, id))
      .await
  }

  /// Aggregate totals with caching.
  pub async fn stats(&self, kind: ResourceKind) -> Result<CacheResult<Value>, CacheError> {
    let key = resources::stats_key(kind);
    let api = self.api.clone();
    self
      .cache
      .fetch(&key, self.options(kind), move || {
        let api = api.clone();
        async move { api.stats(kind).await }
      })
      .await
  }

  /// Subscribe a listener to a list view.
  pub fn watch_list<L>(&self, kind: ResourceKind, filter: &ListFilter, listener: L) -> Subscription
  where
    L: Fn(&CacheEntry) + Send + Sync + 'static,
  {
    self.cache.watch(
      resources::list_key(kind, filter),
      self.options(kind),
      self.list_fetcher(kind, filter),
      listener,
    )
  }

  /// Typed, poll-driven view of a list.
  pub fn list_query<T: DeserializeOwned>(&self, kind: ResourceKind, filter: &ListFilter) -> Query<T> {
    Query::new(
      &self.cache,
      resources::list_key(kind, filter),
      self.list_fetcher(kind, filter),
    )
    .with_stale_time(self.settings.stale_after(kind))
  }

  /// Typed, poll-driven view of one resource.
  pub fn detail_query<T: DeserializeOwned>(&self, kind: ResourceKind, id: u64) -> Query<T> {
    Query::new(
      &self.cache,
      resources::detail_key(kind, id),
      self.detail_fetcher(kind, id),
    )
    .with_stale_time(self.settings.stale_after(kind))
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  /// Create a resource. Lists of the kind are reset since their item count
  /// changed; the response is cached as the new resource's detail.
  pub async fn create(&self, kind: ResourceKind, body: Value) -> Result<Value, CacheError> {
    let plan = MutationPlan::labeled(format!("create {}", kind)).invalidations(resources::on_create(kind));
    let api = self.api.clone();
    let outcome = self
      .cache
      .mutate(plan, move || async move { api.create(kind, &body).await })
      .await?;

    if let Some(id) = resource_id(&outcome.value) {
      let key = resources::detail_key(kind, id);
      self.cache.store().set_stale_after(&key, self.settings.stale_after(kind));
      self.cache.store().write(&key, outcome.value.clone());
    }
    Ok(outcome.value)
  }

  /// Update a resource. The detail and every cached list containing it are
  /// patched right away and restored if the server rejects the change.
  pub async fn update(&self, kind: ResourceKind, id: u64, changes: Value) -> Result<Value, CacheError> {
    let detail = resources::detail_key(kind, id);
    let detail_changes = changes.clone();
    let mut plan = MutationPlan::labeled(format!("update {}/{}", kind, id))
      .optimistic(detail.clone(), move |current| {
        let mut next = current.cloned()?;
        merge_fields(&mut next, &detail_changes);
        Some(next)
      })
      .commit_response(detail);

    for list in self.cached_lists(kind) {
      let list_changes = changes.clone();
      plan = plan.optimistic(list, move |current| patch_list_item(current?, id, &list_changes));
    }
    plan = plan.invalidations(resources::on_update(kind));

    let api = self.api.clone();
    let outcome = self
      .cache
      .mutate(plan, move || async move { api.update(kind, id, &changes).await })
      .await?;
    Ok(outcome.value)
  }

  /// Delete a resource, removing it from cached lists right away.
  pub async fn delete(&self, kind: ResourceKind, id: u64) -> Result<(), CacheError> {
    let mut plan = MutationPlan::labeled(format!("delete {}/{}", kind, id));
    for list in self.cached_lists(kind) {
      plan = plan.optimistic(list, move |current| remove_list_item(current?, id));
    }
    plan = plan.invalidations(resources::on_delete(kind, id));

    let api = self.api.clone();
    self
      .cache
      .mutate(plan, move || async move { api.delete(kind, id).await })
      .await?;
    Ok(())
  }

  /// Delete many resources one at a time. Items that fail are reported and
  /// the rest go ahead; caches are invalidated once at the end.
  pub async fn bulk_delete(&self, kind: ResourceKind, ids: Vec<u64>) -> BatchResult<u64, Value, TransportError> {
    let api = self.api.clone();
    let result = self
      .cache
      .run_batch(&format!("delete {}", kind), ids, |id| {
        let api = api.clone();
        async move { api.delete(kind, id).await }
      })
      .await;
    self.after_bulk(kind, &result).settled().await;
    result
  }

  /// Apply the same changes to many resources one at a time.
  pub async fn bulk_update(
    &self,
    kind: ResourceKind,
    ids: Vec<u64>,
    changes: Value,
  ) -> BatchResult<u64, Value, TransportError> {
    let api = self.api.clone();
    let result = self
      .cache
      .run_batch(&format!("update {}", kind), ids, |id| {
        let api = api.clone();
        let changes = changes.clone();
        async move { api.update(kind, id, &changes).await }
      })
      .await;
    self.after_bulk(kind, &result).settled().await;
    result
  }

  fn after_bulk<T>(&self, kind: ResourceKind, result: &BatchResult<u64, T, TransportError>) -> InvalidationReport {
    info!(
      kind = %kind,
      succeeded = result.succeeded.len(),
      failed = result.failed.len(),
      "bulk operation finished"
    );
    // Nothing changed on the server if every item failed
    if result.outcome() == BatchOutcome::Failure {
      return InvalidationReport::default();
    }
    self.cache.invalidate_all(&resources::on_bulk(kind))
  }

  /// List keys of `kind` that currently hold a value.
  fn cached_lists(&self, kind: ResourceKind) -> Vec<crate::cache::CacheKey> {
    let store = self.cache.store();
    store
      .matching_keys(&resources::lists_key(kind))
      .into_iter()
      .filter(|key| store.peek(key).is_some_and(|entry| entry.value.is_some()))
      .collect()
  }
}

// ============================================================================
// Payload helpers
// ============================================================================

/// Numeric or numeric-string `id` of a resource.
fn resource_id(value: &Value) -> Option<u64> {
  match value.get("id")? {
    Value::Number(n) => n.as_u64(),
    Value::String(s) => s.parse().ok(),
    _ => None,
  }
}

/// Shallow-merge the fields of `changes` into `target` when both are objects.
fn merge_fields(target: &mut Value, changes: &Value) {
  if let (Some(target), Some(changes)) = (target.as_object_mut(), changes.as_object()) {
    for (field, value) in changes {
      target.insert(field.clone(), value.clone());
    }
  }
}

/// The item array of a list payload: either the payload itself or its
/// `items`/`data` field.
fn list_items_mut(list: &mut Value) -> Option<&mut Vec<Value>> {
  if list.is_array() {
    return list.as_array_mut();
  }
  let object = list.as_object_mut()?;
  let field = ["items", "data"]
    .into_iter()
    .find(|field| object.get(*field).is_some_and(Value::is_array))?;
  object.get_mut(field).and_then(Value::as_array_mut)
}

fn patch_list_item(list: &Value, id: u64, changes: &Value) -> Option<Value> {
  let mut next = list.clone();
  let item = list_items_mut(&mut next)?
    .iter_mut()
    .find(|item| resource_id(item) == Some(id))?;
  merge_fields(item, changes);
  Some(next)
}

fn remove_list_item(list: &Value, id: u64) -> Option<Value> {
  let mut next = list.clone();
  let items = list_items_mut(&mut next)?;
  let before = items.len();
  items.retain(|item| resource_id(item) != Some(id));
  if items.len() == before {
    return None;
  }
  if let Some(total) = next.get_mut("total") {
    if let Some(n) = total.as_u64() {
      *total = Value::from(n.saturating_sub(1));
    }
  }
  Some(next)
}
