//! Cache entries and read results.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::error::CacheError;
use super::key::CacheKey;

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  /// Never fetched, or discarded by a reset
  Empty,
  /// A fetch is in flight; any previous value is still available
  Loading,
  /// Holds a value within its freshness budget
  Fresh,
  /// Holds a value that should be refetched
  Stale,
  /// The last fetch failed; any previous value is still available
  Error,
}

/// One cached resource.
///
/// Entries are immutable snapshots. The store replaces the whole entry on
/// every transition, so a reader never observes a half-applied change.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub value: Option<Value>,
  pub fetched_at: Option<DateTime<Utc>>,
  pub stale_after: Duration,
  pub status: EntryStatus,
  pub subscriber_count: usize,
  pub last_error: Option<CacheError>,
  /// Explicitly invalidated and not yet successfully refetched
  pub invalidated: bool,
  /// When the subscriber count last dropped to zero
  pub idle_since: Option<DateTime<Utc>>,
}

impl CacheEntry {
  pub(crate) fn empty(key: CacheKey, stale_after: Duration, now: DateTime<Utc>) -> Self {
    Self {
      key,
      value: None,
      fetched_at: None,
      stale_after,
      status: EntryStatus::Empty,
      subscriber_count: 0,
      last_error: None,
      invalidated: false,
      idle_since: Some(now),
    }
  }

  /// `status == Fresh`, not invalidated, and within the freshness budget.
  ///
  /// A zero budget means the entry is always stale.
  pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
    if self.status != EntryStatus::Fresh || self.invalidated {
      return false;
    }
    if self.stale_after <= Duration::zero() {
      return false;
    }
    match self.fetched_at {
      Some(fetched_at) => now - fetched_at <= self.stale_after,
      None => false,
    }
  }

  /// Has a value that should not be presented as current.
  pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
    self.value.is_some() && !self.is_fresh_at(now)
  }

  pub fn is_loading(&self) -> bool {
    self.status == EntryStatus::Loading
  }

  /// Decode the cached payload into a typed value.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, CacheError> {
    self
      .value
      .as_ref()
      .map(|v| {
        serde_json::from_value(v.clone()).map_err(|e| CacheError::Decode {
          key: self.key.clone(),
          message: e.to_string(),
        })
      })
      .transpose()
  }
}

/// Result of a read, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched (if served from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Data served from the cache.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at,
    }
  }

  /// Last good value served after a failed fetch.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}

impl CacheResult<Value> {
  /// Decode the payload into a typed value.
  pub fn decode<T: DeserializeOwned>(self, key: &CacheKey) -> Result<CacheResult<T>, CacheError> {
    let data = serde_json::from_value(self.data).map_err(|e| CacheError::Decode {
      key: key.clone(),
      message: e.to_string(),
    })?;
    Ok(CacheResult {
      data,
      source: self.source,
      cached_at: self.cached_at,
    })
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched from the network for this read
  Network,
  /// From cache, within its freshness budget
  CacheFresh,
  /// From cache past its budget; a background refetch has been started
  CacheStale,
  /// From cache after the last fetch failed; a retry has been started
  Offline,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache_key;
  use serde_json::json;

  fn fresh_entry(now: DateTime<Utc>, budget: Duration) -> CacheEntry {
    CacheEntry {
      value: Some(json!({"id": 1})),
      fetched_at: Some(now),
      status: EntryStatus::Fresh,
      ..CacheEntry::empty(cache_key!["campaigns", "detail", 1], budget, now)
    }
  }

  #[test]
  fn freshness_respects_budget() {
    let now = Utc::now();
    let entry = fresh_entry(now, Duration::seconds(30));
    assert!(entry.is_fresh_at(now + Duration::seconds(30)));
    assert!(!entry.is_fresh_at(now + Duration::seconds(31)));
    assert!(entry.is_stale_at(now + Duration::seconds(31)));
  }

  #[test]
  fn zero_budget_is_always_stale() {
    let now = Utc::now();
    let entry = fresh_entry(now, Duration::zero());
    assert!(!entry.is_fresh_at(now));
  }

  #[test]
  fn invalidated_entries_are_not_fresh() {
    let now = Utc::now();
    let mut entry = fresh_entry(now, Duration::minutes(5));
    entry.invalidated = true;
    assert!(!entry.is_fresh_at(now));
  }

  #[test]
  fn decode_reports_key_on_mismatch() {
    let now = Utc::now();
    let entry = fresh_entry(now, Duration::minutes(5));
    let err = entry.decode::<Vec<String>>().unwrap_err();
    assert!(matches!(err, CacheError::Decode { .. }));

    #[derive(serde::Deserialize)]
    struct Row {
      id: i64,
    }
    let row: Option<Row> = entry.decode().unwrap();
    assert_eq!(row.map(|r| r.id), Some(1));
  }
}
