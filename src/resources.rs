//! Dashboard resource kinds, their cache keys, and what each write invalidates.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cache::{CacheKey, InvalidateOptions, Invalidation, Params};

/// Kinds of server resources the dashboard reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
  Campaigns,
  Distributions,
  Contracts,
  Entities,
  Invoices,
  Tasks,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource kind '{0}' (expected one of: campaigns, distributions, contracts, entities, invoices, tasks)")]
pub struct UnknownResourceKind(pub String);

impl ResourceKind {
  pub const ALL: [ResourceKind; 6] = [
    Self::Campaigns,
    Self::Distributions,
    Self::Contracts,
    Self::Entities,
    Self::Invoices,
    Self::Tasks,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Campaigns => "campaigns",
      Self::Distributions => "distributions",
      Self::Contracts => "contracts",
      Self::Entities => "entities",
      Self::Invoices => "invoices",
      Self::Tasks => "tasks",
    }
  }

  /// Collection path on the API, relative to the base URL.
  pub fn path(&self) -> &'static str {
    self.as_str()
  }

  /// Freshness budget used when the config does not override it.
  pub fn default_stale_after(&self) -> Duration {
    match self {
      Self::Campaigns | Self::Distributions => Duration::seconds(30),
      Self::Contracts => Duration::minutes(2),
      Self::Entities => Duration::minutes(5),
      Self::Invoices => Duration::minutes(1),
      Self::Tasks => Duration::seconds(15),
    }
  }

  /// Kinds whose cached data embeds or aggregates this kind, so a write to
  /// this kind leaves them outdated.
  pub fn dependents(&self) -> &'static [ResourceKind] {
    match self {
      // Campaign totals are sums over their distributions and the other way round
      Self::Campaigns => &[Self::Distributions],
      Self::Distributions => &[Self::Campaigns],
      Self::Contracts => &[Self::Entities],
      Self::Invoices => &[Self::Contracts, Self::Entities],
      Self::Entities | Self::Tasks => &[],
    }
  }
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ResourceKind {
  type Err = UnknownResourceKind;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let normalized = s.trim().to_lowercase();
    Self::ALL
      .into_iter()
      .find(|kind| kind.as_str() == normalized)
      .ok_or_else(|| UnknownResourceKind(s.to_string()))
  }
}

/// List filter shared by every resource kind. Fields a kind does not support
/// are simply left unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
  pub status: Option<String>,
  pub search: Option<String>,
  pub entity_id: Option<u64>,
  pub campaign_id: Option<u64>,
  pub contract_id: Option<u64>,
  pub assignee: Option<String>,
  pub from: Option<NaiveDate>,
  pub to: Option<NaiveDate>,
  pub sort_by: Option<String>,
  #[serde(default)]
  pub sort_desc: bool,
  pub page: Option<u32>,
  pub per_page: Option<u32>,
}

impl ListFilter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn status(mut self, status: impl Into<String>) -> Self {
    self.status = Some(status.into());
    self
  }

  pub fn search(mut self, search: impl Into<String>) -> Self {
    self.search = Some(search.into());
    self
  }

  pub fn page(mut self, page: u32, per_page: u32) -> Self {
    self.page = Some(page);
    self.per_page = Some(per_page);
    self
  }

  pub fn sorted_by(mut self, field: impl Into<String>, desc: bool) -> Self {
    self.sort_by = Some(field.into());
    self.sort_desc = desc;
    self
  }

  /// Canonical parameters. Unset fields are omitted, so an empty filter and
  /// a filter with every field `None` produce the same key.
  pub fn to_params(&self) -> Params {
    let mut params = Params::new();
    params.insert_opt("status", self.status.clone());
    params.insert_opt("search", self.search.clone().filter(|s| !s.trim().is_empty()));
    params.insert_opt("entity_id", self.entity_id);
    params.insert_opt("campaign_id", self.campaign_id);
    params.insert_opt("contract_id", self.contract_id);
    params.insert_opt("assignee", self.assignee.clone());
    params.insert_opt("from", self.from.map(|d| d.to_string()));
    params.insert_opt("to", self.to.map(|d| d.to_string()));
    if let Some(sort_by) = &self.sort_by {
      params.insert("sort_by", sort_by.as_str());
      if self.sort_desc {
        params.insert("sort_desc", true);
      }
    }
    params.insert_opt("page", self.page);
    params.insert_opt("per_page", self.per_page);
    params
  }
}

// ============================================================================
// Keys
// ============================================================================

/// `[kind]`: everything cached for a kind.
pub fn root(kind: ResourceKind) -> CacheKey {
  CacheKey::new(kind.as_str())
}

/// `[kind, "list"]`: every list variant of a kind.
pub fn lists_key(kind: ResourceKind) -> CacheKey {
  root(kind).child("list")
}

/// `[kind, "list", filter]`
pub fn list_key(kind: ResourceKind, filter: &ListFilter) -> CacheKey {
  lists_key(kind).child(filter.to_params())
}

/// `[kind, "detail"]`
pub fn details_key(kind: ResourceKind) -> CacheKey {
  root(kind).child("detail")
}

/// `[kind, "detail", id]`
pub fn detail_key(kind: ResourceKind, id: u64) -> CacheKey {
  details_key(kind).child(id)
}

/// `[kind, "stats"]`: aggregate totals for a kind.
pub fn stats_key(kind: ResourceKind) -> CacheKey {
  root(kind).child("stats")
}

// ============================================================================
// Invalidation plans
// ============================================================================

fn cascade(kind: ResourceKind) -> impl Iterator<Item = Invalidation> {
  kind
    .dependents()
    .iter()
    .map(|dependent| Invalidation::stale(root(*dependent)))
}

/// After a create: list cardinality changed, so lists are reset rather than
/// marked stale.
pub fn on_create(kind: ResourceKind) -> Vec<Invalidation> {
  let mut plan = vec![
    Invalidation::reset(lists_key(kind)),
    Invalidation::stale(stats_key(kind)),
  ];
  plan.extend(cascade(kind));
  plan
}

/// After an update: the detail key is committed from the response; lists and
/// aggregates are marked stale.
pub fn on_update(kind: ResourceKind) -> Vec<Invalidation> {
  let mut plan = vec![
    Invalidation::stale(lists_key(kind)),
    Invalidation::stale(stats_key(kind)),
  ];
  plan.extend(cascade(kind));
  plan
}

/// After a delete: lists are reset and the deleted detail is dropped without
/// a refetch (it would only come back as not-found).
pub fn on_delete(kind: ResourceKind, id: u64) -> Vec<Invalidation> {
  let mut plan = vec![
    Invalidation::reset(lists_key(kind)),
    Invalidation {
      prefix: detail_key(kind, id),
      options: InvalidateOptions {
        refetch_active: false,
        reset: true,
      },
    },
    Invalidation::stale(stats_key(kind)),
  ];
  plan.extend(cascade(kind));
  plan
}

/// After a bulk operation of any kind: one reset of every list, stale
/// aggregates and details.
pub fn on_bulk(kind: ResourceKind) -> Vec<Invalidation> {
  let mut plan = vec![
    Invalidation::reset(lists_key(kind)),
    Invalidation::stale(details_key(kind)),
    Invalidation::stale(stats_key(kind)),
  ];
  plan.extend(cascade(kind));
  plan
}
