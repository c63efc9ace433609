//! Remote resource API and its cached front.

mod cached_client;
mod client;

use serde_json::Value;
use std::future::Future;

use crate::cache::TransportError;
use crate::resources::{ListFilter, ResourceKind};

pub use cached_client::DashboardClient;
pub use client::ApiClient;

/// Operations the dashboard needs from the backend.
///
/// Every call is independent and returns the decoded JSON body.
pub trait ResourceApi: Clone + Send + Sync + 'static {
  fn list(
    &self,
    kind: ResourceKind,
    filter: &ListFilter,
  ) -> impl Future<Output = Result<Value, TransportError>> + Send;

  fn get_one(
    &self,
    kind: ResourceKind,
    id: u64,
  ) -> impl Future<Output = Result<Value, TransportError>> + Send;

  fn stats(&self, kind: ResourceKind) -> impl Future<Output = Result<Value, TransportError>> + Send;

  fn create(
    &self,
    kind: ResourceKind,
    body: &Value,
  ) -> impl Future<Output = Result<Value, TransportError>> + Send;

  fn update(
    &self,
    kind: ResourceKind,
    id: u64,
    changes: &Value,
  ) -> impl Future<Output = Result<Value, TransportError>> + Send;

  fn delete(
    &self,
    kind: ResourceKind,
    id: u64,
  ) -> impl Future<Output = Result<Value, TransportError>> + Send;
}
