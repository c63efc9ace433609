//! Error types for the cache engine.
//!
//! Both types are `Clone` because one fetch outcome is fanned out to every
//! caller that joined it.

use thiserror::Error;

use super::key::CacheKey;

/// Failure reported by the transport behind a fetch or mutate function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
  #[error("request failed with status {status}: {message}")]
  Status { status: u16, message: String },

  #[error("network error: {0}")]
  Network(String),

  #[error("request timed out")]
  Timeout,

  #[error("invalid response payload: {0}")]
  Decode(String),
}

impl TransportError {
  /// Whether the server explicitly rejected the request (4xx).
  pub fn is_rejection(&self) -> bool {
    matches!(self, Self::Status { status, .. } if (400..500).contains(status))
  }
}

/// Errors surfaced by the cache and mutation coordinator.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
  /// Reading a key from the backend failed.
  #[error("fetch for {key} failed: {source}")]
  Fetch {
    key: CacheKey,
    #[source]
    source: TransportError,
  },

  /// A remote write failed; every optimistically patched key was restored.
  #[error("mutation #{id} failed and was rolled back: {source}")]
  Mutation {
    id: u64,
    rolled_back: Vec<CacheKey>,
    #[source]
    source: TransportError,
  },

  /// The task driving a fetch ended without producing an outcome.
  #[error("fetch for {key} was abandoned before it settled")]
  Abandoned { key: CacheKey },

  /// A cached payload did not match the requested type.
  #[error("cached value for {key} could not be decoded: {message}")]
  Decode { key: CacheKey, message: String },
}

impl CacheError {
  /// The underlying transport failure, if there is one.
  pub fn transport(&self) -> Option<&TransportError> {
    match self {
      Self::Fetch { source, .. } | Self::Mutation { source, .. } => Some(source),
      _ => None,
    }
  }
}
