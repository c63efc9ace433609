//! In-memory resource cache with coordinated mutations.
//!
//! This module provides a backend-agnostic caching mechanism that:
//! - Keys entries by hierarchical [`CacheKey`]s so a prefix addresses a subtree
//! - Serves stale data while revalidating and falls back to the last good value offline
//! - Shares one in-flight fetch between concurrent readers of a key
//! - Applies optimistic patches and rolls them back when the remote write fails
//! - Runs bulk operations sequentially with optional spacing

mod batch;
mod clock;
mod dedupe;
mod entry;
mod error;
mod invalidate;
mod key;
mod layer;
mod mutation;
mod store;

pub use batch::{
  BatchFailure, BatchJob, BatchOptions, BatchOutcome, BatchProgress, BatchResult, BatchStatus,
  BatchSuccess, BatchThrottler,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dedupe::{FetchDeduplicator, SharedFetch};
pub use entry::{CacheEntry, CacheResult, CacheSource, EntryStatus};
pub use error::{CacheError, TransportError};
pub use invalidate::{InvalidateOptions, Invalidation, InvalidationEngine, InvalidationReport};
pub use key::{CacheKey, FloatParam, KeyToken, ParamValue, Params};
pub use layer::{CacheLayer, LayerConfig, QueryOptions, Subscription};
pub use mutation::{MutationCoordinator, MutationOutcome, MutationPhase, MutationPlan};
pub use store::{
  CacheStore, FetchFuture, FetchSettlement, Fetcher, Invalidated, Listener, Restored,
  StoreConfig, SubscriberId,
};
