//! Sequential, continue-on-error batches of independent operations.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Throttling settings for a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
  /// Minimum time between the starts of two consecutive items
  pub spacing: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
  Running,
  Completed,
}

/// Overall verdict of a finished batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
  /// Every item succeeded (an empty batch counts as success)
  Success,
  /// Some items succeeded, some failed
  Partial,
  /// Every item failed
  Failure,
}

#[derive(Debug, Clone)]
pub struct BatchSuccess<I, T> {
  /// Position in the input
  pub index: usize,
  pub item: I,
  pub output: T,
}

#[derive(Debug, Clone)]
pub struct BatchFailure<I, E> {
  /// Position in the input
  pub index: usize,
  pub item: I,
  pub error: E,
}

/// Per-item outcomes of a batch, in input order within each list.
#[derive(Debug, Clone)]
pub struct BatchResult<I, T, E> {
  pub succeeded: Vec<BatchSuccess<I, T>>,
  pub failed: Vec<BatchFailure<I, E>>,
}

impl<I, T, E> Default for BatchResult<I, T, E> {
  fn default() -> Self {
    Self {
      succeeded: Vec::new(),
      failed: Vec::new(),
    }
  }
}

impl<I, T, E> BatchResult<I, T, E> {
  pub fn total(&self) -> usize {
    self.succeeded.len() + self.failed.len()
  }

  pub fn outcome(&self) -> BatchOutcome {
    match (self.succeeded.is_empty(), self.failed.is_empty()) {
      (_, true) => BatchOutcome::Success,
      (true, false) => BatchOutcome::Failure,
      (false, false) => BatchOutcome::Partial,
    }
  }

  /// True unless every item failed.
  pub fn any_succeeded(&self) -> bool {
    self.outcome() != BatchOutcome::Failure
  }
}

/// Progress snapshot of a running batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
  pub completed: usize,
  pub failed: usize,
  pub total: usize,
}

/// An ordered batch and its per-item results.
#[derive(Debug)]
pub struct BatchJob<I, T, E> {
  label: String,
  items: Vec<I>,
  status: BatchStatus,
  result: BatchResult<I, T, E>,
}

impl<I: Clone, T, E: std::fmt::Display> BatchJob<I, T, E> {
  pub fn new(label: impl Into<String>, items: Vec<I>) -> Self {
    Self {
      label: label.into(),
      items,
      status: BatchStatus::Running,
      result: BatchResult::default(),
    }
  }

  pub fn status(&self) -> BatchStatus {
    self.status
  }

  pub fn progress(&self) -> BatchProgress {
    BatchProgress {
      completed: self.result.total(),
      failed: self.result.failed.len(),
      total: self.items.len(),
    }
  }

  /// Execute every item one at a time, in input order.
  ///
  /// Each item settles before the next one starts. A failed item is recorded
  /// and the batch moves on; nothing already done is retried or undone.
  pub async fn run<F, Fut>(
    mut self,
    options: BatchOptions,
    mut executor: F,
    mut on_progress: impl FnMut(BatchProgress),
  ) -> BatchResult<I, T, E>
  where
    F: FnMut(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    let items = self.items.clone();
    let total = items.len();
    info!(batch = %self.label, total, "batch started");

    let mut last_start: Option<Instant> = None;
    for (index, item) in items.into_iter().enumerate() {
      if let Some(last) = last_start {
        if !options.spacing.is_zero() {
          tokio::time::sleep_until(last + options.spacing).await;
        }
      }
      last_start = Some(Instant::now());

      match executor(item.clone()).await {
        Ok(output) => self.result.succeeded.push(BatchSuccess {
          index,
          item,
          output,
        }),
        Err(error) => {
          warn!(batch = %self.label, index, error = %error, "batch item failed");
          self.result.failed.push(BatchFailure { index, item, error });
        }
      }
      on_progress(self.progress());
    }

    self.status = BatchStatus::Completed;
    info!(
      batch = %self.label,
      succeeded = self.result.succeeded.len(),
      failed = self.result.failed.len(),
      outcome = ?self.result.outcome(),
      "batch completed"
    );
    self.result
  }
}

/// Runs batches with a fixed throttling policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchThrottler {
  options: BatchOptions,
}

impl BatchThrottler {
  pub fn new(options: BatchOptions) -> Self {
    Self { options }
  }

  pub fn options(&self) -> BatchOptions {
    self.options
  }

  pub async fn run_batch<I, T, E, F, Fut>(
    &self,
    label: &str,
    items: Vec<I>,
    executor: F,
  ) -> BatchResult<I, T, E>
  where
    I: Clone,
    E: std::fmt::Display,
    F: FnMut(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    BatchJob::new(label, items)
      .run(self.options, executor, |_| {})
      .await
  }
}
