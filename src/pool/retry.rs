use crate::errors::Result;
use async_trait::async_trait;

/// Hands out connections for a retried operation.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
  /// Connection type.
  type Connection: Send;
  /// A connection to run the action on.
  async fn acquire(&self) -> Result<Self::Connection>;
  /// Throw away a connection after a retryable failure.
  async fn discard(&self, connection: Self::Connection);
}

/// The operation driven by a [`RetryPolicy`].
#[async_trait]
pub trait RetryAction<C: Send>: Send {
  /// Value produced on success.
  type Output: Send;
  /// Run once on `connection`.
  async fn run(&mut self, connection: &mut C) -> Result<Self::Output>;
}

/// Outcome of [`RetryPolicy::execute`] and the connection it ended on.
#[derive(Debug)]
pub struct RetryResult<C, T> {
  /// Connection used by the last attempt, if one could be obtained.
  pub connection: Option<C>,
  /// Last result.
  pub outcome: Result<T>,
}

/// Re-runs an action on a fresh connection after a retryable failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  attempts: usize,
}

impl RetryPolicy {
  /// At most `attempts` runs in total, at least one.
  pub fn new(attempts: usize) -> Self {
    RetryPolicy {
      attempts: attempts.max(1),
    }
  }
  /// Total runs allowed.
  pub fn attempts(&self) -> usize {
    self.attempts
  }
  /// Run `action` against `initial`, or a connection from `source`.
  ///
  /// A retryable failure discards the connection and tries again on a new
  /// one until the attempts run out. Any other failure returns immediately.
  pub async fn execute<S, A>(
    &self,
    source: &S,
    initial: Option<S::Connection>,
    action: &mut A,
  ) -> RetryResult<S::Connection, A::Output>
  where
    S: ConnectionSource,
    A: RetryAction<S::Connection>,
  {
    let mut current = initial;
    let mut attempt = 0;
    loop {
      let mut connection = match current.take() {
        Some(connection) => connection,
        None => match source.acquire().await {
          Ok(connection) => connection,
          Err(err) => {
            return RetryResult {
              connection: None,
              outcome: Err(err),
            }
          }
        },
      };
      attempt += 1;
      let outcome = action.run(&mut connection).await;
      match outcome {
        Err(err) if err.is_retryable() && attempt < self.attempts => {
          tracing::debug!("attempt {} failed, retrying: {}", attempt, err);
          source.discard(connection).await;
        }
        outcome => {
          return RetryResult {
            connection: Some(connection),
            outcome,
          }
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::errors::Error;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Default)]
  struct Counter {
    acquired: AtomicUsize,
    discarded: AtomicUsize,
  }

  #[async_trait]
  impl ConnectionSource for Counter {
    type Connection = usize;
    async fn acquire(&self) -> Result<usize> {
      Ok(self.acquired.fetch_add(1, Ordering::SeqCst))
    }
    async fn discard(&self, _connection: usize) {
      self.discarded.fetch_add(1, Ordering::SeqCst);
    }
  }

  struct FailFirst {
    failures: usize,
    runs: usize,
    kind: fn() -> Error,
  }

  #[async_trait]
  impl RetryAction<usize> for FailFirst {
    type Output = usize;
    async fn run(&mut self, connection: &mut usize) -> Result<usize> {
      self.runs += 1;
      if self.runs <= self.failures {
        return Err((self.kind)());
      }
      Ok(*connection)
    }
  }

  fn retryable() -> Error {
    Error::Retryable("eof".to_string())
  }

  fn fatal() -> Error {
    Error::Protocol("bad".to_string())
  }

  #[tokio::test]
  async fn retries_exactly_the_failed_attempts() {
    let source = Counter::default();
    let mut action = FailFirst {
      failures: 2,
      runs: 0,
      kind: retryable,
    };
    let result = RetryPolicy::new(3).execute(&source, None, &mut action).await;
    assert_eq!(result.outcome.unwrap(), 2);
    assert_eq!(result.connection, Some(2));
    assert_eq!(action.runs, 3);
    assert_eq!(source.discarded.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn last_failure_surfaces() {
    let source = Counter::default();
    let mut action = FailFirst {
      failures: 5,
      runs: 0,
      kind: retryable,
    };
    let result = RetryPolicy::new(2).execute(&source, Some(100), &mut action).await;
    assert!(result.outcome.unwrap_err().is_retryable());
    assert_eq!(action.runs, 2);
    assert_eq!(source.acquired.load(Ordering::SeqCst), 1);
    assert_eq!(result.connection, Some(0));
  }

  #[tokio::test]
  async fn other_errors_are_not_retried() {
    let source = Counter::default();
    let mut action = FailFirst {
      failures: 1,
      runs: 0,
      kind: fatal,
    };
    let result = RetryPolicy::new(3).execute(&source, None, &mut action).await;
    assert!(matches!(result.outcome, Err(Error::Protocol(_))));
    assert_eq!(action.runs, 1);
    assert_eq!(source.discarded.load(Ordering::SeqCst), 0);
  }
}
