//! Bounded retries for node agent calls.
//!
//! Every control call gets a per-attempt timeout. Transient failures
//! ([`AgentError::is_transient`]) are retried up to `max_retries` more times.
//! The wait between attempts grows like the Fibonacci sequence over the
//! backoff increment (`b, b, 2b, 3b, 5b, ...`) with up to a quarter of random
//! jitter added so that many coordinators retrying at once spread out.

use crate::distributed::agent::AgentError;
use rand::Rng;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Environment variable overriding [`RetryPolicy::max_retries`].
pub const RETRIES_ENV: &str = "CLUSTERWEAVE_NODE_RETRIES";
/// Environment variable overriding [`RetryPolicy::backoff_increment`], in milliseconds.
pub const BACKOFF_ENV: &str = "CLUSTERWEAVE_RETRY_BACKOFF_MS";

/// Reads `name` from the environment and parses it, or `None` when the
/// variable is unset or does not parse.
pub(crate) fn read_env<T: FromStr>(name: &str) -> Option<T> {
  std::env::var(name).ok()?.parse().ok()
}

/// Retry policy for node agent calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries after the first attempt.
  pub max_retries: u32,
  /// Base unit of the backoff sequence.
  pub backoff_increment: Duration,
  /// Timeout applied to every single attempt.
  pub call_timeout: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      backoff_increment: Duration::from_millis(1000),
      call_timeout: Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  /// A policy that tries exactly once.
  pub fn none() -> Self {
    Self {
      max_retries: 0,
      ..Self::default()
    }
  }

  /// Builds the default policy, then applies [`RETRIES_ENV`] and
  /// [`BACKOFF_ENV`] when they are set to valid numbers.
  pub fn from_env() -> Self {
    let mut policy = Self::default();
    if let Some(retries) = read_env(RETRIES_ENV) {
      policy.max_retries = retries;
    }
    if let Some(ms) = read_env::<u64>(BACKOFF_ENV) {
      policy.backoff_increment = Duration::from_millis(ms);
    }
    policy
  }

  /// Sets the retry count.
  #[must_use]
  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  /// Sets the backoff increment.
  #[must_use]
  pub fn with_backoff_increment(mut self, increment: Duration) -> Self {
    self.backoff_increment = increment;
    self
  }

  /// Sets the per-attempt timeout.
  #[must_use]
  pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
    self.call_timeout = timeout;
    self
  }

  /// Delay before retry number `retry` (1-based), without jitter.
  pub fn base_delay(&self, retry: u32) -> Duration {
    let (mut previous, mut current) = (0u32, 1u32);
    for _ in 1..retry {
      let next = previous.saturating_add(current);
      previous = current;
      current = next;
    }
    self.backoff_increment.saturating_mul(current)
  }

  /// Delay before retry number `retry`, with random jitter in
  /// `[0, base/4)` added.
  pub fn delay(&self, retry: u32) -> Duration {
    let base = self.base_delay(retry);
    let quarter = (base / 4).as_millis() as u64;
    if quarter == 0 {
      return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..quarter))
  }

  /// Runs `op` under this policy.
  ///
  /// # Arguments
  ///
  /// * `call` - Call name, for logging.
  /// * `node` - Target node id, for logging.
  /// * `op` - Produces one attempt of the call.
  ///
  /// # Errors
  ///
  /// Returns the last error once retries are exhausted, or the first
  /// non-transient error.
  pub async fn run<T, F, Fut>(&self, call: &str, node: &str, op: F) -> Result<T, AgentError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
  {
    self.attempt(call, node, None, op).await
  }

  /// Like [`run`](Self::run), but gives up as soon as `cancel` fires, even
  /// in the middle of an attempt or a backoff wait.
  ///
  /// # Errors
  ///
  /// Returns [`AgentError::Cancelled`] once `cancel` fires, otherwise the
  /// same errors as [`run`](Self::run).
  pub async fn run_cancellable<T, F, Fut>(
    &self,
    call: &str,
    node: &str,
    cancel: &CancellationToken,
    op: F,
  ) -> Result<T, AgentError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
  {
    self.attempt(call, node, Some(cancel), op).await
  }

  async fn attempt<T, F, Fut>(
    &self,
    call: &str,
    node: &str,
    cancel: Option<&CancellationToken>,
    mut op: F,
  ) -> Result<T, AgentError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
  {
    let mut retry = 0;
    loop {
      let result = tokio::select! {
        biased;
        _ = cancelled(cancel) => return Err(AgentError::Cancelled),
        outcome = tokio::time::timeout(self.call_timeout, op()) => {
          outcome.unwrap_or(Err(AgentError::Timeout))
        }
      };
      match result {
        Ok(value) => return Ok(value),
        Err(e) if e.is_transient() && retry < self.max_retries => {
          retry += 1;
          let wait = self.delay(retry);
          warn!(
            call,
            node,
            attempt = retry,
            max_retries = self.max_retries,
            wait_ms = wait.as_millis() as u64,
            error = %e,
            "Node agent call failed, retrying"
          );
          tokio::select! {
            biased;
            _ = cancelled(cancel) => return Err(AgentError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
          }
        }
        Err(e) => return Err(e),
      }
    }
  }
}

async fn cancelled(cancel: Option<&CancellationToken>) {
  match cancel {
    Some(token) => token.cancelled().await,
    None => std::future::pending().await,
  }
}
