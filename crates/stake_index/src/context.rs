//! Per-request cancellation and deadline applied to every store call.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{StakeError, StoreError};

#[derive(Clone, Copy, Debug)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

/// Caller-supplied cancellation signal and deadline, plus the service's
/// per-call store timeout.
///
/// The two time bounds fail differently. Expiry of the caller's deadline is
/// [`StakeError::Timeout`], an interruption like cancellation. A single store
/// call exceeding the store timeout is [`StoreError::Timeout`], a transient
/// backend failure.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Deadline>,
    store_timeout: Option<Duration>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context bound to an existing cancellation token, e.g. a server shutdown token.
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    /// Caller deadline `budget` from now, spanning every store call made with
    /// this context. `Duration::ZERO` disables it.
    pub fn with_deadline(mut self, budget: Duration) -> Self {
        self.deadline = (!budget.is_zero()).then(|| Deadline {
            at: Instant::now() + budget,
            budget,
        });
        self
    }

    /// Bound on each individual store call. `Duration::ZERO` disables it.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn store_timeout(&self) -> Option<Duration> {
        self.store_timeout
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn deadline_error(&self, op: &'static str) -> Option<StakeError> {
        let deadline = self.deadline?;
        (Instant::now() >= deadline.at).then_some(StakeError::Timeout {
            op,
            after: deadline.budget,
        })
    }

    /// Runs one store call, racing it against cancellation, the caller
    /// deadline and the store timeout.
    pub async fn run<T, Fut>(&self, op: &'static str, call: Fut) -> Result<T, StakeError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(StakeError::Cancelled { op });
        }
        if let Some(err) = self.deadline_error(op) {
            return Err(err);
        }
        let bounded = async {
            let result = match self.store_timeout {
                Some(after) => tokio::time::timeout(after, call)
                    .await
                    .unwrap_or(Err(StoreError::Timeout { op, after })),
                None => call.await,
            };
            result.map_err(StakeError::from)
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(deadline.at).await;
                    deadline.budget
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StakeError::Cancelled { op }),
            after = expired => Err(StakeError::Timeout { op, after }),
            result = bounded => result,
        }
    }
}
