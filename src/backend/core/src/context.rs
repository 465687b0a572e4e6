//! Per-operation context: cancellation and deadline.
//!
//! Every engine and manager operation takes an [`OpContext`]. Store round
//! trips run through [`OpContext::run`], which aborts promptly when the token
//! is cancelled or the deadline passes. Aborting drops the in-flight future,
//! which releases its pooled connection and rolls back an open transaction.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{GateError, Result};

#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// No deadline, fresh cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadline `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline_at(Instant::now() + timeout)
    }

    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Derived context: cancelled with its parent, deadline no later than the parent's.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let mut child = Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        };
        if let Some(timeout) = timeout {
            child = child.deadline_at(Instant::now() + timeout);
        }
        child
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

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Run one blocking step of `operation` under this context.
    pub async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(GateError::cancelled(operation));
        }

        let guarded = async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(GateError::cancelled(operation)),
                result = fut => result,
            }
        };

        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, guarded)
                .await
                .map_err(|_| GateError::timeout(operation))?,
            None => guarded.await,
        }
    }
}
