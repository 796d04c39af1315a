// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The execution scope handed to every backend operation: a cancellation
//! token, usually a child of a manager's lifecycle token, plus an optional
//! per-operation timeout.

use std::{future::Future, time::Duration};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ContextError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation did not complete within {0:?}")]
    DeadlineExceeded(Duration),
}

/// Cancellation and timeout scope of a backend operation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    timeout: Option<Duration>,
}

impl Context {
    pub fn new(token: CancellationToken) -> Self {
        Context {
            token,
            timeout: None,
        }
    }

    /// A context that is never cancelled and has no timeout.
    pub fn background() -> Self {
        Context::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drives `fut` to completion unless the context is cancelled or the
    /// timeout elapses first, in which case `fut` is dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ContextError> {
        if self.token.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        let bounded = async {
            match self.timeout {
                Some(timeout) => tokio::time::timeout(timeout, fut)
                    .await
                    .map_err(|_| ContextError::DeadlineExceeded(timeout)),
                None => Ok(fut.await),
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ContextError::Cancelled),
            res = bounded => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        assert_eq!(ctx.run(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn test_run_on_cancelled_context() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = Context::new(token);
        assert_eq!(ctx.run(async { 7 }).await, Err(ContextError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_cancelled_while_pending() {
        let token = CancellationToken::new();
        let ctx = Context::new(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });
        let res = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(res, Err(ContextError::Cancelled));
        canceller.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let ctx = Context::background().with_timeout(Duration::from_secs(2));
        let res = ctx
            .run(tokio::time::sleep(Duration::from_secs(60)))
            .await;
        assert_eq!(
            res,
            Err(ContextError::DeadlineExceeded(Duration::from_secs(2)))
        );
    }
}
