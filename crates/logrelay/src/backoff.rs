// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded exponential retry.
//!
//! Used by the arbitrator around the local bind (20ms base, 1s cap) and by the
//! streaming sink around reconnects (larger cap). The helper never logs; the
//! caller decides what a failure means.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Delay state of one retry loop.
///
/// Starts at `base` and doubles after every failed attempt, clamped to `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    /// A base above the cap is clamped to the cap.
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        let base = base.min(cap);
        Self {
            base,
            cap,
            current: base,
        }
    }

    #[must_use]
    pub fn base(&self) -> Duration {
        self.base
    }

    #[must_use]
    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// The delay the next failed attempt will sleep for.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the delay to sleep now and doubles the stored one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(2)
            .map_or(self.cap, |doubled| doubled.min(self.cap));
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Outcome of a failed attempt: retry it, or give up with the error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError<E> {
    Transient(E),
    Terminal(E),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError<E> {
    #[error("retry loop cancelled")]
    Cancelled,
    #[error("{0}")]
    Terminal(E),
}

/// Runs `op` until it succeeds, fails terminally, or `cancel` fires.
///
/// Cancellation is observed before every attempt and during every sleep, so
/// the loop never outlives the token by more than one in-flight attempt.
pub async fn retry<T, E, F, Fut>(
    cancel: &CancellationToken,
    backoff: &mut Backoff,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AttemptError<E>>>,
{
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Terminal(err)) => return Err(RetryError::Terminal(err)),
            Err(AttemptError::Transient(_)) => {
                let delay = backoff.next_delay();
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(RetryError::Cancelled),
                    () = sleep(delay) => {}
                }
            }
        }
    }
}
