// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded-attempts retry with a cancellable delay.
//!
//! The handler owns the delay computation (base interval, optional
//! multiplier and jitter) and a single cancellable timer. Cancellation flips
//! a flag under a mutex and wakes the waiting thread through a condvar, so a
//! pending delay aborts promptly and the retried closure is never entered
//! again afterwards. A handler waits on at most one timer at a time by
//! construction: `wait` borrows the handler mutably.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Condvar;
use parking_lot::Mutex;
use tracing::debug;
use uohsm_crypto::Rng;

use crate::error::HsmError;
use crate::error::HsmResult;

/// Delay and budget configuration for a retry sequence.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_interval: Duration,
    /// Factor applied to the delay after every retry; 1.0 keeps it constant.
    pub multiplier: f64,
    /// Upper bound of a uniformly random addition to every delay.
    pub jitter: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_interval: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter: None,
        }
    }
}

#[derive(Default)]
struct Shared {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

/// Cancels the pending delay of the handler it was taken from.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    /// Aborts any pending delay; the retried closure is not re-entered.
    pub fn cancel(&self) {
        let mut cancelled = self.shared.cancelled.lock();
        *cancelled = true;
        self.shared.signal.notify_all();
    }
}

/// Retry driver for one logical operation.
pub struct RetryHandler {
    policy: RetryPolicy,
    attempts: u32,
    shared: Arc<Shared>,
}

impl RetryHandler {
    /// Creates a handler with the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Forgets past attempts; cancellation state is kept.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// True once the attempt budget is spent.
    pub fn limit_reached(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    /// Handle that can cancel this handler's pending delay.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: self.shared.clone(),
        }
    }

    /// Delay scheduled before the next attempt.
    fn next_interval(&self) -> Duration {
        // attempts is at least 1 when a delay is computed.
        let exp = self.attempts.saturating_sub(1);
        let scaled = self.policy.base_interval.as_millis() as f64
            * self.policy.multiplier.powi(exp as i32);
        let mut delay = Duration::from_millis(scaled as u64);
        if let Some(jitter) = self.policy.jitter {
            let jitter_ms = jitter.as_millis() as u64;
            if jitter_ms > 0 {
                let draw = Rng::rand_u32().unwrap_or(0) as u64 % (jitter_ms + 1);
                delay += Duration::from_millis(draw);
            }
        }
        delay
    }

    /// Sleeps the computed delay; returns the delay, or `Cancelled`.
    fn wait(&mut self) -> HsmResult<Duration> {
        let delay = self.next_interval();
        debug!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, "retry scheduled");

        let mut cancelled = self.shared.cancelled.lock();
        if *cancelled {
            Err(HsmError::Cancelled)?;
        }
        self.shared.signal.wait_for(&mut cancelled, delay);
        if *cancelled {
            Err(HsmError::Cancelled)?;
        }
        Ok(delay)
    }

    /// Runs `thunk` under the retry budget.
    ///
    /// Retryable failures (connection, corrupt response) consume an attempt
    /// and wait out the delay; everything else surfaces immediately. The
    /// last failure is returned once the budget is spent. A cancelled
    /// handler never re-enters the closure.
    pub fn run<T>(&mut self, mut thunk: impl FnMut() -> HsmResult<T>) -> HsmResult<T> {
        loop {
            if *self.shared.cancelled.lock() {
                Err(HsmError::Cancelled)?;
            }
            self.attempts += 1;
            match thunk() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && !self.limit_reached() => {
                    debug!(attempt = self.attempts, error = %err, "attempt failed, retrying");
                    self.wait()?;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
