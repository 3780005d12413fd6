//! Retry wrapper for persistence writes.
//!
//! Errors are sorted into two classes by [`classify`]; only transient ones
//! (lock waits, lock conflicts, timeouts, unavailable connections) are
//! retried. The delay before retry `n` is `min(base * 2^n, cap) + jitter`,
//! plus a fixed extra delay while a bulk rebuild is in progress so that
//! foreground writes yield to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::StorageError;
use crate::telemetry::metrics::RETRY_ATTEMPTS;
use crate::{Error, Result};

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Contention or transport trouble; the same operation may succeed later.
    Transient,
    /// Retrying cannot help.
    Permanent,
}

impl ErrorClass {
    const fn label(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

/// Classify an error.
#[must_use]
pub fn classify(err: &Error) -> ErrorClass {
    match err {
        Error::Storage(
            StorageError::Busy(_)
            | StorageError::Locked(_)
            | StorageError::Timeout(_)
            | StorageError::Connection(_),
        ) => ErrorClass::Transient,
        Error::Io(io) => match io.kind() {
            std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        },
        _ => ErrorClass::Permanent,
    }
}

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling on the exponential part of the delay.
    pub max_delay: Duration,
    /// Upper bound of the random delay added to every retry.
    pub jitter: Duration,
    /// Extra delay while a bulk rebuild is running.
    pub bulk_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            jitter: Duration::from_millis(100),
            bulk_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Exponential part of the delay before retry `attempt` (0-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Full delay before retry `attempt` given a jitter sample.
    #[must_use]
    pub fn delay(&self, attempt: u32, bulk_active: bool, jitter: Duration) -> Duration {
        let mut delay = self.backoff(attempt) + jitter.min(self.jitter);
        if bulk_active {
            delay += self.bulk_delay;
        }
        delay
    }

    fn sample_jitter(&self) -> Duration {
        let max = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

/// Shared flag raised while a full rebuild runs.
#[derive(Debug, Clone, Default)]
pub struct BulkIndexSignal(Arc<AtomicBool>);

impl BulkIndexSignal {
    /// Create a lowered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a bulk rebuild is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Raise the signal until the returned guard is dropped.
    #[must_use]
    pub fn activate(&self) -> BulkIndexGuard {
        self.0.store(true, Ordering::Release);
        BulkIndexGuard(self.clone())
    }
}

/// Lowers the [`BulkIndexSignal`] on drop.
#[derive(Debug)]
pub struct BulkIndexGuard(BulkIndexSignal);

impl Drop for BulkIndexGuard {
    fn drop(&mut self) {
        (self.0).0.store(false, Ordering::Release);
    }
}

/// Runs operations under a [`RetryPolicy`], honouring the bulk signal.
#[derive(Debug, Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    bulk: BulkIndexSignal,
}

impl Retrier {
    /// Create a retrier.
    #[must_use]
    pub const fn new(policy: RetryPolicy, bulk: BulkIndexSignal) -> Self {
        Self { policy, bulk }
    }

    /// The policy in use.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op`, retrying transient failures.
    ///
    /// Sleeps the calling thread between attempts, so call it from the
    /// builder thread or inside `spawn_blocking`.
    ///
    /// # Errors
    ///
    /// Returns a permanent error immediately, or the last transient error
    /// once retries are exhausted.
    pub fn run<T, F>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let class = classify(&err);
                    RETRY_ATTEMPTS.with_label_values(&[class.label()]).inc();

                    if class == ErrorClass::Permanent || attempt >= self.policy.max_retries {
                        if class == ErrorClass::Transient {
                            tracing::warn!(op = label, attempts = attempt + 1, error = %err, "Retries exhausted");
                        }
                        return Err(err);
                    }

                    let delay = self.policy.delay(
                        attempt,
                        self.bulk.is_active(),
                        self.policy.sample_jitter(),
                    );
                    tracing::debug!(
                        op = label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Transient failure, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// Run `op` under `policy` without a bulk signal.
///
/// # Errors
///
/// See [`Retrier::run`].
pub fn with_retry<T, F>(policy: &RetryPolicy, label: &str, op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    Retrier::new(policy.clone(), BulkIndexSignal::new()).run(label, op)
}
