//! Retry delays and the recoverability of execution errors.

use jiff::{Span, ToSpan};
use serde::{Deserialize, Serialize};

use crate::{
    executor::{ErrorKind, ExecutionError},
    task::QueuedTask,
    timestamp::Timestamp,
};

// Upper bound for any computed delay: one day.
const MAX_DELAY_MS: i64 = 86_400_000;

/// Named backoff curves used to schedule reposts after a failure.
///
/// The error count passed in is the count *including* the failure being
/// handled, so the first failure uses `1`.
///
/// # Example
///
/// ```rust
/// use stakhanov::task::BackoffStrategy;
///
/// let backoff = BackoffStrategy::exponential(500, 2.0, 30_000);
/// let strategy: BackoffStrategy =
///     serde_json::from_str(r#"{ "strategy": "fixed", "delay_ms": 250 }"#)?;
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// The same delay after every failure.
    Fixed {
        /// Delay in milliseconds.
        delay_ms: i64,
    },

    /// A delay that grows by a fixed step per failure.
    Linear {
        /// Delay after the first failure.
        initial_ms: i64,
        /// Added for every further failure.
        step_ms: i64,
        /// Upper bound.
        max_ms: i64,
    },

    /// A delay that grows by a coefficient per failure.
    Exponential {
        /// Delay after the first failure.
        initial_ms: i64,
        /// Growth factor.
        coefficient: f64,
        /// Upper bound.
        max_ms: i64,
    },

    /// `10^n` milliseconds after the `n`-th failure.
    PowerOfTen,
}

impl BackoffStrategy {
    /// A fixed delay.
    pub const fn fixed(delay_ms: i64) -> Self {
        Self::Fixed { delay_ms }
    }

    /// A linearly growing delay.
    pub const fn linear(initial_ms: i64, step_ms: i64, max_ms: i64) -> Self {
        Self::Linear {
            initial_ms,
            step_ms,
            max_ms,
        }
    }

    /// An exponentially growing delay.
    pub const fn exponential(initial_ms: i64, coefficient: f64, max_ms: i64) -> Self {
        Self::Exponential {
            initial_ms,
            coefficient,
            max_ms,
        }
    }

    /// Delay before attempt number `error_count + 1`, in milliseconds.
    pub fn calculate_delay_ms(&self, error_count: i32) -> i64 {
        let n = error_count.max(1);
        let delay = match *self {
            Self::Fixed { delay_ms } => delay_ms,
            Self::Linear {
                initial_ms,
                step_ms,
                max_ms,
            } => initial_ms
                .saturating_add(step_ms.saturating_mul(i64::from(n - 1)))
                .min(max_ms),
            Self::Exponential {
                initial_ms,
                coefficient,
                max_ms,
            } => {
                let backoff = initial_ms as f64 * coefficient.powi(n - 1);
                backoff.min(max_ms as f64) as i64
            }
            Self::PowerOfTen => 10_i64.checked_pow(n as u32).unwrap_or(MAX_DELAY_MS),
        };

        delay.clamp(0, MAX_DELAY_MS)
    }

    /// Delay before attempt number `error_count + 1`.
    pub fn calculate_delay(&self, error_count: i32) -> Span {
        self.calculate_delay_ms(error_count).milliseconds()
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::PowerOfTen
    }
}

/// Decides whether a failed execution may be retried.
///
/// Errors of a kind listed in `unrecoverable` are never retried, and neither
/// are [`ErrorKind::Fatal`] or [`ErrorKind::Unsupported`] errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recoverability {
    /// Error kinds that fail a task outright.
    pub unrecoverable: Vec<ErrorKind>,
}

impl Recoverability {
    /// A table where every non-fatal error is retried.
    pub const fn all_recoverable() -> Self {
        Self {
            unrecoverable: Vec::new(),
        }
    }

    /// Builds a table from the given unrecoverable kinds.
    pub fn unrecoverable(kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self {
            unrecoverable: kinds.into_iter().collect(),
        }
    }

    /// Returns `true` when another attempt at `task` may succeed.
    pub fn is_recoverable(&self, _task: &QueuedTask, error: &ExecutionError) -> bool {
        let kind = error.kind();
        !matches!(kind, ErrorKind::Fatal | ErrorKind::Unsupported)
            && !self.unrecoverable.contains(&kind)
    }
}

impl Default for Recoverability {
    fn default() -> Self {
        Self::unrecoverable([ErrorKind::InvalidInput, ErrorKind::Defect])
    }
}

/// Computes when a failed task should be attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RetryCalculator {
    backoff: BackoffStrategy,
}

impl RetryCalculator {
    /// Creates a calculator following `backoff`.
    pub const fn new(backoff: BackoffStrategy) -> Self {
        Self { backoff }
    }

    /// The retry time for a task that has failed `error_count` times before
    /// the failure being handled.
    ///
    /// Falls back to `now` when the delay cannot be applied.
    pub fn compute_retry_at(&self, error_count: i32, now: Timestamp) -> Timestamp {
        let delay = self.backoff.calculate_delay(error_count.saturating_add(1));
        now.checked_add(delay).unwrap_or_else(|err| {
            tracing::warn!(%err, "Could not apply retry delay, retrying immediately");
            now
        })
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::task::tests::task_with_id;

    #[test]
    fn power_of_ten_grows_and_caps() {
        let backoff = BackoffStrategy::PowerOfTen;
        assert_eq!(backoff.calculate_delay_ms(1), 10);
        assert_eq!(backoff.calculate_delay_ms(2), 100);
        assert_eq!(backoff.calculate_delay_ms(4), 10_000);
        assert_eq!(backoff.calculate_delay_ms(30), MAX_DELAY_MS);
    }

    #[test]
    fn exponential_follows_coefficient() {
        let backoff = BackoffStrategy::exponential(1_000, 2.0, 60_000);
        assert_eq!(backoff.calculate_delay_ms(1), 1_000);
        assert_eq!(backoff.calculate_delay_ms(2), 2_000);
        assert_eq!(backoff.calculate_delay_ms(3), 4_000);
        assert_eq!(backoff.calculate_delay_ms(10), 60_000);
    }

    #[test]
    fn linear_and_fixed() {
        let linear = BackoffStrategy::linear(100, 50, 300);
        assert_eq!(linear.calculate_delay_ms(1), 100);
        assert_eq!(linear.calculate_delay_ms(3), 200);
        assert_eq!(linear.calculate_delay_ms(9), 300);

        assert_eq!(BackoffStrategy::fixed(250).calculate_delay_ms(7), 250);
    }

    #[test]
    fn strategies_deserialize_by_name() -> Result<(), serde_json::Error> {
        let strategy: BackoffStrategy = serde_json::from_str(
            r#"{ "strategy": "exponential", "initial_ms": 10, "coefficient": 3.0, "max_ms": 100 }"#,
        )?;
        assert_eq!(strategy, BackoffStrategy::exponential(10, 3.0, 100));

        let strategy: BackoffStrategy = serde_json::from_str(r#"{ "strategy": "power_of_ten" }"#)?;
        assert_eq!(strategy, BackoffStrategy::PowerOfTen);

        Ok(())
    }

    #[test]
    fn default_recoverability_table() {
        let table = Recoverability::default();
        let task = task_with_id(Uuid::new_v4());

        assert!(table.is_recoverable(&task, &ExecutionError::transient("timeout talking to s3")));
        assert!(table.is_recoverable(&task, &ExecutionError::timeout("took too long")));
        assert!(!table.is_recoverable(&task, &ExecutionError::invalid_input("bad path")));
        assert!(!table.is_recoverable(&task, &ExecutionError::defect("null handle")));
        assert!(!table.is_recoverable(&task, &ExecutionError::fatal("gave up")));

        let lenient = Recoverability::all_recoverable();
        assert!(lenient.is_recoverable(&task, &ExecutionError::invalid_input("bad path")));
        assert!(!lenient.is_recoverable(&task, &ExecutionError::fatal("gave up")));
    }

    #[test]
    fn retry_at_is_after_now() {
        let now = Timestamp::now();
        let calculator = RetryCalculator::new(BackoffStrategy::fixed(1_500));
        assert_eq!(calculator.compute_retry_at(0, now).millis_since(now), 1_500);

        let calculator = RetryCalculator::default();
        // Third failure with the default curve: 10^3 ms.
        assert_eq!(calculator.compute_retry_at(2, now).millis_since(now), 1_000);
    }
}
