//! Fixed-interval "retry until a check holds" combinator.
//!
//! Every eventually-true condition in the harness is polled through
//! [`retry_with_check`]. Each attempt calls the operation and then runs the
//! check on its result. Operation errors go through an optional classifier.
//! What happens when attempts run out is chosen by the caller through
//! [`Exhaustion`].

use crate::config::{Exhaustion, RetryPolicy};
use crate::error::HarnessError;
use backon::{ConstantBuilder, Retryable};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Decides what to do with an operation error: `true` stops the loop and
/// swallows the error, `false` keeps retrying.
pub type ErrorClassifier = dyn Fn(&anyhow::Error) -> bool + Send + Sync;

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    /// The check passed on attempt `attempts`
    Satisfied { value: T, attempts: u32 },
    /// Attempts ran out; `last` is the most recent successful result
    Exhausted { last: Option<T>, attempts: u32 },
    /// The error classifier asked to stop
    Stopped { last: Option<T>, attempts: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, RetryOutcome::Satisfied { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Satisfied { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Stopped { attempts, .. } => *attempts,
        }
    }

    /// The satisfying value, if the check ever passed
    pub fn into_value(self) -> Option<T> {
        match self {
            RetryOutcome::Satisfied { value, .. } => Some(value),
            _ => None,
        }
    }

    /// The most recent result, whether or not it passed the check
    pub fn into_last(self) -> Option<T> {
        match self {
            RetryOutcome::Satisfied { value, .. } => Some(value),
            RetryOutcome::Exhausted { last, .. } | RetryOutcome::Stopped { last, .. } => last,
        }
    }
}

enum AttemptError {
    Unsatisfied,
    Retry,
    Stop,
    Fatal(anyhow::Error),
}

/// Invokes `operation` until `check(result, attempt)` holds, at most
/// `policy.max_attempts` times, sleeping `policy.delay()` in between.
///
/// Without an `on_error` classifier the first operation error aborts the loop
/// and is returned, keeping its [`HarnessError`] kind when it has one.
/// Running out of attempts returns [`RetryOutcome::Exhausted`] or
/// [`HarnessError::RetryExhausted`] named after `label`, depending on
/// `policy.on_exhaustion`.
pub async fn retry_with_check<T, Op, Fut, Check>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: Op,
    check: Check,
    on_error: Option<&ErrorClassifier>,
) -> Result<RetryOutcome<T>, HarnessError>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    Check: Fn(&T, u32) -> bool,
{
    policy
        .validate()
        .map_err(|e| HarnessError::InvalidArgument(format!("invalid retry policy: {e}")))?;

    let attempt = AtomicU32::new(0);
    let last: Mutex<Option<T>> = Mutex::new(None);

    let backoff = ConstantBuilder::default()
        .with_delay(policy.delay())
        .with_max_times(policy.max_attempts.saturating_sub(1) as usize);

    let (attempt_ref, last_ref, check_ref) = (&attempt, &last, &check);
    let result = (move || {
        let n = attempt_ref.fetch_add(1, Ordering::Relaxed) + 1;
        let fut = operation();
        let (check, last) = (check_ref, last_ref);
        async move {
            match fut.await {
                Ok(value) => {
                    if check(&value, n) {
                        Ok(value)
                    } else {
                        *last.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
                        Err(AttemptError::Unsatisfied)
                    }
                }
                Err(e) => match on_error {
                    None => Err(AttemptError::Fatal(e)),
                    Some(classify) if classify(&e) => {
                        debug!(
                            operation = label,
                            attempt = n,
                            error = %e,
                            "error classifier stopped retry loop"
                        );
                        Err(AttemptError::Stop)
                    }
                    Some(_) => {
                        debug!(
                            operation = label,
                            attempt = n,
                            error = %e,
                            "operation failed, retrying"
                        );
                        Err(AttemptError::Retry)
                    }
                },
            }
        }
    })
    .retry(backoff)
    .when(|e: &AttemptError| matches!(e, AttemptError::Unsatisfied | AttemptError::Retry))
    .await;

    let attempts = attempt.load(Ordering::Relaxed);
    let last = last.into_inner().unwrap_or_else(PoisonError::into_inner);

    match result {
        Ok(value) => Ok(RetryOutcome::Satisfied { value, attempts }),
        Err(AttemptError::Fatal(e)) => {
            Err(e.downcast::<HarnessError>().unwrap_or_else(HarnessError::Other))
        }
        Err(AttemptError::Stop) => Ok(RetryOutcome::Stopped { last, attempts }),
        Err(AttemptError::Unsatisfied | AttemptError::Retry) => match policy.on_exhaustion {
            Exhaustion::ReturnLast => Ok(RetryOutcome::Exhausted { last, attempts }),
            Exhaustion::Fail => Err(HarnessError::RetryExhausted {
                operation: label.to_string(),
                attempts,
            }),
        },
    }
}

/// Polls `operation` until `check` holds and returns the satisfying value.
/// Exhaustion is always an error here, named after `label`.
pub async fn retry_until<T, Op, Fut, Check>(
    policy: &RetryPolicy,
    label: &str,
    operation: Op,
    check: Check,
) -> Result<T, HarnessError>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    Check: Fn(&T, u32) -> bool,
{
    let policy = policy.clone().failing_on_exhaustion();
    match retry_with_check(&policy, label, operation, check, None).await? {
        RetryOutcome::Satisfied { value, .. } => Ok(value),
        outcome => Err(HarnessError::RetryExhausted {
            operation: label.to_string(),
            attempts: outcome.attempts(),
        }),
    }
}
