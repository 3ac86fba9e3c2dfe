//! Bounded polling/retry helper.
//!
//! Every "wait until the device reports X" and "reconnect until it works"
//! loop goes through [`retry`], so none of them can spin forever.

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("Gave up after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("Aborted: {0}")]
    Aborted(#[source] E),
}

/// Poll interval and attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }
}

/// Run `op` until it yields a value.
///
/// `Ok(Some(v))` finishes, `Ok(None)` sleeps `interval` and tries again,
/// `Err(e)` aborts at once. The attempt number (starting at 1) is passed in.
pub fn retry<T, E, F>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut(u32) -> Result<Option<T>, E>,
{
    for attempt in 1..=policy.max_attempts {
        match op(attempt) {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {
                debug!(attempt, max = policy.max_attempts, "Not ready, retrying");
                if attempt < policy.max_attempts && !policy.interval.is_zero() {
                    thread::sleep(policy.interval);
                }
            }
            Err(e) => return Err(RetryError::Aborted(e)),
        }
    }
    Err(RetryError::Exhausted {
        attempts: policy.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(Duration::ZERO, attempts)
    }

    #[test]
    fn test_succeeds_on_later_attempt() {
        let result: Result<u32, RetryError<io::Error>> =
            retry(&policy(5), |n| Ok((n == 3).then_some(n)));
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_exhausted() {
        let mut calls = 0;
        let result: Result<(), RetryError<io::Error>> = retry(&policy(4), |_| {
            calls += 1;
            Ok(None)
        });
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 4 })));
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_error_aborts() {
        let mut calls = 0;
        let result: Result<(), RetryError<io::Error>> = retry(&policy(4), |_| {
            calls += 1;
            Err(io::Error::other("boom"))
        });
        assert!(matches!(result, Err(RetryError::Aborted(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(policy(0).max_attempts, 1);
    }
}
