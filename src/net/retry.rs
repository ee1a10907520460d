use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::transport::{HttpResponse, TransportError};

/// Statuses worth another attempt; every other status is handed back as-is.
const RETRYABLE_STATUSES: [u16; 2] = [404, 503];
/// Upper bound on a single backoff wait.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: f64,
}

impl RetryPolicy {
    /// Wait inserted after the zero-based `attempt` fails: `backoff_base ^ attempt` seconds.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        Duration::try_from_secs_f64(self.backoff_base.powi(exponent))
            .map_or(MAX_BACKOFF, |wait| wait.min(MAX_BACKOFF))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LastFailure {
    Status(u16),
    Transport(TransportError),
}

impl fmt::Display for LastFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(f, "HTTP {status}"),
            Self::Transport(error) => write!(f, "{error}"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RetryError {
    #[error("{label}: retries exhausted after {attempts} attempts (last: {last})")]
    Exhausted {
        label: String,
        attempts: u32,
        last: LastFailure,
    },
}

pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    sleeper: Sleeper,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_sleeper(policy, Arc::new(std::thread::sleep))
    }

    pub fn with_sleeper(policy: RetryPolicy, sleeper: Sleeper) -> Self {
        Self { policy, sleeper }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn execute<F>(&self, label: &str, mut operation: F) -> Result<HttpResponse, RetryError>
    where
        F: FnMut() -> Result<HttpResponse, TransportError>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last = LastFailure::Status(0);

        for attempt in 0..max_attempts {
            match operation() {
                Ok(response) => {
                    for hop in &response.redirects {
                        info!(
                            request = label,
                            status = hop.status,
                            from = %hop.from,
                            to = %hop.to,
                            "followed redirect"
                        );
                    }

                    if !RETRYABLE_STATUSES.contains(&response.status) {
                        debug!(
                            request = label,
                            attempt = attempt + 1,
                            status = response.status,
                            elapsed_ms = response.elapsed.as_millis() as u64,
                            "request completed"
                        );
                        return Ok(response);
                    }

                    warn!(
                        request = label,
                        attempt = attempt + 1,
                        max_attempts,
                        status = response.status,
                        "retryable status"
                    );
                    last = LastFailure::Status(response.status);
                }
                Err(error) => {
                    warn!(
                        request = label,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %error,
                        "transport failure"
                    );
                    last = LastFailure::Transport(error);
                }
            }

            if attempt + 1 < max_attempts {
                let wait = self.policy.backoff_after(attempt);
                debug!(request = label, wait_ms = wait.as_millis() as u64, "backing off");
                (self.sleeper)(wait);
            }
        }

        Err(RetryError::Exhausted {
            label: label.to_string(),
            attempts: max_attempts,
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::sync::Mutex;

    use super::*;

    fn response(status: u16) -> HttpResponse {
        HttpResponse {
            status,
            final_url: "https://example.test/".to_string(),
            body: b"ok".to_vec(),
            content_type: None,
            redirects: Vec::new(),
            elapsed: Duration::from_millis(5),
        }
    }

    fn recording_executor(policy: RetryPolicy) -> (RetryExecutor, Arc<Mutex<Vec<Duration>>>) {
        let waits = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&waits);
        let executor = RetryExecutor::with_sleeper(
            policy,
            Arc::new(move |wait| sink.lock().expect("lock").push(wait)),
        );
        (executor, waits)
    }

    #[test]
    fn backoff_is_capped_for_large_attempts() {
        let policy = RetryPolicy {
            max_attempts: 1100,
            backoff_base: 2.0,
        };
        assert_eq!(policy.backoff_after(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_after(30), MAX_BACKOFF);
        assert_eq!(policy.backoff_after(1099), MAX_BACKOFF);
        assert_eq!(policy.backoff_after(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn succeeds_on_third_attempt_after_two_503s() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base: 3.0,
        };
        let (executor, waits) = recording_executor(policy);
        let statuses = RefCell::new(vec![503, 503, 200].into_iter());

        let result = executor
            .execute("probe", || {
                Ok(response(statuses.borrow_mut().next().expect("status")))
            })
            .expect("third attempt should succeed");

        assert_eq!(result.status, 200);
        let waits = waits.lock().expect("lock");
        assert_eq!(*waits, vec![Duration::from_secs(1), Duration::from_secs(3)]);
        let total: Duration = waits.iter().sum();
        assert_eq!(total, Duration::from_secs_f64(1.0 + 3.0));
    }

    #[test]
    fn always_404_exhausts_attempts() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff_base: 2.0,
        };
        let (executor, waits) = recording_executor(policy);
        let calls = RefCell::new(0_u32);

        let error = executor
            .execute("missing", || {
                *calls.borrow_mut() += 1;
                Ok(response(404))
            })
            .expect_err("404 forever should exhaust");

        assert_eq!(*calls.borrow(), 4);
        assert_eq!(waits.lock().expect("lock").len(), 3);
        match error {
            RetryError::Exhausted { attempts, last, .. } => {
                assert_eq!(attempts, 4);
                assert!(matches!(last, LastFailure::Status(404)));
            }
        }
    }

    #[test]
    fn non_retryable_status_returns_immediately() {
        let (executor, waits) = recording_executor(RetryPolicy::default());
        let calls = RefCell::new(0_u32);

        let result = executor
            .execute("forbidden", || {
                *calls.borrow_mut() += 1;
                Ok(response(403))
            })
            .expect("403 is returned, not retried");

        assert_eq!(result.status, 403);
        assert_eq!(*calls.borrow(), 1);
        assert!(waits.lock().expect("lock").is_empty());
    }

    #[test]
    fn transport_errors_are_retried_and_reported() {
        let (executor, _) = recording_executor(RetryPolicy {
            max_attempts: 2,
            backoff_base: 1.5,
        });

        let error = executor
            .execute("flaky", || Err(TransportError::Timeout("slow".to_string())))
            .expect_err("timeouts should exhaust");

        let RetryError::Exhausted { last, .. } = error;
        assert!(matches!(last, LastFailure::Transport(TransportError::Timeout(_))));
    }
}
