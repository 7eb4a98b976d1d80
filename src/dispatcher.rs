//! Task dispatch with bounded retries.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ActivityError;
use crate::registry::ActivityRegistry;

/// Bounded exponential backoff. `max_attempts` counts the first try, so the
/// default of 3 means one initial attempt plus two retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based: the delay after the
    /// first failure is `backoff_ms(1)`).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms)
    }
}

/// Resolves task names against the registry and applies the retry policy.
/// Retry-vs-fail is decided here, once; callers see only the final outcome.
pub struct TaskDispatcher {
    activities: ActivityRegistry,
    policy: RetryPolicy,
}

impl TaskDispatcher {
    pub fn new(activities: ActivityRegistry, policy: RetryPolicy) -> Self {
        Self { activities, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run the named task to a terminal outcome. Unknown names fail
    /// immediately and permanently; handler errors are retried up to the
    /// policy limit.
    pub async fn invoke(&self, name: &str, input: &str) -> Result<String, ActivityError> {
        let Some(handler) = self.activities.get(name) else {
            return Err(ActivityError::permanent(format!(
                "unregistered task '{name}'"
            )));
        };

        let mut attempt = 1u32;
        loop {
            debug!(task = name, attempt, "invoking task");
            match handler.invoke(input.to_string()).await {
                Ok(result) => return Ok(result),
                Err(msg) => {
                    let err = ActivityError::from(msg);
                    if !err.is_retryable() || attempt >= self.policy.max_attempts {
                        return Err(err);
                    }
                    let backoff = self.policy.backoff_ms(attempt);
                    warn!(task = name, attempt, backoff_ms = backoff, error = %err, "task attempt failed; retrying");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 120,
        };
        assert_eq!(p.backoff_ms(1), 50);
        assert_eq!(p.backoff_ms(2), 100);
        assert_eq!(p.backoff_ms(3), 120);
    }

    #[tokio::test]
    async fn unregistered_task_fails_without_retry() {
        let dispatcher = TaskDispatcher::new(ActivityRegistry::default(), RetryPolicy::default());
        let err = dispatcher.invoke("Nope", "").await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.message.contains("Nope"));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let reg = ActivityRegistry::builder()
            .register("Flaky", move |_input: String| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok("done".to_string())
                    }
                }
            })
            .build();
        let dispatcher = TaskDispatcher::new(
            reg,
            RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
            },
        );
        let out = dispatcher.invoke("Flaky", "").await.unwrap();
        assert_eq!(out, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_then_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let reg = ActivityRegistry::builder()
            .register("AlwaysDown", move |_input: String| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<String, _>("still down".to_string())
                }
            })
            .build();
        let dispatcher = TaskDispatcher::new(
            reg,
            RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
            },
        );
        let err = dispatcher.invoke("AlwaysDown", "").await.unwrap_err();
        assert!(err.message.contains("still down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
