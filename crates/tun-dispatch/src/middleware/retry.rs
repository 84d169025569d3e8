use crate::context::CommandContext;
use crate::error::DispatchError;
use crate::middleware::{Middleware, MiddlewareResult, Next};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Exponential backoff: the delay before attempt k (zero-based) is
/// `min(initial · 2^k, max)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        scaled.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

type RetryPredicate = Box<dyn Fn(&DispatchError) -> bool + Send + Sync>;

/// Re-invokes the continuation on retryable errors.
///
/// Only `Err` results are retried; a delivered `success=false` envelope is
/// a handler decision, not a transport fault.
pub struct RetryMiddleware {
    policy: RetryPolicy,
    retryable: RetryPredicate,
}

impl RetryMiddleware {
    pub fn new(policy: RetryPolicy) -> Self {
        RetryMiddleware {
            policy,
            retryable: Box::new(DispatchError::is_retryable),
        }
    }

    pub fn with_predicate(
        policy: RetryPolicy,
        retryable: impl Fn(&DispatchError) -> bool + Send + Sync + 'static,
    ) -> Self {
        RetryMiddleware {
            policy,
            retryable: Box::new(retryable),
        }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    async fn handle(&self, ctx: &mut CommandContext, next: Next<'_>) -> MiddlewareResult {
        let mut attempt = 0;
        loop {
            match next.run(ctx).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    if attempt >= self.policy.max_retries || !(self.retryable)(&error) {
                        return Err(error);
                    }
                    let delay = self.policy.delay_for_attempt(attempt);
                    debug!(
                        command_type = %ctx.command_type,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying command"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
