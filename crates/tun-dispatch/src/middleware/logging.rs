use crate::context::CommandContext;
use crate::middleware::{Middleware, MiddlewareResult, Next};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Records command start, completion, duration and the success flag.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, ctx: &mut CommandContext, next: Next<'_>) -> MiddlewareResult {
        debug!(
            command_type = %ctx.command_type,
            command_id = %ctx.command_id,
            connection_id = %ctx.connection_id,
            "command started"
        );
        let started = Instant::now();
        let result = next.run(ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => info!(
                command_type = %ctx.command_type,
                command_id = %ctx.command_id,
                duration_ms,
                success = response.success,
                "command completed"
            ),
            Err(error) => warn!(
                command_type = %ctx.command_type,
                command_id = %ctx.command_id,
                duration_ms,
                error = %error,
                "command failed"
            ),
        }
        result
    }
}
