use crate::context::CommandContext;
use crate::error::DispatchError;
use crate::middleware::{Middleware, MiddlewareResult, Next};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Bounds one pipeline traversal to a fixed deadline.
///
/// The in-flight future is dropped at the deadline; handlers holding
/// resources across suspension points must watch the context's cancellation
/// token, which fires alongside the drop.
pub struct TimeoutMiddleware {
    deadline: Duration,
}

impl TimeoutMiddleware {
    pub fn new(deadline: Duration) -> Self {
        TimeoutMiddleware { deadline }
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &str {
        "timeout"
    }

    async fn handle(&self, ctx: &mut CommandContext, next: Next<'_>) -> MiddlewareResult {
        let command_type = ctx.command_type;
        let cancel = ctx.cancel.clone();
        match tokio::time::timeout(self.deadline, next.run(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    command_type = %command_type,
                    deadline_ms = self.deadline.as_millis() as u64,
                    "per-call deadline elapsed"
                );
                cancel.cancel();
                Err(DispatchError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{CommandDirection, CommandHandler};
    use crate::middleware::run_pipeline;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use tun_protocol::{CommandPacket, CommandResponse, CommandType};

    struct SlowHandler {
        sleep: Duration,
    }

    #[async_trait]
    impl CommandHandler for SlowHandler {
        fn command_type(&self) -> CommandType {
            CommandType::Management
        }
        fn direction(&self) -> CommandDirection {
            CommandDirection::Duplex
        }
        fn name(&self) -> &str {
            "slow"
        }
        async fn handle(
            &self,
            _ctx: &mut CommandContext,
        ) -> Result<CommandResponse, DispatchError> {
            tokio::time::sleep(self.sleep).await;
            Ok(CommandResponse::ok(None))
        }
    }

    fn test_ctx() -> CommandContext {
        let packet = CommandPacket {
            command_type: CommandType::Management,
            ..CommandPacket::default()
        };
        CommandContext::from_packet("conn-1", &packet, CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn fast_calls_pass_through() {
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(TimeoutMiddleware::new(Duration::from_secs(1)))];
        let handler = SlowHandler {
            sleep: Duration::from_millis(10),
        };
        let mut ctx = test_ctx();
        let response = run_pipeline(&chain, &handler, &mut ctx).await.unwrap();
        assert!(response.success);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapsing_yields_timeout_and_cancels() {
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(TimeoutMiddleware::new(Duration::from_millis(50)))];
        let handler = SlowHandler {
            sleep: Duration::from_secs(10),
        };
        let mut ctx = test_ctx();
        let cancel = ctx.cancel.clone();

        let result = run_pipeline(&chain, &handler, &mut ctx).await;
        assert!(matches!(result, Err(DispatchError::Timeout)));
        assert!(cancel.is_cancelled());
    }
}
