//! Middleware pipeline.
//!
//! A middleware wraps handler invocation: it may mutate the context before
//! calling the continuation, call it zero or one times (or again, for
//! retries), inspect and mutate the response, or transform errors.  The
//! first middleware registered is the outermost frame: for a chain
//! [M1, M2, M3] the entry order is M1, M2, M3, handler and the exit order is
//! the reverse.
//!
//! The executor snapshots the chain at call entry, so registrations during
//! execution apply only to subsequent calls and concurrent calls each see an
//! independent traversal.

use crate::context::CommandContext;
use crate::error::DispatchError;
use crate::handler::CommandHandler;
use async_trait::async_trait;
use std::sync::Arc;
use tun_protocol::CommandResponse;

pub mod command_id;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod timeout;

pub use command_id::{CommandIdMiddleware, ReplayCache};
pub use logging::LoggingMiddleware;
pub use metrics::{CommandMetrics, MetricsMiddleware};
pub use retry::{RetryMiddleware, RetryPolicy};
pub use timeout::TimeoutMiddleware;

pub type MiddlewareResult = Result<CommandResponse, DispatchError>;

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str {
        "middleware"
    }

    async fn handle(&self, ctx: &mut CommandContext, next: Next<'_>) -> MiddlewareResult;
}

/// The continuation handed to each middleware: the remaining chain plus the
/// terminal handler.  Re-runnable so the retry middleware can invoke it more
/// than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    handler: &'a dyn CommandHandler,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>], handler: &'a dyn CommandHandler) -> Self {
        Next { chain, handler }
    }

    pub async fn run(&self, ctx: &mut CommandContext) -> MiddlewareResult {
        match self.chain.split_first() {
            Some((middleware, rest)) => {
                let next = Next {
                    chain: rest,
                    handler: self.handler,
                };
                middleware.handle(ctx, next).await
            }
            None => self.handler.handle(ctx).await,
        }
    }
}

/// Runs `ctx` through the full chain around `handler`.
pub async fn run_pipeline(
    chain: &[Arc<dyn Middleware>],
    handler: &dyn CommandHandler,
    ctx: &mut CommandContext,
) -> MiddlewareResult {
    Next::new(chain, handler).run(ctx).await
}
