//! Command executor: classifies incoming commands as oneway or duplex, runs
//! the middleware pipeline around the registered handler and routes the
//! response.
//!
//! Oneway commands run detached; the caller gets success immediately and
//! handler errors are logged, never surfaced to the peer.  Duplex commands
//! register a pending request with the correlator, run the pipeline on a
//! spawned task, write the response packet back through the injected
//! [`ResponseSink`] and deliver it to the awaiting caller: exactly one of
//! {delivered, dropped after timeout} per request.

use crate::context::CommandContext;
use crate::correlator::RpcCorrelator;
use crate::error::DispatchError;
use crate::handler::{CommandDirection, CommandHandler};
use crate::ids;
use crate::middleware::{Middleware, run_pipeline};
use crate::registry::CommandRegistry;
use crate::session::ResponseSink;
use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use tun_protocol::CommandResponse;

/// Default deadline for detached oneway executions.
pub const ONEWAY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CommandExecutor {
    registry: Arc<CommandRegistry>,
    correlator: Arc<RpcCorrelator>,
    middlewares: Mutex<Vec<Arc<dyn Middleware>>>,
    sink: Arc<dyn ResponseSink>,
    oneway_timeout: Mutex<Duration>,
}

impl CommandExecutor {
    pub fn new(
        registry: Arc<CommandRegistry>,
        correlator: Arc<RpcCorrelator>,
        sink: Arc<dyn ResponseSink>,
    ) -> Self {
        CommandExecutor {
            registry,
            correlator,
            middlewares: Mutex::new(Vec::new()),
            sink,
            oneway_timeout: Mutex::new(ONEWAY_TIMEOUT),
        }
    }

    pub fn set_oneway_timeout(&self, timeout: Duration) {
        *self
            .oneway_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = timeout;
    }

    pub fn oneway_timeout(&self) -> Duration {
        *self
            .oneway_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn correlator(&self) -> &Arc<RpcCorrelator> {
        &self.correlator
    }

    /// Appends a middleware.  In-flight executions keep the snapshot they
    /// started with.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middlewares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(middleware);
    }

    pub fn middleware_count(&self) -> usize {
        self.middlewares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn snapshot_chain(&self) -> Vec<Arc<dyn Middleware>> {
        self.middlewares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Dispatches one command context to its registered handler.
    ///
    /// Oneway: returns `Ok(())` as soon as the execution is spawned.
    /// Duplex: blocks until the response is delivered or the correlator
    /// timeout elapses.  A delivered `success=false` envelope surfaces as
    /// [`DispatchError::CommandExecutionFailed`].
    pub async fn execute(&self, ctx: CommandContext) -> Result<(), DispatchError> {
        let handler = self
            .registry
            .get(ctx.command_type)
            .ok_or(DispatchError::HandlerNotRegistered(ctx.command_type))?;

        match handler.direction() {
            CommandDirection::Oneway => {
                self.execute_oneway(ctx, handler);
                Ok(())
            }
            CommandDirection::Duplex => self.execute_duplex(ctx, handler).await,
        }
    }

    fn execute_oneway(&self, mut ctx: CommandContext, handler: Arc<dyn CommandHandler>) {
        let chain = self.snapshot_chain();
        let deadline = self.oneway_timeout();
        let cancel = ctx.cancel.child_token();
        ctx.cancel = cancel.clone();

        tokio::spawn(async move {
            let outcome =
                tokio::time::timeout(deadline, run_pipeline(&chain, handler.as_ref(), &mut ctx))
                    .await;
            ctx.end_time = Some(Utc::now());
            match outcome {
                Ok(Ok(_)) => debug!(
                    command_type = %ctx.command_type,
                    command_id = %ctx.command_id,
                    "oneway command completed"
                ),
                Ok(Err(error)) => warn!(
                    command_type = %ctx.command_type,
                    command_id = %ctx.command_id,
                    error = %error,
                    "oneway command failed"
                ),
                Err(_) => warn!(
                    command_type = %ctx.command_type,
                    command_id = %ctx.command_id,
                    "oneway command timed out"
                ),
            }
            cancel.cancel();
        });
    }

    async fn execute_duplex(
        &self,
        mut ctx: CommandContext,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), DispatchError> {
        // The peer's token is the correlation key; locally-originated
        // contexts without one get a fresh id.
        if ctx.request_id.is_empty() {
            ctx.request_id = ids::request_id();
        }
        let request_id = ctx.request_id.clone();

        let rx = self.correlator.register(&request_id);
        let deadline = self.correlator.timeout();

        let chain = self.snapshot_chain();
        let correlator = Arc::clone(&self.correlator);
        let sink = Arc::clone(&self.sink);
        let cancel = ctx.cancel.child_token();
        ctx.cancel = cancel.clone();

        {
            let request_id = request_id.clone();
            tokio::spawn(async move {
                let connection_id = ctx.connection_id.clone();
                let command_id = ctx.command_id.clone();
                let handler_name = handler.name().to_owned();

                let started = Instant::now();
                let outcome = tokio::time::timeout(
                    deadline,
                    run_pipeline(&chain, handler.as_ref(), &mut ctx),
                )
                .await;
                ctx.end_time = Some(Utc::now());

                let mut response = match outcome {
                    Ok(Ok(response)) => response,
                    Ok(Err(error)) => CommandResponse::err(error.to_string()),
                    Err(_) => CommandResponse::err("handler timed out"),
                };
                response.request_id = request_id.clone();
                response.command_id = command_id;
                response.processing_time = started.elapsed().as_nanos() as i64;
                if response.handler_name.is_empty() {
                    response.handler_name = handler_name;
                }

                if let Err(error) = sink.send_response(&connection_id, &response).await {
                    // The local caller still observes the reply through the
                    // correlator.
                    warn!(
                        connection_id = %connection_id,
                        request_id = %request_id,
                        error = %error,
                        "response delivery to peer failed"
                    );
                }
                correlator.deliver(&request_id, response);
                cancel.cancel();
            });
        }

        let outcome = tokio::time::timeout(deadline, rx).await;
        // Deferred cleanup: idempotent against the delivery having already
        // removed the entry.
        self.correlator.unregister(&request_id);

        match outcome {
            Err(_) => Err(DispatchError::Timeout),
            // Sender dropped without delivering; only reachable if the
            // execution task died, so treat it like a timeout.
            Ok(Err(_)) => Err(DispatchError::Timeout),
            Ok(Ok(response)) => {
                if response.success {
                    Ok(())
                } else {
                    Err(DispatchError::CommandExecutionFailed(response.error))
                }
            }
        }
    }
}
