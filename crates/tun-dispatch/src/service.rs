//! Service façade: registry + executor + middleware + stats + event bridge.

use crate::context::CommandContext;
use crate::correlator::RpcCorrelator;
use crate::error::DispatchError;
use crate::events::{EventBus, ServiceEvent};
use crate::executor::CommandExecutor;
use crate::handler::CommandHandler;
use crate::middleware::Middleware;
use crate::registry::CommandRegistry;
use crate::session::ResponseSink;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;
use tun_protocol::CommandType;

/// By-value counters snapshot returned by [`CommandService::get_stats`].
#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
    pub total_commands: u64,
    pub successful_commands: u64,
    pub failed_commands: u64,
    pub active_commands: u64,
    /// Cumulative moving average over completed commands.
    pub average_latency_ms: f64,
    pub last_command_time: Option<DateTime<Utc>>,
}

pub struct CommandService {
    registry: Arc<CommandRegistry>,
    correlator: Arc<RpcCorrelator>,
    executor: Arc<CommandExecutor>,
    stats: Mutex<ServiceStats>,
    closed: AtomicBool,
    bus: Mutex<Option<EventBus>>,
}

impl CommandService {
    pub fn new(sink: Arc<dyn ResponseSink>) -> Self {
        let registry = Arc::new(CommandRegistry::new());
        let correlator = Arc::new(RpcCorrelator::new());
        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&correlator),
            sink,
        ));
        CommandService {
            registry,
            correlator,
            executor,
            stats: Mutex::new(ServiceStats::default()),
            closed: AtomicBool::new(false),
            bus: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn correlator(&self) -> &Arc<RpcCorrelator> {
        &self.correlator
    }

    pub fn register_handler(&self, handler: Arc<dyn CommandHandler>) -> Result<(), DispatchError> {
        self.registry.register(handler)
    }

    pub fn unregister_handler(&self, command_type: CommandType) -> Result<(), DispatchError> {
        self.registry.unregister(command_type)
    }

    /// Appends a middleware.  The executor owns the single chain, so the
    /// façade's view and the executor's can never drift apart.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.executor.use_middleware(middleware);
    }

    /// Deadline for detached oneway executions.
    pub fn set_oneway_timeout(&self, timeout: Duration) {
        self.executor.set_oneway_timeout(timeout);
    }

    pub fn middleware_count(&self) -> usize {
        self.executor.middleware_count()
    }

    /// Attaches the lifecycle event bus.  Commands still dispatch directly;
    /// the bus only carries completion and disconnect events.
    pub fn set_event_bus(&self, bus: EventBus) {
        *self.bus.lock().unwrap_or_else(PoisonError::into_inner) = Some(bus);
    }

    /// Dispatches one command, updating stats and publishing lifecycle
    /// events.  Refused once the service is closed.
    pub async fn execute(&self, ctx: CommandContext) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::ServiceClosed);
        }

        let connection_id = ctx.connection_id.clone();
        let command_type = ctx.command_type;
        let command_id = ctx.command_id.clone();

        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.total_commands += 1;
            stats.active_commands += 1;
        }

        let started = Instant::now();
        let result = self.executor.execute(ctx).await;
        let elapsed = started.elapsed();

        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.active_commands = stats.active_commands.saturating_sub(1);
            if result.is_ok() {
                stats.successful_commands += 1;
            } else {
                stats.failed_commands += 1;
            }
            let completed = stats.successful_commands + stats.failed_commands;
            let sample_ms = elapsed.as_secs_f64() * 1_000.0;
            stats.average_latency_ms +=
                (sample_ms - stats.average_latency_ms) / completed as f64;
            stats.last_command_time = Some(Utc::now());
        }

        let bus = self
            .bus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(bus) = bus {
            bus.publish(ServiceEvent::CommandCompleted {
                connection_id: connection_id.clone(),
                command_type,
                command_id,
                success: result.is_ok(),
                error: result.as_ref().err().map(ToString::to_string),
                processing_time: elapsed,
            });
            if command_type == CommandType::Disconnect {
                bus.publish(ServiceEvent::DisconnectRequest { connection_id });
            }
        }

        result
    }

    pub fn get_stats(&self) -> ServiceStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops accepting commands and fails pending waiters.  In-flight
    /// executions continue under their own cancellation.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.bus.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.correlator.clear();
        info!("command service closed");
    }
}
