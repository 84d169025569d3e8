//! Per-command-type counters and a duration histogram.
//!
//! Counters follow the conventional names `command_started_total`,
//! `command_completed_total` and `command_failed_total`, each labelled by
//! command type.  `snapshot()` returns a by-value copy for a stats endpoint
//! or test assertions.

use crate::context::CommandContext;
use crate::middleware::{Middleware, MiddlewareResult, Next};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;
use tun_protocol::CommandType;

/// Upper bounds (milliseconds) of the duration histogram buckets; the last
/// bucket is unbounded.
pub const DURATION_BUCKET_BOUNDS_MS: [u64; 8] = [1, 5, 10, 50, 100, 500, 1_000, 5_000];

#[derive(Debug, Clone, Default, Serialize)]
pub struct TypeMetrics {
    #[serde(rename = "command_started_total")]
    pub started_total: u64,
    #[serde(rename = "command_completed_total")]
    pub completed_total: u64,
    #[serde(rename = "command_failed_total")]
    pub failed_total: u64,
    /// One count per bound in [`DURATION_BUCKET_BOUNDS_MS`], plus the
    /// overflow bucket.
    pub duration_buckets: [u64; DURATION_BUCKET_BOUNDS_MS.len() + 1],
}

#[derive(Default)]
pub struct CommandMetrics {
    inner: Mutex<HashMap<CommandType, TypeMetrics>>,
}

impl CommandMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry(&self, command_type: CommandType, update: impl FnOnce(&mut TypeMetrics)) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        update(inner.entry(command_type).or_default());
    }

    pub fn record_started(&self, command_type: CommandType) {
        self.with_entry(command_type, |m| m.started_total += 1);
    }

    pub fn record_finished(&self, command_type: CommandType, success: bool, duration_ms: u64) {
        self.with_entry(command_type, |m| {
            if success {
                m.completed_total += 1;
            } else {
                m.failed_total += 1;
            }
            let bucket = DURATION_BUCKET_BOUNDS_MS
                .iter()
                .position(|bound| duration_ms <= *bound)
                .unwrap_or(DURATION_BUCKET_BOUNDS_MS.len());
            m.duration_buckets[bucket] += 1;
        });
    }

    /// A by-value copy of every per-type series.
    pub fn snapshot(&self) -> HashMap<CommandType, TypeMetrics> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct MetricsMiddleware {
    metrics: Arc<CommandMetrics>,
}

impl MetricsMiddleware {
    pub fn new(metrics: Arc<CommandMetrics>) -> Self {
        MetricsMiddleware { metrics }
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn handle(&self, ctx: &mut CommandContext, next: Next<'_>) -> MiddlewareResult {
        let command_type = ctx.command_type;
        self.metrics.record_started(command_type);

        let started = Instant::now();
        let result = next.run(ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let success = matches!(&result, Ok(response) if response.success);
        self.metrics.record_finished(command_type, success, duration_ms);
        result
    }
}
