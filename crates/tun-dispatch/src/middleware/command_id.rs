//! Command-id validation and replay protection.
//!
//! Command ids have the shape `cmd_<nanoseconds>_<connection-suffix>`.
//! Validation checks the prefix, a minimum length, at least three
//! underscore-separated segments and an integer second segment.  Ids seen
//! within the sliding replay window are rejected before the handler runs.
//!
//! The cache evicts expired entries amortised on insertion (every
//! [`SWEEP_EVERY_INSERTS`] inserts) and on a periodic background sweep, so
//! it stays bounded even between sweeps under heavy load.

use crate::context::CommandContext;
use crate::error::DispatchError;
use crate::middleware::{Middleware, MiddlewareResult, Next};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

const COMMAND_ID_PREFIX: &str = "cmd_";
const MIN_COMMAND_ID_LEN: usize = 8;
const SWEEP_EVERY_INSERTS: u64 = 64;

/// Structural validity of a command id, independent of the replay cache.
pub fn validate_command_id_format(command_id: &str) -> Result<(), DispatchError> {
    if command_id.is_empty() {
        return Err(DispatchError::CommandIdMalformed(
            "missing command id".to_owned(),
        ));
    }
    if !command_id.starts_with(COMMAND_ID_PREFIX) || command_id.len() < MIN_COMMAND_ID_LEN {
        return Err(DispatchError::CommandIdMalformed(command_id.to_owned()));
    }
    let segments: Vec<&str> = command_id.split('_').collect();
    if segments.len() < 3 || segments[1].parse::<i64>().is_err() {
        return Err(DispatchError::CommandIdMalformed(command_id.to_owned()));
    }
    Ok(())
}

struct CacheState {
    seen: HashMap<String, Instant>,
    inserts: u64,
}

/// Sliding-window memory of used command ids.
pub struct ReplayCache {
    window: Duration,
    state: Mutex<CacheState>,
}

impl ReplayCache {
    pub fn new(window: Duration) -> Self {
        ReplayCache {
            window,
            state: Mutex::new(CacheState {
                seen: HashMap::new(),
                inserts: 0,
            }),
        }
    }

    /// Records `command_id` as used.  Rejects ids already seen within the
    /// window; an entry older than the window is treated as fresh.
    pub fn check_and_insert(&self, command_id: &str) -> Result<(), DispatchError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if let Some(seen_at) = state.seen.get(command_id) {
            if now.duration_since(*seen_at) < self.window {
                return Err(DispatchError::ReplayRejected(command_id.to_owned()));
            }
        }
        state.seen.insert(command_id.to_owned(), now);
        state.inserts += 1;
        if state.inserts % SWEEP_EVERY_INSERTS == 0 {
            let window = self.window;
            state
                .seen
                .retain(|_, seen_at| now.duration_since(*seen_at) < window);
        }
        Ok(())
    }

    /// Drops every entry older than the window.
    pub fn sweep(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let window = self.window;
        let before = state.seen.len();
        state
            .seen
            .retain(|_, seen_at| now.duration_since(*seen_at) < window);
        let dropped = before - state.seen.len();
        if dropped > 0 {
            debug!(dropped, remaining = state.seen.len(), "replay cache swept");
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seen
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns the periodic sweeper.  The caller owns the handle and aborts
    /// it on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }
}

/// Rejects missing, malformed and replayed command ids before the handler.
pub struct CommandIdMiddleware {
    cache: Arc<ReplayCache>,
}

impl CommandIdMiddleware {
    pub fn new(cache: Arc<ReplayCache>) -> Self {
        CommandIdMiddleware { cache }
    }

    pub fn with_window(window: Duration) -> Self {
        CommandIdMiddleware {
            cache: Arc::new(ReplayCache::new(window)),
        }
    }

    pub fn cache(&self) -> &Arc<ReplayCache> {
        &self.cache
    }
}

#[async_trait]
impl Middleware for CommandIdMiddleware {
    fn name(&self) -> &str {
        "command-id"
    }

    async fn handle(&self, ctx: &mut CommandContext, next: Next<'_>) -> MiddlewareResult {
        validate_command_id_format(&ctx.command_id)?;
        self.cache.check_and_insert(&ctx.command_id)?;
        next.run(ctx).await
    }
}
