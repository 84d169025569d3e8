//! RPC correlation for duplex exchanges.
//!
//! Every in-flight duplex request owns a pending entry keyed by request id.
//! Delivery takes the entry out of the map and fires its one-shot channel,
//! so a response reaches the awaiting caller at most once; anything arriving
//! after timeout or a second delivery finds no entry and is dropped.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use tun_protocol::CommandResponse;

/// Waiter deadline applied when the caller does not configure one.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

struct PendingRequest {
    tx: oneshot::Sender<CommandResponse>,
    registered_at: Instant,
}

pub struct RpcCorrelator {
    pending: Mutex<HashMap<String, PendingRequest>>,
    timeout: Mutex<Duration>,
}

impl Default for RpcCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcCorrelator {
    pub fn new() -> Self {
        RpcCorrelator {
            pending: Mutex::new(HashMap::new()),
            timeout: Mutex::new(DEFAULT_RPC_TIMEOUT),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let correlator = Self::new();
        correlator.set_timeout(timeout);
        correlator
    }

    /// Registers a pending request and hands back the receiving end.
    ///
    /// An existing entry under the same id is silently replaced; id
    /// uniqueness is the caller's contract (see the id generator).
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<CommandResponse> {
        let (tx, rx) = oneshot::channel();
        let stale = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                request_id.to_owned(),
                PendingRequest {
                    tx,
                    registered_at: Instant::now(),
                },
            );
        if stale.is_some() {
            debug!(request_id, "replaced a stale pending request entry");
        }
        rx
    }

    /// Removes a pending entry; safe to call after delivery or never.
    pub fn unregister(&self, request_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(request_id);
    }

    /// Hands a response to the awaiting caller.
    ///
    /// Returns false when no caller is waiting: the request timed out, was
    /// already answered, or the id was never registered.  The response is
    /// dropped in that case.
    pub fn deliver(&self, request_id: &str, response: CommandResponse) -> bool {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(request_id);
        match entry {
            Some(pending) => {
                let waited = pending.registered_at.elapsed();
                if pending.tx.send(response).is_err() {
                    // Receiver side gave up between timeout and unregister.
                    debug!(request_id, ?waited, "caller stopped waiting; response dropped");
                    return false;
                }
                true
            }
            None => {
                warn!(
                    request_id,
                    "no pending request for response (timed out or already delivered); dropped"
                );
                false
            }
        }
    }

    /// Whether a caller is still waiting on `request_id`.
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner) = timeout;
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops every pending entry; used on service shutdown so waiters fail
    /// fast instead of running out their timeouts.
    pub fn clear(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(request_id: &str) -> CommandResponse {
        let mut resp = CommandResponse::ok(Some("{}".to_owned()));
        resp.request_id = request_id.to_owned();
        resp
    }

    #[tokio::test]
    async fn delivered_response_reaches_the_waiter() {
        let correlator = RpcCorrelator::new();
        let rx = correlator.register("req_1");

        assert!(correlator.deliver("req_1", response("req_1")));
        let got = rx.await.unwrap();
        assert_eq!(got.request_id, "req_1");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn second_delivery_is_dropped() {
        let correlator = RpcCorrelator::new();
        let rx = correlator.register("req_1");

        assert!(correlator.deliver("req_1", response("req_1")));
        assert!(!correlator.deliver("req_1", response("req_1")));
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn delivery_without_registration_is_dropped() {
        let correlator = RpcCorrelator::new();
        assert!(!correlator.deliver("req_unknown", response("req_unknown")));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let correlator = RpcCorrelator::new();
        let _rx = correlator.register("req_1");
        assert!(correlator.is_pending("req_1"));
        correlator.unregister("req_1");
        correlator.unregister("req_1");
        assert!(!correlator.is_pending("req_1"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn register_replaces_a_stale_entry_silently() {
        let correlator = RpcCorrelator::new();
        let stale_rx = correlator.register("req_1");
        let fresh_rx = correlator.register("req_1");
        assert_eq!(correlator.pending_count(), 1);

        assert!(correlator.deliver("req_1", response("req_1")));
        assert!(fresh_rx.await.is_ok());
        // The stale receiver's sender was dropped on replacement.
        assert!(stale_rx.await.is_err());
    }

    #[tokio::test]
    async fn timeout_is_configurable() {
        let correlator = RpcCorrelator::new();
        assert_eq!(correlator.timeout(), DEFAULT_RPC_TIMEOUT);
        correlator.set_timeout(Duration::from_millis(50));
        assert_eq!(correlator.timeout(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn clear_drops_all_waiters() {
        let correlator = RpcCorrelator::new();
        let rx1 = correlator.register("req_1");
        let rx2 = correlator.register("req_2");
        correlator.clear();
        assert_eq!(correlator.pending_count(), 0);
        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());
    }
}
