//! Lifecycle event fanout.
//!
//! Commands dispatch directly from the session into the executor; the bus
//! carries observability and lifecycle events only.  `DisconnectRequest`
//! exists because the session, not a handler, must close the socket.

use std::time::Duration;
use tokio::sync::broadcast;
use tun_protocol::CommandType;

const DEFAULT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ServiceEvent {
    ConnectionOpened {
        connection_id: String,
    },
    ConnectionClosed {
        connection_id: String,
    },
    CommandCompleted {
        connection_id: String,
        command_type: CommandType,
        command_id: String,
        success: bool,
        error: Option<String>,
        processing_time: Duration,
    },
    /// The peer asked to disconnect; the session layer closes the socket.
    DisconnectRequest {
        connection_id: String,
    },
}

/// Broadcast wrapper; slow subscribers lag rather than block publishers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServiceEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Publishes to all current subscribers; a bus with no subscribers
    /// drops the event.
    pub fn publish(&self, event: ServiceEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_events_reach_every_subscriber() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(ServiceEvent::ConnectionOpened {
            connection_id: "conn-1".to_owned(),
        });

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                ServiceEvent::ConnectionOpened { connection_id } => {
                    assert_eq!(connection_id, "conn-1");
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_a_no_op() {
        let bus = EventBus::default();
        bus.publish(ServiceEvent::ConnectionClosed {
            connection_id: "conn-1".to_owned(),
        });
    }
}
