//! Connection sessions.
//!
//! The relay owns the sockets: one read task per connection decodes frames
//! serially and is the connection's sole reader.  Heartbeats are answered in
//! place, command frames dispatch into the command service on their own
//! tasks, and response frames are handed to the correlator for whichever
//! local caller is awaiting them.
//!
//! # Lifecycle
//! 1. Accept; assign a connection id; register the write half.
//! 2. Publish `ConnectionOpened`.
//! 3. Read until: peer close, read error, idle timeout (three heartbeat
//!    intervals), shutdown signal, or a `DisconnectRequest` for this
//!    connection.
//! 4. Deregister, cancel in-flight executions, publish `ConnectionClosed`.

use crate::config::RelayConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tun_dispatch::middleware::{
    CommandIdMiddleware, CommandMetrics, LoggingMiddleware, MetricsMiddleware, ReplayCache,
};
use tun_dispatch::{
    CommandContext, CommandService, ConnectionRegistry, DispatchError, EventBus, PacketSink,
    ServiceEvent, SessionResponseSink,
};
use tun_protocol::{FramedReader, FramedWriter, TransferPacket};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// The outgoing half of one accepted connection.
pub struct Connection {
    id: String,
    writer: Mutex<FramedWriter<OwnedWriteHalf>>,
    compress_min_bytes: usize,
}

impl Connection {
    fn should_compress(&self, packet: &TransferPacket) -> bool {
        let body_len = match packet {
            TransferPacket::Heartbeat => return false,
            TransferPacket::Command(cmd) => cmd.command_body.len(),
            TransferPacket::Response(resp) => resp.data.as_deref().map_or(0, str::len),
        };
        body_len >= self.compress_min_bytes
    }
}

#[async_trait]
impl PacketSink for Connection {
    async fn send_packet(&self, packet: &TransferPacket) -> Result<(), DispatchError> {
        let compress = self.should_compress(packet);
        // The frame lock is held for one whole frame and released between
        // frames, so rate-limited writes never interleave frame bytes.
        let mut writer = self.writer.lock().await;
        writer
            .write_packet(packet, compress)
            .await
            .map_err(DispatchError::Network)
    }
}

/// Live connections by id.
#[derive(Default)]
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, connection: Arc<Connection>) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection.id.clone(), connection);
    }

    fn remove(&self, connection_id: &str) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection_id);
    }

    pub fn count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ConnectionRegistry for ConnectionManager {
    fn lookup(&self, connection_id: &str) -> Option<Arc<dyn PacketSink>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connection_id)
            .cloned()
            .map(|connection| connection as Arc<dyn PacketSink>)
    }
}

// ---------------------------------------------------------------------------
// Relay state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<RelayConfig>,
    pub service: Arc<CommandService>,
    pub connections: Arc<ConnectionManager>,
    pub metrics: Arc<CommandMetrics>,
    pub replay_cache: Arc<ReplayCache>,
    pub bus: EventBus,
}

/// Wires the dispatch core for one relay process: connection manager,
/// response sink, service, standard middleware chain and event bus.
pub fn build_state(config: RelayConfig) -> RelayState {
    let connections = Arc::new(ConnectionManager::new());
    let sink = Arc::new(SessionResponseSink::new(
        Arc::clone(&connections) as Arc<dyn ConnectionRegistry>
    ));
    let service = Arc::new(CommandService::new(sink));
    service.correlator().set_timeout(config.timeouts.rpc());
    service.set_oneway_timeout(config.timeouts.oneway());

    let bus = EventBus::default();
    service.set_event_bus(bus.clone());

    let metrics = Arc::new(CommandMetrics::new());
    let replay_cache = Arc::new(ReplayCache::new(config.replay.window()));
    service.use_middleware(Arc::new(LoggingMiddleware));
    service.use_middleware(Arc::new(MetricsMiddleware::new(Arc::clone(&metrics))));
    service.use_middleware(Arc::new(CommandIdMiddleware::new(Arc::clone(&replay_cache))));

    RelayState {
        config: Arc::new(config),
        service,
        connections,
        metrics,
        replay_cache,
        bus,
    }
}

// ---------------------------------------------------------------------------
// Accept / session loops
// ---------------------------------------------------------------------------

/// Accepts connections until the shutdown signal flips.
pub async fn serve(
    listener: TcpListener,
    state: RelayState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let sweeper = state
        .replay_cache
        .spawn_sweeper(state.config.replay.sweep_interval());

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let state = state.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            run_session(stream, peer, state, shutdown).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }

    sweeper.abort();
    state.service.close();
    info!("relay stopped accepting connections");
    Ok(())
}

async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    state: RelayState,
    mut shutdown: watch::Receiver<bool>,
) {
    let connection_id = Uuid::new_v4().to_string();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedReader::with_max_body(read_half, state.config.limits.max_frame_bytes);
    let writer = match state.config.limits.rate_bytes_per_sec {
        Some(rate) => FramedWriter::with_rate_limit(write_half, rate),
        None => FramedWriter::new(write_half),
    };
    let connection = Arc::new(Connection {
        id: connection_id.clone(),
        writer: Mutex::new(writer),
        compress_min_bytes: state.config.limits.compress_min_bytes,
    });
    state.connections.insert(Arc::clone(&connection));
    state.bus.publish(ServiceEvent::ConnectionOpened {
        connection_id: connection_id.clone(),
    });
    info!(connection_id = %connection_id, peer = %peer, "connection opened");

    // Parent for every execution on this connection; fired on teardown so
    // in-flight handlers abort their blocking work.
    let cancel = CancellationToken::new();
    let idle = state.config.timeouts.idle();

    // Disconnect requests arrive on the bus; watching them from a side task
    // keeps the main loop's read future the only branch that can resume, so
    // a wakeup never drops a half-read frame.
    let disconnect = CancellationToken::new();
    {
        let disconnect = disconnect.clone();
        let session_gone = cancel.clone();
        let mut events = state.bus.subscribe();
        let connection_id = connection_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session_gone.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(ServiceEvent::DisconnectRequest { connection_id: target })
                            if target == connection_id =>
                        {
                            disconnect.cancel();
                            return;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(connection_id = %connection_id, skipped, "event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });
    }

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
            _ = disconnect.cancelled() => {
                info!(connection_id = %connection_id, "disconnect requested");
                break;
            }
            next = tokio::time::timeout(idle, reader.read_packet()) => {
                match next {
                    Err(_) => {
                        warn!(connection_id = %connection_id, "idle timeout, closing");
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(connection_id = %connection_id, error = %e, "read failed");
                        break;
                    }
                    Ok(Ok(None)) => {
                        info!(connection_id = %connection_id, "peer closed");
                        break;
                    }
                    Ok(Ok(Some(TransferPacket::Heartbeat))) => {
                        if connection.send_packet(&TransferPacket::Heartbeat).await.is_err() {
                            break;
                        }
                    }
                    Ok(Ok(Some(TransferPacket::Command(packet)))) => {
                        let ctx = CommandContext::from_packet(
                            &connection_id,
                            &packet,
                            cancel.child_token(),
                        );
                        // Frames decode serially; handlers run concurrently.
                        let service = Arc::clone(&state.service);
                        tokio::spawn(async move {
                            if let Err(error) = service.execute(ctx).await {
                                debug!(error = %error, "command dispatch failed");
                            }
                        });
                    }
                    Ok(Ok(Some(TransferPacket::Response(response)))) => {
                        let request_id = response.request_id.clone();
                        state.service.correlator().deliver(&request_id, response);
                    }
                }
            }
        }
    }

    cancel.cancel();
    state.connections.remove(&connection_id);
    state.bus.publish(ServiceEvent::ConnectionClosed {
        connection_id: connection_id.clone(),
    });
    info!(connection_id = %connection_id, "connection closed");
}
