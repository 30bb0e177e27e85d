//! WebSocket session gateway.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (document_id) ── ordered fan-out channel
//! Client B ──┘          │
//!                       ├── presence-sync on every membership change
//!                       │
//!                ┌──────┴────────┐
//!                ▼               ▼
//!        SnapshotCoalescer   IdentityResolver
//!            (debounced)      (announce)
//!                │
//!                ▼
//!          SnapshotStore
//! ```
//!
//! One tokio task per connection. Each task owns its socket and runs a
//! `select!` loop over inbound frames, its room's fan-out receiver, and the
//! server shutdown signal. Malformed or misaddressed frames are dropped and
//! logged; they never tear down the connection or touch another room —
//! fault isolation ends at the room/document key.
//!
//! The server has an explicit lifecycle: [`CollabServer::start`] (or
//! [`run`](CollabServer::run)) and [`CollabServer::shutdown`], which stops
//! accepting, flushes pending snapshots, releases all timers, and closes
//! every room.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::coalescer::{SnapshotCoalescer, DEFAULT_DEBOUNCE};
use crate::identity::{AnonymousResolver, IdentityResolver};
use crate::presence::Participant;
use crate::protocol::{Envelope, EventKind};
use crate::room::{RelayError, Room, RoomRegistry};
use crate::storage::{MemoryStore, RocksStore, SnapshotStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Fan-out channel capacity per room
    pub broadcast_capacity: usize,
    /// Quiet period before a dirty document is persisted
    pub debounce: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9470".to_string(),
            broadcast_capacity: 256,
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    /// Inbound frames dropped (malformed, wrong room, sender mismatch)
    pub dropped_events: u64,
    pub snapshot_writes: u64,
    pub snapshot_failures: u64,
}

/// Why an inbound frame was dropped instead of dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    /// Frame bytes did not decode to an envelope, or a typed payload
    /// did not parse
    Malformed,
    /// Missing/nil document id, or an event for a room the connection is
    /// not a member of
    InvalidRoom,
    /// Frame's sender does not match the id bound to this connection
    SenderMismatch,
}

/// The collaboration server.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    coalescer: SnapshotCoalescer,
    store: Arc<dyn SnapshotStore>,
    resolver: Arc<dyn IdentityResolver>,
    stats: Arc<RwLock<ServerStats>>,
    shutdown: watch::Sender<bool>,
}

impl CollabServer {
    /// Create a server over the given store and identity resolver.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn SnapshotStore>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.broadcast_capacity));
        let coalescer = SnapshotCoalescer::new(store.clone(), config.debounce);
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            registry,
            coalescer,
            store,
            resolver,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            shutdown,
        }
    }

    /// In-memory store, anonymous identities, default config.
    pub fn with_defaults() -> Self {
        Self::new(
            ServerConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(AnonymousResolver),
        )
    }

    /// Durable RocksDB-backed store at the given path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<std::path::PathBuf>,
    ) -> Result<Self, StoreError> {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            ..ServerConfig::default()
        };
        let store = RocksStore::open(StoreConfig {
            path: path.into(),
            ..StoreConfig::default()
        })?;
        Ok(Self::new(config, Arc::new(store), Arc::new(AnonymousResolver)))
    }

    /// Bind and serve in a background task; returns the bound address.
    pub async fn start(&self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        log::info!("collab server listening on {addr}");

        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                log::error!("collab server accept loop failed: {e}");
            }
        });

        Ok(addr)
    }

    /// Bind and serve on the current task until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Stop the server: close the listener, disconnect every connection,
    /// flush and release all pending snapshot state, close all rooms.
    ///
    /// The flush happens before timers are released, so an orderly stop
    /// confirms every buffered edit ("Saved" rather than "Saving…").
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.coalescer.flush_all().await;
        self.coalescer.shutdown().await;
        self.registry.clear().await;
        log::info!("collab server shut down");
    }

    /// Current statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats.snapshot_writes = self.coalescer.writes_completed();
        stats.snapshot_failures = self.coalescer.writes_failed();
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn coalescer(&self) -> &SnapshotCoalescer {
        &self.coalescer
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("new TCP connection from {addr}");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            log::error!("connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown_rx.changed() => {
                    log::info!("collab server stopping accept loop");
                    return Ok(());
                }
            }
        }
    }

    /// Handle one WebSocket connection for its whole life.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut shutdown_rx = self.shutdown.subscribe();

        log::info!("websocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Connection state: the id bound at the first join, plus the
        // current room's fan-out receiver.
        let mut bound: Option<Uuid> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        // The loop's result is settled before cleanup so a failed send can
        // never leave a stale membership behind.
        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                {
                                    let mut s = self.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }
                                match Envelope::decode(&bytes) {
                                    Ok(env) => {
                                        self.dispatch(env, addr, &mut bound, &mut broadcast_rx, &mut ws_sender)
                                            .await?;
                                    }
                                    Err(e) => {
                                        self.drop_event(DropReason::Malformed, addr).await;
                                        log::warn!("undecodable frame from {addr}: {e}");
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Err(e)) => {
                                log::warn!("websocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    frame = recv_broadcast(&mut broadcast_rx) => {
                        match frame {
                            Ok(data) => {
                                // Never echo a frame back to its sender.
                                if let Ok(env) = Envelope::decode(&data) {
                                    if Some(env.sender) == bound {
                                        continue;
                                    }
                                }
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("connection {bound:?} lagged by {n} frames");
                            }
                            Err(_) => break,
                        }
                    }

                    _ = shutdown_rx.changed() => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            Ok(())
        }
        .await;

        // Cleanup. Leaving is idempotent; the pending persistence timer is
        // keyed by document, not connection, and is left untouched.
        if let Some(connection_id) = bound {
            if let Some(left) = self.registry.leave(&connection_id).await {
                if !left.now_empty {
                    self.sync_presence(&left.room).await;
                }
            }
        }

        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        drop(s);

        result
    }

    /// Dispatch one decoded inbound frame.
    async fn dispatch<W>(
        &self,
        env: Envelope,
        addr: SocketAddr,
        bound: &mut Option<Uuid>,
        broadcast_rx: &mut Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>>,
        ws_sender: &mut W,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        W: futures_util::Sink<Message> + Unpin,
        W::Error: std::error::Error + Send + Sync + 'static,
    {
        // A connection speaks with exactly one sender id, bound at its
        // first join.
        if let Some(id) = *bound {
            if env.sender != id {
                self.drop_event(DropReason::SenderMismatch, addr).await;
                return Ok(());
            }
        }

        match env.kind {
            EventKind::Join => {
                if env.document_id.is_nil() || env.sender.is_nil() {
                    self.drop_event(DropReason::InvalidRoom, addr).await;
                    return Ok(());
                }
                let connection_id = env.sender;
                *bound = Some(connection_id);

                let mut participant = Participant::anonymous(connection_id);
                if let Some(profile) = self.resolver.resolve(&connection_id) {
                    participant.user_id = Some(profile.user_id);
                    participant.display_name = profile.display_name;
                    participant.avatar_ref = profile.avatar_ref;
                }

                let Some(joined) = self.registry.join(participant, env.document_id).await else {
                    // DuplicateJoin: silently ignored.
                    return Ok(());
                };
                *broadcast_rx = Some(joined.receiver);

                // Prime the joiner with the last persisted content, the way
                // an editor loads a document on open. NotFound is a fresh
                // document, not an error.
                match self.store.read_snapshot(env.document_id) {
                    Ok(content) => {
                        let prime = Envelope::delta(Uuid::nil(), env.document_id, content);
                        ws_sender.send(Message::Binary(prime.encode()?.into())).await?;
                    }
                    Err(StoreError::NotFound(_)) => {}
                    Err(e) => {
                        log::warn!("snapshot read failed for {}: {e}", env.document_id);
                    }
                }

                // The room the connection was moved out of (if any) gets a
                // roster without it; the new room gets one with it.
                if let Some(old) = &joined.left {
                    self.sync_presence(&old.room).await;
                }
                self.sync_presence(&joined.room).await;

                log::info!(
                    "connection {connection_id} joined document {}",
                    env.document_id
                );
            }

            EventKind::Announce => {
                let Some(connection_id) = *bound else {
                    self.drop_event(DropReason::InvalidRoom, addr).await;
                    return Ok(());
                };
                let Ok(claimed) = env.announce_info() else {
                    self.drop_event(DropReason::Malformed, addr).await;
                    return Ok(());
                };
                let Some(room) = self.registry.room_of(&connection_id).await else {
                    self.drop_event(DropReason::InvalidRoom, addr).await;
                    return Ok(());
                };

                // The resolver augments/overrides a claimed identity it
                // knows; an unresolvable connection keeps what it claimed.
                let resolved = self.resolver.resolve(&connection_id);
                room.update_participant(&connection_id, |p| {
                    p.apply_announce(&claimed);
                    if let Some(profile) = resolved {
                        p.user_id = Some(profile.user_id);
                        p.display_name = profile.display_name;
                        p.avatar_ref = profile.avatar_ref;
                    }
                })
                .await;

                self.sync_presence(&room).await;
            }

            EventKind::Delta => {
                let Some(connection_id) = *bound else {
                    self.drop_event(DropReason::InvalidRoom, addr).await;
                    return Ok(());
                };
                match self
                    .registry
                    .relay_delta(connection_id, env.document_id, env.payload.clone())
                    .await
                {
                    Ok(_) => {
                        // The relayed blob is also the latest observed
                        // content for the debounced snapshot.
                        self.coalescer.observe_edit(env.document_id, env.payload).await;
                    }
                    Err(RelayError::NotInRoom) => {
                        self.drop_event(DropReason::InvalidRoom, addr).await;
                    }
                    Err(RelayError::Protocol(e)) => {
                        log::warn!("delta relay failed for {addr}: {e}");
                    }
                }
            }

            EventKind::Cursor => {
                let Some(connection_id) = *bound else {
                    self.drop_event(DropReason::InvalidRoom, addr).await;
                    return Ok(());
                };
                let Ok(frame) = env.cursor_frame() else {
                    self.drop_event(DropReason::Malformed, addr).await;
                    return Ok(());
                };
                match self
                    .registry
                    .relay_cursor(connection_id, env.document_id, &frame)
                    .await
                {
                    Ok(_) => {}
                    Err(RelayError::NotInRoom) => {
                        self.drop_event(DropReason::InvalidRoom, addr).await;
                    }
                    Err(RelayError::Protocol(e)) => {
                        log::warn!("cursor relay failed for {addr}: {e}");
                    }
                }
            }

            EventKind::PresenceSync => {
                // Server-originated only; a client sending one is dropped.
                self.drop_event(DropReason::Malformed, addr).await;
            }
        }

        Ok(())
    }

    /// Recompute a room's roster and broadcast it to every member.
    async fn sync_presence(&self, room: &Arc<Room>) {
        let roster = room.roster().await;
        match Envelope::presence_sync(room.document_id(), &roster) {
            Ok(env) => {
                let _ = room.broadcast(&env);
            }
            Err(e) => {
                log::error!(
                    "failed to encode presence sync for room {}: {e}",
                    room.document_id()
                );
            }
        }
    }

    async fn drop_event(&self, reason: DropReason, addr: SocketAddr) {
        let mut s = self.stats.write().await;
        s.dropped_events += 1;
        drop(s);
        log::debug!("dropped event from {addr}: {reason:?}");
    }
}

/// Await the room receiver if there is one; otherwise park forever so the
/// `select!` only sees socket traffic.
async fn recv_broadcast(
    rx: &mut Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>>,
) -> Result<Arc<Vec<u8>>, tokio::sync::broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
