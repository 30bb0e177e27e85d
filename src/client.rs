//! WebSocket client for editor front ends.
//!
//! Owns one connection to the gateway, joins a document room, streams edits
//! and cursor moves out, and surfaces inbound traffic as typed
//! [`CollabEvent`]s. Pair it with a [`RosterView`](crate::presence::RosterView)
//! to track collaborators.
//!
//! On connection loss the client emits [`CollabEvent::Disconnected`] and
//! stops; it does not retry. A host that reconnects builds a fresh client,
//! rejoins, and is re-primed with the last persisted content.

use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{AnnounceInfo, CursorFrame, Envelope, EventKind, ProtocolError, RosterSync};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to the embedding editor.
#[derive(Debug, Clone)]
pub enum CollabEvent {
    /// Connection established
    Connected,
    /// Connection lost; rejoin with a fresh client
    Disconnected,
    /// Last persisted content, sent by the server on room entry.
    /// Replace local editor state with it.
    ContentPrimed { document_id: Uuid, content: Vec<u8> },
    /// A collaborator's content change. Apply on top of local state.
    RemoteDelta {
        document_id: Uuid,
        sender: Uuid,
        payload: Vec<u8>,
    },
    /// A collaborator's cursor/selection moved
    RemoteCursor {
        document_id: Uuid,
        frame: CursorFrame,
    },
    /// Fresh full roster for the room
    Roster {
        document_id: Uuid,
        roster: RosterSync,
    },
}

/// The collaboration client.
///
/// Mints its own connection id; the gateway binds that id to the socket at
/// the first join, and echo suppression on both ends keys off it.
pub struct CollabClient {
    connection_id: Uuid,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<CollabEvent>>,
    event_tx: mpsc::Sender<CollabEvent>,
    server_url: String,
}

impl CollabClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            connection_id: Uuid::new_v4(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// This connection's participant id.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Take the event receiver (can only be taken once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CollabEvent>> {
        self.event_rx.take()
    }

    /// Connect to the gateway and spawn the socket reader/writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(ok) => ok,
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: drain the outgoing channel into the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(CollabEvent::Connected).await;

        // Reader task: decode frames into events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let connection_id = self.connection_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let Ok(env) = Envelope::decode(&bytes) else {
                            log::warn!("undecodable frame from server");
                            continue;
                        };
                        // Drop our own relayed frames.
                        if env.sender == connection_id {
                            continue;
                        }
                        if let Some(event) = event_for(env) {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => {
                        break;
                    }
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(CollabEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Enter a document room. The next events are a `ContentPrimed` (when a
    /// snapshot exists) and a `Roster` listing the room including us.
    pub async fn join(&self, document_id: Uuid) -> Result<(), ProtocolError> {
        let env = Envelope::join(self.connection_id, document_id);
        self.send(env).await
    }

    /// Announce identity for the collaborator list. Send once after join.
    pub async fn announce(&self, info: &AnnounceInfo) -> Result<(), ProtocolError> {
        let env = Envelope::announce(self.connection_id, info)?;
        self.send(env).await
    }

    /// Send a content change to the room.
    ///
    /// The payload is relayed verbatim to collaborators and is also what the
    /// server buffers for the debounced snapshot — send your full serialized
    /// editor state if you want persistence to reflect it exactly.
    pub async fn send_delta(&self, document_id: Uuid, payload: Vec<u8>) -> Result<(), ProtocolError> {
        let env = Envelope::delta(self.connection_id, document_id, payload);
        self.send(env).await
    }

    /// Send our cursor/selection range to the room.
    pub async fn send_cursor(&self, document_id: Uuid, range: Vec<u8>) -> Result<(), ProtocolError> {
        let frame = CursorFrame {
            participant_id: self.connection_id,
            range,
        };
        self.send_cursor_frame(document_id, &frame).await
    }

    /// Send a cursor frame with an explicit participant id.
    pub async fn send_cursor_frame(
        &self,
        document_id: Uuid,
        frame: &CursorFrame,
    ) -> Result<(), ProtocolError> {
        let env = Envelope::cursor(self.connection_id, document_id, frame)?;
        self.send(env).await
    }

    /// Close the connection. The server treats this as an implicit leave
    /// and re-syncs the remaining room members.
    pub fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.try_send(Message::Close(None));
        }
    }

    /// Current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn send(&self, env: Envelope) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = env.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(Message::Binary(encoded.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

/// Map an inbound envelope to a client event. `None` for frame kinds the
/// client has no use for (and malformed typed payloads).
fn event_for(env: Envelope) -> Option<CollabEvent> {
    match env.kind {
        EventKind::Delta => {
            if env.sender.is_nil() {
                Some(CollabEvent::ContentPrimed {
                    document_id: env.document_id,
                    content: env.payload,
                })
            } else {
                Some(CollabEvent::RemoteDelta {
                    document_id: env.document_id,
                    sender: env.sender,
                    payload: env.payload,
                })
            }
        }
        EventKind::Cursor => {
            let frame = env.cursor_frame().ok()?;
            Some(CollabEvent::RemoteCursor {
                document_id: env.document_id,
                frame,
            })
        }
        EventKind::PresenceSync => {
            let roster = env.roster().ok()?;
            Some(CollabEvent::Roster {
                document_id: env.document_id,
                roster,
            })
        }
        EventKind::Join | EventKind::Announce => None,
    }
}
