//! Room membership and room-scoped ordered fan-out.
//!
//! One [`Room`] per open document. Every room owns a single tokio broadcast
//! channel: sends on that channel are serialized, so if the room accepts
//! delta A strictly before delta B, every subscriber that receives both sees
//! A before B. No ordering is implied across rooms.
//!
//! The channel delivers to every subscriber, the sender's own connection
//! included; the receive side drops frames whose envelope `sender` matches
//! its own connection id, so a sender never sees its own delta or cursor
//! echoed back.
//!
//! [`RoomRegistry`] maps document ids to rooms and enforces the invariant
//! that a connection belongs to at most one room at a time. Mutations to a
//! room's member set go through that room's own lock; the registry lock
//! covers only map lookup and create/remove, so unrelated documents never
//! contend.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::presence::{build_roster, Participant};
use crate::protocol::{CursorFrame, Envelope, ParticipantInfo, ProtocolError, RosterSync};

/// Relay errors.
#[derive(Debug, Clone)]
pub enum RelayError {
    /// The connection is not a member of the target document's room
    NotInRoom,
    Protocol(ProtocolError),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInRoom => write!(f, "connection is not a member of the target room"),
            Self::Protocol(e) => write!(f, "relay protocol error: {e}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<ProtocolError> for RelayError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// A single document's room: member records plus the fan-out channel.
pub struct Room {
    document_id: Uuid,
    /// Fan-out channel; send order is the room's delta order.
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Live members, keyed by connection id.
    participants: RwLock<HashMap<Uuid, Participant>>,
    capacity: usize,
}

impl Room {
    /// Create a room with the given per-subscriber buffer capacity.
    ///
    /// `capacity` bounds how many frames a lagging subscriber can buffer
    /// before it starts missing messages.
    pub fn new(document_id: Uuid, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            document_id,
            sender,
            participants: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a member and return its fan-out receiver.
    pub async fn add(&self, participant: Participant) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut participants = self.participants.write().await;
        participants.insert(participant.connection_id, participant);
        self.sender.subscribe()
    }

    /// Remove a member. Safe to call for a connection that never joined.
    pub async fn remove(&self, connection_id: &Uuid) -> Option<Participant> {
        self.participants.write().await.remove(connection_id)
    }

    /// Whether the connection is a current member.
    pub async fn is_member(&self, connection_id: &Uuid) -> bool {
        self.participants.read().await.contains_key(connection_id)
    }

    pub async fn member_count(&self) -> usize {
        self.participants.read().await.len()
    }

    /// Point-in-time snapshot of members other than `excluding`.
    pub async fn members_of(&self, excluding: &Uuid) -> Vec<ParticipantInfo> {
        self.participants
            .read()
            .await
            .values()
            .filter(|p| p.connection_id != *excluding)
            .map(Participant::info)
            .collect()
    }

    /// Full roster snapshot of the current membership.
    pub async fn roster(&self) -> RosterSync {
        let participants = self.participants.read().await;
        build_roster(participants.values())
    }

    /// Clone one member record, if present.
    pub async fn participant(&self, connection_id: &Uuid) -> Option<Participant> {
        self.participants.read().await.get(connection_id).cloned()
    }

    /// Mutate one member record in place. Returns false if not a member.
    pub async fn update_participant<F>(&self, connection_id: &Uuid, f: F) -> bool
    where
        F: FnOnce(&mut Participant),
    {
        let mut participants = self.participants.write().await;
        match participants.get_mut(connection_id) {
            Some(p) => {
                f(p);
                true
            }
            None => false,
        }
    }

    /// Fan an opaque content delta out to the room.
    ///
    /// The payload is not inspected, merged, or buffered; the broadcast
    /// channel's send order is the order every receiver observes. Returns
    /// the number of subscribers the frame reached (the sender's own
    /// receiver included — echo suppression happens on the receive side).
    pub fn relay_delta(&self, sender: Uuid, payload: Vec<u8>) -> Result<usize, RelayError> {
        let env = Envelope::delta(sender, self.document_id, payload);
        let encoded = env.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Fan a cursor/selection frame out to the room.
    ///
    /// The frame is forwarded even when `participant_id` is not a current
    /// member; receivers ignore ids they don't know.
    pub fn relay_cursor(&self, sender: Uuid, frame: &CursorFrame) -> Result<usize, RelayError> {
        let env = Envelope::cursor(sender, self.document_id, frame)?;
        let encoded = env.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast a pre-encoded frame (zero-copy fast path).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        self.sender.send(encoded).unwrap_or(0)
    }

    /// Broadcast an envelope to the room.
    pub fn broadcast(&self, env: &Envelope) -> Result<usize, ProtocolError> {
        let encoded = env.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Subscribe without becoming a member.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

/// Outcome of a successful [`RoomRegistry::join`].
pub struct Joined {
    pub room: Arc<Room>,
    pub receiver: broadcast::Receiver<Arc<Vec<u8>>>,
    /// Set when the connection was in another room and was implicitly moved
    /// out of it; the caller re-syncs that room's remaining members.
    pub left: Option<Left>,
    /// True when this join created the room.
    pub created_room: bool,
}

/// Outcome of a [`RoomRegistry::leave`].
pub struct Left {
    pub room: Arc<Room>,
    pub participant: Participant,
    /// True when the departure emptied the room and it was collected.
    pub now_empty: bool,
}

/// Document id → room map, plus the connection → room index.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    /// connection id → document id; at most one entry per connection.
    memberships: RwLock<HashMap<Uuid, Uuid>>,
    default_capacity: usize,
}

impl RoomRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            memberships: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Add a connection to a document's room, creating the room if absent.
    ///
    /// Joining the room the connection is already in is a no-op and returns
    /// `None` — the caller keeps its existing receiver. Joining a different
    /// room implicitly leaves the previous one first, so a connection is a
    /// member of at most one room at any instant.
    pub async fn join(&self, participant: Participant, document_id: Uuid) -> Option<Joined> {
        let connection_id = participant.connection_id;

        let previous = {
            let memberships = self.memberships.read().await;
            memberships.get(&connection_id).copied()
        };

        if previous == Some(document_id) {
            return None; // DuplicateJoin: silently ignored
        }

        let left = match previous {
            Some(_) => self.leave(&connection_id).await,
            None => None,
        };

        let (room, created_room) = self.get_or_create(document_id).await;
        let receiver = room.add(participant).await;
        self.memberships
            .write()
            .await
            .insert(connection_id, document_id);

        log::debug!("connection {connection_id} joined room {document_id}");

        Some(Joined {
            room,
            receiver,
            left,
            created_room,
        })
    }

    /// Remove a connection from whatever room it is in.
    ///
    /// Idempotent: leaving twice, or leaving without ever joining, returns
    /// `None` and changes nothing. An emptied room is removed from the
    /// registry.
    pub async fn leave(&self, connection_id: &Uuid) -> Option<Left> {
        let document_id = self.memberships.write().await.remove(connection_id)?;

        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(&document_id).cloned()
        }?;

        let participant = room.remove(connection_id).await?;
        let now_empty = self.remove_if_empty(&document_id).await;

        log::debug!("connection {connection_id} left room {document_id}");

        Some(Left {
            room,
            participant,
            now_empty,
        })
    }

    /// The room a connection currently belongs to.
    pub async fn room_of(&self, connection_id: &Uuid) -> Option<Arc<Room>> {
        let document_id = {
            let memberships = self.memberships.read().await;
            memberships.get(connection_id).copied()?
        };
        self.rooms.read().await.get(&document_id).cloned()
    }

    /// The document a connection currently belongs to.
    pub async fn membership(&self, connection_id: &Uuid) -> Option<Uuid> {
        self.memberships.read().await.get(connection_id).copied()
    }

    /// Look up a room without creating it.
    pub async fn get(&self, document_id: &Uuid) -> Option<Arc<Room>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    /// Point-in-time snapshot of a room's members other than `excluding`.
    pub async fn members_of(&self, document_id: &Uuid, excluding: &Uuid) -> Vec<ParticipantInfo> {
        match self.get(document_id).await {
            Some(room) => room.members_of(excluding).await,
            None => Vec::new(),
        }
    }

    /// Forward a content delta to every other member of the document's room.
    ///
    /// Fails with [`RelayError::NotInRoom`] when the sending connection is
    /// not a member of that room; the caller drops the event.
    pub async fn relay_delta(
        &self,
        connection_id: Uuid,
        document_id: Uuid,
        payload: Vec<u8>,
    ) -> Result<usize, RelayError> {
        let room = self.member_room(&connection_id, &document_id).await?;
        room.relay_delta(connection_id, payload)
    }

    /// Forward a cursor frame to every other member of the document's room.
    pub async fn relay_cursor(
        &self,
        connection_id: Uuid,
        document_id: Uuid,
        frame: &CursorFrame,
    ) -> Result<usize, RelayError> {
        let room = self.member_room(&connection_id, &document_id).await?;
        room.update_participant(&connection_id, |p| {
            p.last_cursor = Some(frame.range.clone());
        })
        .await;
        room.relay_cursor(connection_id, frame)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }

    /// Drop every room and membership. Used at server shutdown.
    pub async fn clear(&self) {
        self.memberships.write().await.clear();
        self.rooms.write().await.clear();
    }

    async fn member_room(
        &self,
        connection_id: &Uuid,
        document_id: &Uuid,
    ) -> Result<Arc<Room>, RelayError> {
        if self.membership(connection_id).await != Some(*document_id) {
            return Err(RelayError::NotInRoom);
        }
        self.get(document_id).await.ok_or(RelayError::NotInRoom)
    }

    async fn get_or_create(&self, document_id: Uuid) -> (Arc<Room>, bool) {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&document_id) {
                return (room.clone(), false);
            }
        }

        // Slow path: write lock, re-check after acquiring
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&document_id) {
            return (room.clone(), false);
        }

        let room = Arc::new(Room::new(document_id, self.default_capacity));
        rooms.insert(document_id, room.clone());
        log::debug!("room {document_id} created");
        (room, true)
    }

    async fn remove_if_empty(&self, document_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(document_id) {
            // Re-check under the write lock: a concurrent join may have
            // repopulated the room between our removal and here.
            if room.member_count().await == 0 {
                rooms.remove(document_id);
                log::debug!("room {document_id} removed (empty)");
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventKind;

    fn participant() -> Participant {
        Participant::anonymous(Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_room_add_remove() {
        let room = Room::new(Uuid::new_v4(), 16);
        let p = participant();
        let conn = p.connection_id;

        let _rx = room.add(p).await;
        assert_eq!(room.member_count().await, 1);
        assert!(room.is_member(&conn).await);

        room.remove(&conn).await;
        assert_eq!(room.member_count().await, 0);
        assert!(!room.is_member(&conn).await);
    }

    #[tokio::test]
    async fn test_relay_delta_fan_out() {
        let doc = Uuid::new_v4();
        let room = Room::new(doc, 16);

        let a = participant();
        let sender_id = a.connection_id;
        let mut rx_a = room.add(a).await;
        let mut rx_b = room.add(participant()).await;
        let mut rx_c = room.add(participant()).await;

        let count = room.relay_delta(sender_id, vec![1, 2, 3]).unwrap();
        // All 3 subscribers get the frame; echo suppression is receive-side.
        assert_eq!(count, 3);

        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            let frame = rx.recv().await.unwrap();
            let env = Envelope::decode(&frame).unwrap();
            assert_eq!(env.kind, EventKind::Delta);
            assert_eq!(env.sender, sender_id);
            assert_eq!(env.document_id, doc);
            assert_eq!(env.payload, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_relay_preserves_order() {
        let room = Room::new(Uuid::new_v4(), 64);
        let a = participant();
        let b = participant();
        let a_id = a.connection_id;
        let b_id = b.connection_id;
        let _rx_a = room.add(a).await;
        let mut rx_b = room.add(b).await;

        // Interleave senders; acceptance order is what receivers must see.
        for i in 0..20u8 {
            let sender = if i % 2 == 0 { a_id } else { b_id };
            room.relay_delta(sender, vec![i]).unwrap();
        }

        for i in 0..20u8 {
            let frame = rx_b.recv().await.unwrap();
            let env = Envelope::decode(&frame).unwrap();
            assert_eq!(env.payload, vec![i], "delta {i} out of order");
        }
    }

    #[tokio::test]
    async fn test_relay_cursor_unknown_participant_forwarded() {
        let room = Room::new(Uuid::new_v4(), 16);
        let a = participant();
        let a_id = a.connection_id;
        let _rx_a = room.add(a).await;
        let mut rx_b = room.add(participant()).await;

        // participant_id that no member owns; forwarded regardless
        let frame = CursorFrame {
            participant_id: Uuid::new_v4(),
            range: vec![9, 9],
        };
        room.relay_cursor(a_id, &frame).unwrap();

        let received = rx_b.recv().await.unwrap();
        let env = Envelope::decode(&received).unwrap();
        assert_eq!(env.cursor_frame().unwrap(), frame);
    }

    #[tokio::test]
    async fn test_registry_join_creates_room() {
        let registry = RoomRegistry::new(16);
        let doc = Uuid::new_v4();
        let p = participant();
        let conn = p.connection_id;

        let joined = registry.join(p, doc).await.unwrap();
        assert!(joined.created_room);
        assert!(joined.left.is_none());
        assert_eq!(registry.room_count().await, 1);
        assert_eq!(registry.membership(&conn).await, Some(doc));
    }

    #[tokio::test]
    async fn test_registry_duplicate_join_noop() {
        let registry = RoomRegistry::new(16);
        let doc = Uuid::new_v4();
        let p = participant();
        let conn = p.connection_id;

        assert!(registry.join(p.clone(), doc).await.is_some());
        assert!(registry.join(p, doc).await.is_none());
        assert_eq!(registry.room_count().await, 1);
        assert_eq!(
            registry.get(&doc).await.unwrap().member_count().await,
            1,
            "duplicate join must not add a second membership"
        );
        assert_eq!(registry.membership(&conn).await, Some(doc));
    }

    #[tokio::test]
    async fn test_registry_switch_room_leaves_previous() {
        let registry = RoomRegistry::new(16);
        let doc1 = Uuid::new_v4();
        let doc2 = Uuid::new_v4();
        let p = participant();
        let conn = p.connection_id;

        registry.join(p.clone(), doc1).await.unwrap();
        let joined = registry.join(p, doc2).await.unwrap();

        let left = joined.left.expect("switching rooms leaves the old one");
        assert_eq!(left.room.document_id(), doc1);
        assert!(left.now_empty);

        assert_eq!(registry.membership(&conn).await, Some(doc2));
        assert!(registry.get(&doc1).await.is_none(), "emptied room collected");
    }

    #[tokio::test]
    async fn test_registry_leave_idempotent() {
        let registry = RoomRegistry::new(16);
        let doc = Uuid::new_v4();
        let p = participant();
        let conn = p.connection_id;

        registry.join(p, doc).await.unwrap();
        assert!(registry.leave(&conn).await.is_some());
        assert!(registry.leave(&conn).await.is_none());

        // Leaving a connection that never joined
        assert!(registry.leave(&Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_registry_leave_does_not_disturb_other_rooms() {
        let registry = RoomRegistry::new(16);
        let doc1 = Uuid::new_v4();
        let doc2 = Uuid::new_v4();

        let p1 = participant();
        let p2 = participant();
        let conn1 = p1.connection_id;

        registry.join(p1, doc1).await.unwrap();
        registry.join(p2, doc2).await.unwrap();

        registry.leave(&conn1).await.unwrap();
        registry.leave(&conn1).await; // double leave

        assert_eq!(registry.room_count().await, 1);
        assert_eq!(registry.get(&doc2).await.unwrap().member_count().await, 1);
    }

    #[tokio::test]
    async fn test_registry_membership_exact_after_interleaving() {
        let registry = RoomRegistry::new(16);
        let doc = Uuid::new_v4();

        let ps: Vec<Participant> = (0..4).map(|_| participant()).collect();
        for p in &ps {
            registry.join(p.clone(), doc).await;
        }
        // ps[1] leaves, ps[0] leaves and rejoins, ps[3] double-joins
        registry.leave(&ps[1].connection_id).await;
        registry.leave(&ps[0].connection_id).await;
        registry.join(ps[0].clone(), doc).await;
        registry.join(ps[3].clone(), doc).await;

        let room = registry.get(&doc).await.unwrap();
        assert_eq!(room.member_count().await, 3);
        assert!(room.is_member(&ps[0].connection_id).await);
        assert!(!room.is_member(&ps[1].connection_id).await);
        assert!(room.is_member(&ps[2].connection_id).await);
        assert!(room.is_member(&ps[3].connection_id).await);
    }

    #[tokio::test]
    async fn test_relay_requires_membership() {
        let registry = RoomRegistry::new(16);
        let doc = Uuid::new_v4();
        let outsider = Uuid::new_v4();

        let p = participant();
        registry.join(p, doc).await.unwrap();

        let result = registry.relay_delta(outsider, doc, vec![1]).await;
        assert!(matches!(result, Err(RelayError::NotInRoom)));

        // Member relaying to a room it is not in
        let other_doc = Uuid::new_v4();
        let result = registry.relay_delta(outsider, other_doc, vec![1]).await;
        assert!(matches!(result, Err(RelayError::NotInRoom)));
    }

    #[tokio::test]
    async fn test_room_isolation() {
        let registry = RoomRegistry::new(16);
        let doc1 = Uuid::new_v4();
        let doc2 = Uuid::new_v4();

        let p1 = participant();
        let p2 = participant();
        let conn2 = p2.connection_id;

        let joined1 = registry.join(p1, doc1).await.unwrap();
        let mut rx1 = joined1.receiver;
        registry.join(p2, doc2).await.unwrap();

        registry.relay_delta(conn2, doc2, vec![1, 2, 3]).await.unwrap();

        // Room 1's receiver must see nothing from room 2
        let result =
            tokio::time::timeout(std::time::Duration::from_millis(100), rx1.recv()).await;
        assert!(result.is_err(), "room 1 must not receive room 2 frames");
    }

    #[tokio::test]
    async fn test_relay_cursor_records_last_cursor() {
        let registry = RoomRegistry::new(16);
        let doc = Uuid::new_v4();
        let p = participant();
        let conn = p.connection_id;
        registry.join(p, doc).await.unwrap();

        let frame = CursorFrame {
            participant_id: conn,
            range: vec![5, 1],
        };
        registry.relay_cursor(conn, doc, &frame).await.unwrap();

        let room = registry.get(&doc).await.unwrap();
        let record = room.participant(&conn).await.unwrap();
        assert_eq!(record.last_cursor, Some(vec![5, 1]));
    }

    #[tokio::test]
    async fn test_members_of_excludes_requester() {
        let registry = RoomRegistry::new(16);
        let doc = Uuid::new_v4();

        let p1 = participant();
        let p2 = participant();
        let p3 = participant();
        let conn1 = p1.connection_id;

        registry.join(p1, doc).await;
        registry.join(p2.clone(), doc).await;
        registry.join(p3.clone(), doc).await;

        let others = registry.members_of(&doc, &conn1).await;
        assert_eq!(others.len(), 2);
        assert!(others.iter().all(|m| m.participant_id != conn1));

        // Unknown room: empty snapshot, no error.
        assert!(registry.members_of(&Uuid::new_v4(), &conn1).await.is_empty());
    }

    #[tokio::test]
    async fn test_registry_clear() {
        let registry = RoomRegistry::new(16);
        let p = participant();
        let conn = p.connection_id;
        registry.join(p, Uuid::new_v4()).await.unwrap();

        registry.clear().await;
        assert_eq!(registry.room_count().await, 0);
        assert_eq!(registry.membership(&conn).await, None);
    }
}
