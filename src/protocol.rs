//! Binary wire protocol for the collaboration gateway.
//!
//! Every frame on the socket is one bincode-encoded [`Envelope`]:
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┐
//! │ kind     │ sender    │ document_id  │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes     │ variable │
//! └──────────┴───────────┴──────────────┴──────────┘
//! ```
//!
//! Only the envelope is structurally validated. Delta and cursor-range
//! payloads are opaque application bytes and are relayed without
//! interpretation; typed payloads ([`AnnounceInfo`], [`CursorFrame`],
//! [`RosterSync`]) are bincode inside `payload`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event kinds carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    /// Client enters a document room
    Join = 1,
    /// Identity announcement, sent once after join
    Announce = 2,
    /// Opaque content change, fanned out to the rest of the room
    Delta = 3,
    /// Opaque selection/cursor range, fanned out to the rest of the room
    Cursor = 4,
    /// Full roster snapshot, sent to every room member
    PresenceSync = 5,
}

/// Identity payload of an `Announce` frame.
///
/// Sent once after join; until it arrives the connection participates
/// anonymously.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceInfo {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

/// Cursor payload of a `Cursor` frame.
///
/// `range` is an opaque positional payload (the editor's own selection
/// encoding). `participant_id` tags the frame so receivers can map it to a
/// rendered cursor decoration; unknown ids are forwarded anyway and left to
/// receivers to ignore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorFrame {
    pub participant_id: Uuid,
    pub range: Vec<u8>,
}

/// One entry of a `PresenceSync` roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    /// Connection-scoped id. The same user in two tabs is two participants.
    pub participant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub display_name: String,
    /// RGBA cursor/avatar color, stable per participant id.
    pub color: [f32; 4],
}

/// Roster payload of a `PresenceSync` frame.
///
/// Always the full member list. Clients rebuild their collaborator UI and
/// remote-cursor set from this snapshot rather than patching incrementally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterSync {
    pub members: Vec<ParticipantInfo>,
}

/// Top-level protocol frame.
///
/// `sender` is the originating connection id, or nil for server-originated
/// frames (roster syncs, content priming). `document_id` is nil only on
/// `Announce`, which addresses the connection's current room implicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EventKind,
    pub sender: Uuid,
    pub document_id: Uuid,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Room entry request.
    pub fn join(sender: Uuid, document_id: Uuid) -> Self {
        Self {
            kind: EventKind::Join,
            sender,
            document_id,
            payload: Vec::new(),
        }
    }

    /// Identity announcement. Carries no document id.
    pub fn announce(sender: Uuid, info: &AnnounceInfo) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: EventKind::Announce,
            sender,
            document_id: Uuid::nil(),
            payload: encode_payload(info)?,
        })
    }

    /// Opaque content change. The payload is relayed verbatim.
    pub fn delta(sender: Uuid, document_id: Uuid, payload: Vec<u8>) -> Self {
        Self {
            kind: EventKind::Delta,
            sender,
            document_id,
            payload,
        }
    }

    /// Cursor/selection update.
    pub fn cursor(
        sender: Uuid,
        document_id: Uuid,
        frame: &CursorFrame,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: EventKind::Cursor,
            sender,
            document_id,
            payload: encode_payload(frame)?,
        })
    }

    /// Full roster snapshot, server-originated.
    pub fn presence_sync(document_id: Uuid, roster: &RosterSync) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: EventKind::PresenceSync,
            sender: Uuid::nil(),
            document_id,
            payload: encode_payload(roster)?,
        })
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (env, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(env)
    }

    /// Parse an `Announce` payload.
    pub fn announce_info(&self) -> Result<AnnounceInfo, ProtocolError> {
        if self.kind != EventKind::Announce {
            return Err(ProtocolError::WrongKind);
        }
        decode_payload(&self.payload)
    }

    /// Parse a `Cursor` payload.
    pub fn cursor_frame(&self) -> Result<CursorFrame, ProtocolError> {
        if self.kind != EventKind::Cursor {
            return Err(ProtocolError::WrongKind);
        }
        decode_payload(&self.payload)
    }

    /// Parse a `PresenceSync` payload.
    pub fn roster(&self) -> Result<RosterSync, ProtocolError> {
        if self.kind != EventKind::PresenceSync {
            return Err(ProtocolError::WrongKind);
        }
        decode_payload(&self.payload)
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
    /// Payload accessor called on a frame of a different kind
    WrongKind,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::WrongKind => write!(f, "payload accessor on wrong frame kind"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_roundtrip() {
        let sender = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let payload = vec![1, 2, 3, 4, 5];

        let env = Envelope::delta(sender, doc, payload.clone());
        let encoded = env.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();

        assert_eq!(decoded.kind, EventKind::Delta);
        assert_eq!(decoded.sender, sender);
        assert_eq!(decoded.document_id, doc);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_join_roundtrip() {
        let sender = Uuid::new_v4();
        let doc = Uuid::new_v4();

        let env = Envelope::join(sender, doc);
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, EventKind::Join);
        assert_eq!(decoded.document_id, doc);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_announce_carries_no_document_id() {
        let info = AnnounceInfo {
            user_id: Uuid::new_v4(),
            display_name: "Alice".into(),
            avatar_ref: Some("avatars/alice.png".into()),
        };
        let env = Envelope::announce(Uuid::new_v4(), &info).unwrap();
        assert_eq!(env.document_id, Uuid::nil());

        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        let parsed = decoded.announce_info().unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_cursor_roundtrip() {
        let frame = CursorFrame {
            participant_id: Uuid::new_v4(),
            range: vec![0, 42, 0, 7],
        };
        let env = Envelope::cursor(Uuid::new_v4(), Uuid::new_v4(), &frame).unwrap();
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, EventKind::Cursor);
        assert_eq!(decoded.cursor_frame().unwrap(), frame);
    }

    #[test]
    fn test_presence_sync_roundtrip() {
        let roster = RosterSync {
            members: vec![
                ParticipantInfo {
                    participant_id: Uuid::new_v4(),
                    user_id: Some(Uuid::new_v4()),
                    display_name: "Alice".into(),
                    color: [0.2, 0.4, 0.6, 1.0],
                },
                ParticipantInfo {
                    participant_id: Uuid::new_v4(),
                    user_id: None,
                    display_name: "Anonymous".into(),
                    color: [0.6, 0.4, 0.2, 1.0],
                },
            ],
        };
        let doc = Uuid::new_v4();
        let env = Envelope::presence_sync(doc, &roster).unwrap();
        assert_eq!(env.sender, Uuid::nil());

        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded.roster().unwrap(), roster);
    }

    #[test]
    fn test_wrong_kind_errors() {
        let env = Envelope::join(Uuid::new_v4(), Uuid::new_v4());
        assert!(env.announce_info().is_err());
        assert!(env.cursor_frame().is_err());
        assert!(env.roster().is_err());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(Envelope::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_empty_delta() {
        let env = Envelope::delta(Uuid::new_v4(), Uuid::new_v4(), Vec::new());
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_large_delta() {
        let payload = vec![42u8; 65536];
        let env = Envelope::delta(Uuid::new_v4(), Uuid::new_v4(), payload.clone());
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_delta_size_efficient() {
        // 33-byte header + length prefix + payload; well under 150 bytes
        // for a typical 50-byte change.
        let env = Envelope::delta(Uuid::new_v4(), Uuid::new_v4(), vec![0u8; 50]);
        let encoded = env.encode().unwrap();
        assert!(
            encoded.len() < 150,
            "encoded size {} too large for 50-byte delta",
            encoded.len()
        );
    }

    #[test]
    fn test_event_kind_values() {
        assert_eq!(EventKind::Join as u8, 1);
        assert_eq!(EventKind::Announce as u8, 2);
        assert_eq!(EventKind::Delta as u8, 3);
        assert_eq!(EventKind::Cursor as u8, 4);
        assert_eq!(EventKind::PresenceSync as u8, 5);
    }
}
