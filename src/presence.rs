//! Ephemeral presence: who is in a room, under what name and color.
//!
//! The server keeps one [`Participant`] per live connection and, on every
//! membership or identity change, rebuilds the full roster and broadcasts it
//! as a `presence-sync` frame to every member — the joiner included — so each
//! client's collaborator UI is rebuilt from one consistent snapshot instead
//! of incrementally patched.
//!
//! Presence state is never written to durable storage. A room with zero
//! members simply has no presence state.
//!
//! [`RosterView`] is the client-side mirror: it consumes roster snapshots and
//! cursor frames and exposes the collaborator list plus the latest known
//! cursor range per participant.

use std::collections::HashMap;
use uuid::Uuid;

use crate::protocol::{AnnounceInfo, CursorFrame, ParticipantInfo, RosterSync};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGBA color for rendering a participant's cursor and avatar ring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticipantColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl ParticipantColor {
    /// Derive a stable, visually distinct color from a participant id.
    ///
    /// High-saturation HSL with the hue taken from the id, so every client
    /// renders the same color for the same participant without an extra
    /// sync field.
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// Convert to a `[f32; 4]` array for the wire roster.
    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// HSL to RGB conversion helper.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Server-side participant record
// ───────────────────────────────────────────────────────────────────

/// One live connection's identity and cursor state within a room.
///
/// Created on join, updated by `announce`, destroyed on leave/disconnect.
/// The same user in two tabs is two Participants with distinct ids.
#[derive(Debug, Clone)]
pub struct Participant {
    pub connection_id: Uuid,
    pub user_id: Option<Uuid>,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub color: ParticipantColor,
    /// Last cursor range relayed by this connection, opaque bytes.
    pub last_cursor: Option<Vec<u8>>,
}

impl Participant {
    /// A participant with no announced identity yet.
    pub fn anonymous(connection_id: Uuid) -> Self {
        Self {
            connection_id,
            user_id: None,
            display_name: "Anonymous".to_string(),
            avatar_ref: None,
            color: ParticipantColor::from_uuid(connection_id),
            last_cursor: None,
        }
    }

    /// Apply an identity announcement to this record.
    pub fn apply_announce(&mut self, info: &AnnounceInfo) {
        self.user_id = Some(info.user_id);
        self.display_name = info.display_name.clone();
        self.avatar_ref = info.avatar_ref.clone();
    }

    /// Wire form of this record for a roster snapshot.
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            participant_id: self.connection_id,
            user_id: self.user_id,
            display_name: self.display_name.clone(),
            color: self.color.to_array(),
        }
    }
}

/// Build a full roster snapshot from a room's member records.
///
/// Sorted by participant id so repeated snapshots of the same membership are
/// byte-identical.
pub fn build_roster<'a>(members: impl Iterator<Item = &'a Participant>) -> RosterSync {
    let mut members: Vec<ParticipantInfo> = members.map(Participant::info).collect();
    members.sort_by_key(|m| m.participant_id);
    RosterSync { members }
}

// ───────────────────────────────────────────────────────────────────
// Client-side roster view
// ───────────────────────────────────────────────────────────────────

/// A remote collaborator as seen by one client.
#[derive(Debug, Clone)]
pub struct RemoteParticipant {
    pub info: ParticipantInfo,
    /// Latest cursor range received for this participant, opaque bytes.
    /// No sequence numbers are attached, so a reordered frame can leave a
    /// stale range here until the next one arrives — cosmetic only.
    pub last_range: Option<Vec<u8>>,
}

/// Client-side mirror of a room's presence.
///
/// Rebuilt wholesale from each `presence-sync` snapshot; cursor frames are
/// applied on top by participant id. The local participant is never listed.
#[derive(Debug, Default)]
pub struct RosterView {
    local_participant: Uuid,
    peers: HashMap<Uuid, RemoteParticipant>,
}

impl RosterView {
    pub fn new(local_participant: Uuid) -> Self {
        Self {
            local_participant,
            peers: HashMap::new(),
        }
    }

    /// Replace the collaborator set from a full roster snapshot.
    ///
    /// Cursor ranges of participants that survive the snapshot are kept;
    /// everyone absent from the snapshot is dropped.
    pub fn apply_roster(&mut self, roster: &RosterSync) {
        let mut next = HashMap::with_capacity(roster.members.len());
        for info in &roster.members {
            if info.participant_id == self.local_participant {
                continue;
            }
            let last_range = self
                .peers
                .get(&info.participant_id)
                .and_then(|p| p.last_range.clone());
            next.insert(
                info.participant_id,
                RemoteParticipant {
                    info: info.clone(),
                    last_range,
                },
            );
        }
        self.peers = next;
    }

    /// Apply a relayed cursor frame.
    ///
    /// Unknown participant ids are ignored here; the relay forwards them
    /// regardless and leaves the filtering to each receiver.
    pub fn apply_cursor(&mut self, frame: &CursorFrame) {
        if let Some(peer) = self.peers.get_mut(&frame.participant_id) {
            peer.last_range = Some(frame.range.clone());
        }
    }

    /// Collaborators currently in the room, sorted by participant id.
    pub fn collaborators(&self) -> Vec<&RemoteParticipant> {
        let mut peers: Vec<&RemoteParticipant> = self.peers.values().collect();
        peers.sort_by_key(|p| p.info.participant_id);
        peers
    }

    /// Latest cursor range for a participant, if any.
    pub fn cursor_of(&self, participant_id: &Uuid) -> Option<&[u8]> {
        self.peers
            .get(participant_id)
            .and_then(|p| p.last_range.as_deref())
    }

    pub fn contains(&self, participant_id: &Uuid) -> bool {
        self.peers.contains_key(participant_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
