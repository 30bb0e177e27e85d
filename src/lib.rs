//! # vellum-collab — real-time sync core for the Vellum workspace
//!
//! Lets multiple editors on the same document exchange content changes and
//! cursor positions, see each other's presence, and have their work saved
//! without every keystroke hitting storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ CollabServer │
//! │ (per editor) │    binary frames    │  (gateway)   │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                              ┌──────────────┼──────────────┐
//!                              ▼              ▼              ▼
//!                       ┌────────────┐ ┌────────────┐ ┌────────────┐
//!                       │RoomRegistry│ │ presence   │ │ Snapshot   │
//!                       │ (ordered   │ │ (roster    │ │ Coalescer  │
//!                       │  fan-out)  │ │  sync)     │ │ (debounce) │
//!                       └────────────┘ └────────────┘ └─────┬──────┘
//!                                                           ▼
//!                                                    SnapshotStore
//! ```
//!
//! Deltas are opaque: the core relays them in per-room order and persists
//! the latest observed content after a quiet period, but never merges or
//! interprets them. There is no OT/CRDT layer — concurrent edits resolve
//! last-snapshot-wins at the store.
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded [`Envelope`])
//! - [`room`] — room membership and room-scoped ordered fan-out
//! - [`presence`] — participant roster, colors, client-side roster view
//! - [`coalescer`] — per-document debounced snapshot persistence
//! - [`storage`] — snapshot store collaborator (memory, RocksDB)
//! - [`identity`] — identity resolver collaborator
//! - [`server`] — WebSocket gateway with explicit start/shutdown
//! - [`client`] — WebSocket client for editor front ends

pub mod protocol;
pub mod room;
pub mod presence;
pub mod coalescer;
pub mod storage;
pub mod identity;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    AnnounceInfo, CursorFrame, Envelope, EventKind, ParticipantInfo, ProtocolError, RosterSync,
};
pub use room::{Joined, Left, RelayError, Room, RoomRegistry};
pub use presence::{build_roster, Participant, ParticipantColor, RemoteParticipant, RosterView};
pub use coalescer::{SnapshotCoalescer, DEFAULT_DEBOUNCE};
pub use storage::{
    DocumentKind, MemoryStore, RocksStore, SnapshotMetadata, SnapshotStore, StoreConfig, StoreError,
};
pub use identity::{AnonymousResolver, IdentityProfile, IdentityResolver, MemoryDirectory};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use client::{CollabClient, CollabEvent, ConnectionState};
