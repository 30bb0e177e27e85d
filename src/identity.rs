//! Identity resolution collaborator.
//!
//! The gateway consults an [`IdentityResolver`] when a connection announces
//! itself, to validate and augment the claimed identity. Resolution is best
//! effort: an unresolvable connection still participates anonymously —
//! identity never gates collaboration.

use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// A resolved user identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityProfile {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

/// External identity interface.
pub trait IdentityResolver: Send + Sync + 'static {
    /// Resolve a connection to a user profile, or `None` if unknown.
    fn resolve(&self, connection_id: &Uuid) -> Option<IdentityProfile>;
}

/// Resolver that knows nobody; every connection stays anonymous.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousResolver;

impl IdentityResolver for AnonymousResolver {
    fn resolve(&self, _connection_id: &Uuid) -> Option<IdentityProfile> {
        None
    }
}

/// In-memory connection → profile directory.
///
/// Hosts register a connection's profile out of band (e.g. from their auth
/// session at upgrade time); tests seed it directly.
#[derive(Default)]
pub struct MemoryDirectory {
    profiles: Mutex<HashMap<Uuid, IdentityProfile>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection_id: Uuid, profile: IdentityProfile) {
        self.profiles.lock().unwrap().insert(connection_id, profile);
    }

    pub fn unregister(&self, connection_id: &Uuid) {
        self.profiles.lock().unwrap().remove(connection_id);
    }
}

impl IdentityResolver for MemoryDirectory {
    fn resolve(&self, connection_id: &Uuid) -> Option<IdentityProfile> {
        self.profiles.lock().unwrap().get(connection_id).cloned()
    }
}
