//! Session identity.
//!
//! A session spans one record → transcribe cycle.  [`ActiveSession`] is the
//! single slot holding the current one; the state machine writes it, the
//! dispatcher only reads it to filter stale notifications.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// A fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub created_at: SystemTime,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: SessionId::generate(),
            created_at: SystemTime::now(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ActiveSession
// ---------------------------------------------------------------------------

/// Shared handle to the at-most-one active session.  Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ActiveSession {
    slot: Arc<RwLock<Option<Session>>>,
}

impl ActiveSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Session> {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn current_id(&self) -> Option<SessionId> {
        self.current().map(|s| s.id)
    }

    /// `true` when `id` is the active session.
    pub fn is_active(&self, id: &str) -> bool {
        self.slot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|s| s.id.as_str() == id)
    }

    /// Install `session` as active, replacing any previous one.
    pub(crate) fn begin(&self, session: Session) {
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = Some(session);
    }

    /// Retire `id` if it is still the active session.
    pub(crate) fn retire(&self, id: &SessionId) -> bool {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|s| &s.id == id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn clear(&self) -> Option<Session> {
        self.slot.write().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn begin_and_retire() {
        let active = ActiveSession::new();
        assert!(active.current().is_none());

        let session = Session::new();
        let id = session.id.clone();
        active.begin(session);
        assert!(active.is_active(id.as_str()));
        assert!(!active.is_active("other"));

        assert!(!active.retire(&SessionId::from("other")));
        assert!(active.retire(&id));
        assert!(active.current_id().is_none());
    }

    #[test]
    fn clones_share_the_slot() {
        let a = ActiveSession::new();
        let b = a.clone();
        a.begin(Session::new());
        assert!(b.current().is_some());
        assert!(b.clear().is_some());
        assert!(a.current().is_none());
    }
}
