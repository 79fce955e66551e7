//! Session registry.
//!
//! The registry is the single source of truth for which sessions exist. It is
//! shared (behind an `Arc`) by the controller, every pump, and the liveness
//! monitor, and all of them may use it at the same time.

use std::sync::Arc;

use dashmap::DashMap;
use shellmux_protocol::SessionId;

use super::process::Session;

/// Thread-safe map of session ID to session.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Registers `session` under `id`, returning the session it replaced.
    ///
    /// The caller owns the replaced session and must tear it down.
    pub fn set(&self, id: impl Into<SessionId>, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions.insert(id.into(), session)
    }

    /// Gets a session by ID.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a session is registered under `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Removes one session, returning it.
    pub fn remove_one(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Removes every listed ID, returning the sessions that were present.
    pub fn remove<I, S>(&self, ids: I) -> Vec<Arc<Session>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ids.into_iter()
            .filter_map(|id| self.remove_one(id.as_ref()))
            .collect()
    }

    /// Removes `id` only while it still maps to `session`.
    ///
    /// Paths that learned about a session before tearing it down use this so
    /// they never unregister a newer session that reused the ID.
    pub fn remove_if_same(&self, id: &str, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    /// Calls `visitor` for every registered session.
    ///
    /// The visitor sees a snapshot taken before the first call, so it may
    /// freely mutate the registry.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&SessionId, &Arc<Session>),
    {
        let snapshot: Vec<(SessionId, Arc<Session>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (id, session) in &snapshot {
            visitor(id, session);
        }
    }

    /// IDs of all registered sessions.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Removes and returns every session.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let ids = self.ids();
        self.remove(ids)
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
