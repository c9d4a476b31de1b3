//! Session registry.
//!
//! Membership here is the only record of who is present. The registry is
//! plain data; the hub serializes every access through its lock.

use std::collections::HashMap;
use tether_protocol::Reply;
use tracing::{debug, warn};

use crate::auth::TokenIssuer;
use crate::error::HubError;
use crate::session::{Delivery, Outbound, Session, SessionHandle, SessionId, SessionTicket};

/// Connected sessions indexed by id.
#[derive(Debug)]
pub struct Registry {
    sessions: HashMap<SessionId, Session>,
    max_sessions: usize,
}

impl Registry {
    /// Create a registry holding at most `max_sessions` sessions.
    #[must_use]
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
        }
    }

    /// Register a connection, assigning it an id, token and timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry is full or the token cannot be issued.
    pub fn register(
        &mut self,
        handle: SessionHandle,
        issuer: &dyn TokenIssuer,
    ) -> Result<SessionTicket, HubError> {
        if self.sessions.len() >= self.max_sessions {
            return Err(HubError::TooManySessions);
        }

        let mut id = SessionId::generate();
        while self.sessions.contains_key(&id) {
            id = SessionId::generate();
        }
        let token = issuer.issue(&id)?;

        let session = Session::new(id.clone(), handle, token.clone());
        self.sessions.insert(id.clone(), session);
        debug!(session = %id, members = self.sessions.len(), "Session registered");

        Ok(SessionTicket { id, token })
    }

    /// Get a session.
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Remove a session. Unknown ids are ignored.
    pub fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let removed = self.sessions.remove(id);
        if removed.is_some() {
            debug!(session = %id, members = self.sessions.len(), "Session removed");
        }
        removed
    }

    /// Visit every session whose socket is still open.
    pub fn for_each_alive(&self, mut f: impl FnMut(&Session)) {
        self.sessions
            .values()
            .filter(|s| s.handle.is_open())
            .for_each(|s| f(s));
    }

    /// Send a reply to every open session. Returns how many accepted it.
    ///
    /// Sessions whose queue is full are terminated rather than waited on.
    pub fn broadcast(&self, reply: &Reply) -> usize {
        let mut delivered = 0;
        self.for_each_alive(|session| match session.handle.send(Outbound::Reply(reply.clone())) {
            Delivery::Queued => delivered += 1,
            Delivery::Lagged => {
                warn!(session = %session.id, "Outbound queue full, terminating session");
            }
            Delivery::Dropped => {}
        });
        delivered
    }

    /// Record a probe response.
    pub fn mark_alive(&mut self, id: &SessionId) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.alive = true;
                true
            }
            None => false,
        }
    }

    /// Any member, in no particular order.
    #[must_use]
    pub fn any_id(&self) -> Option<SessionId> {
        self.sessions.keys().next().cloned()
    }

    /// Whether a session is registered.
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove every session, returning them.
    pub fn drain(&mut self) -> Vec<Session> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    pub(crate) fn sessions_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}
