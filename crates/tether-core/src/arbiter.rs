//! Ownership of the shared broker connection.
//!
//! Ownership is a bookkeeping label naming who asked for the current
//! connection. It decides nothing about the connection itself except when
//! the last session leaves. These functions are pure; the hub applies their
//! verdicts while holding its lock.

use std::fmt;

use crate::bridge::BridgePhase;
use crate::error::HubError;
use crate::registry::Registry;
use crate::session::SessionId;

/// Who requested the current connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    /// A realtime session.
    Session(SessionId),
    /// A caller outside the realtime channel (HTTP API).
    External,
}

impl Owner {
    /// Whether this owner is the given session.
    #[must_use]
    pub fn is_session(&self, id: &SessionId) -> bool {
        matches!(self, Owner::Session(owner) if owner == id)
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Session(id) => write!(f, "{}", id),
            Owner::External => f.write_str("http"),
        }
    }
}

/// What a session leaving means for the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    /// Nothing changes.
    Untouched,
    /// The owner left; ownership moves to another member.
    Reassigned(SessionId),
    /// Nobody is left; the connection must be drained.
    Drain,
}

/// Decide what happens when `departed` has been removed from `remaining`.
#[must_use]
pub fn on_departure(
    phase: BridgePhase,
    owner: Option<&Owner>,
    departed: &SessionId,
    remaining: &Registry,
) -> Departure {
    if phase != BridgePhase::Connected {
        return Departure::Untouched;
    }
    if remaining.is_empty() {
        return Departure::Drain;
    }
    match owner {
        Some(owner) if owner.is_session(departed) => remaining
            .any_id()
            .map_or(Departure::Drain, Departure::Reassigned),
        _ => Departure::Untouched,
    }
}

/// Whether a session may drain the connection.
///
/// # Errors
///
/// Returns the state error the requester should see.
pub fn check_disconnect(phase: BridgePhase, members: usize) -> Result<(), HubError> {
    match phase {
        BridgePhase::Disconnected => Err(HubError::NotConnected),
        BridgePhase::Connecting => Err(HubError::AlreadyConnecting),
        BridgePhase::Connected if members == 1 => Ok(()),
        BridgePhase::Connected => Err(HubError::SessionsRemain),
    }
}

/// Who owns a connection that just finished establishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settle {
    /// The requester is still around.
    Keep(Owner),
    /// The requester left mid-connect; another member takes over.
    Reassign(SessionId),
    /// Everyone left mid-connect; drain the new connection.
    Drain,
}

/// Settle ownership once a connect completes.
#[must_use]
pub fn settle(requested: Owner, registry: &Registry) -> Settle {
    match &requested {
        Owner::Session(id) if !registry.contains(id) => registry
            .any_id()
            .map_or(Settle::Drain, Settle::Reassign),
        _ => Settle::Keep(requested),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtIssuer;
    use crate::session::SessionHandle;
    use std::time::Duration;

    fn registry_with(n: usize) -> (Registry, Vec<SessionId>) {
        let issuer = JwtIssuer::new(b"arbiter", Duration::from_secs(60));
        let mut registry = Registry::default();
        let ids = (0..n)
            .map(|_| {
                let (handle, _rx) = SessionHandle::channel();
                registry.register(handle, &issuer).unwrap().id
            })
            .collect();
        (registry, ids)
    }

    #[test]
    fn test_owner_departure_reassigns() {
        let (mut registry, ids) = registry_with(2);
        let owner = Owner::Session(ids[0].clone());
        registry.remove(&ids[0]);

        assert_eq!(
            on_departure(BridgePhase::Connected, Some(&owner), &ids[0], &registry),
            Departure::Reassigned(ids[1].clone())
        );
    }

    #[test]
    fn test_non_owner_departure_untouched() {
        let (mut registry, ids) = registry_with(2);
        let owner = Owner::Session(ids[0].clone());
        registry.remove(&ids[1]);

        assert_eq!(
            on_departure(BridgePhase::Connected, Some(&owner), &ids[1], &registry),
            Departure::Untouched
        );
    }

    #[test]
    fn test_last_departure_drains() {
        let (mut registry, ids) = registry_with(1);
        registry.remove(&ids[0]);

        assert_eq!(
            on_departure(BridgePhase::Connected, Some(&Owner::External), &ids[0], &registry),
            Departure::Drain
        );
        assert_eq!(
            on_departure(BridgePhase::Disconnected, None, &ids[0], &registry),
            Departure::Untouched
        );
    }

    #[test]
    fn test_check_disconnect() {
        assert!(check_disconnect(BridgePhase::Connected, 1).is_ok());
        assert!(matches!(
            check_disconnect(BridgePhase::Connected, 2),
            Err(HubError::SessionsRemain)
        ));
        assert!(matches!(
            check_disconnect(BridgePhase::Disconnected, 1),
            Err(HubError::NotConnected)
        ));
        assert!(matches!(
            check_disconnect(BridgePhase::Connecting, 1),
            Err(HubError::AlreadyConnecting)
        ));
    }

    #[test]
    fn test_settle() {
        let (mut registry, ids) = registry_with(2);
        let requester = Owner::Session(ids[0].clone());
        assert_eq!(settle(requester.clone(), &registry), Settle::Keep(requester.clone()));

        registry.remove(&ids[0]);
        assert_eq!(settle(requester.clone(), &registry), Settle::Reassign(ids[1].clone()));

        registry.remove(&ids[1]);
        assert_eq!(settle(requester, &registry), Settle::Drain);
        assert_eq!(settle(Owner::External, &registry), Settle::Keep(Owner::External));
    }
}
