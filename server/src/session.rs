//! Session registry: connection lifecycle for the lobby server
//!
//! This module tracks every connected client as a session, including:
//! - Session registration, lookup by address, and removal
//! - Lobby membership bookkeeping (which lobby, which role)
//! - Connection health monitoring and timeout cleanup
//! - Session capacity enforcement
//!
//! Sessions are the server's only notion of identity: a participant in a
//! lobby is addressed by its session id, and all packets from a given
//! source address are attributed to the session registered for it.

use log::info;
use shared::{Role, SessionId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A registered connection and its lobby membership.
///
/// `last_seen` is refreshed on every inbound packet; sessions that stay
/// silent past the registry timeout are swept exactly as if they had
/// disconnected.
#[derive(Debug)]
pub struct Session {
    /// Unique session identifier assigned by the server
    pub id: SessionId,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this session
    pub last_seen: Instant,
    /// Code of the lobby this session has joined, if any
    pub lobby_code: Option<String>,
    /// Whether the session joined as a player or a spectator
    pub role: Option<Role>,
}

impl Session {
    pub fn new(id: SessionId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            lobby_code: None,
            role: None,
        }
    }

    /// Marks the session as recently active.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Returns true if no packets have been received within `timeout`.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Registry of all connected sessions.
///
/// Enforces the server-wide session limit and owns the timeout sweep.
/// Lobby state lives elsewhere; the registry only records which lobby a
/// session belongs to so disconnects can be routed to the right one.
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    next_session_id: SessionId,
    max_sessions: usize,
    timeout: Duration,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            next_session_id: 1,
            max_sessions,
            timeout,
        }
    }

    /// Registers a new session for `addr`.
    ///
    /// Returns `Some(session_id)` if successful, `None` if the server is
    /// at capacity. Session ids start from 1 and are never reused.
    pub fn register(&mut self, addr: SocketAddr) -> Option<SessionId> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }

        let session_id = self.next_session_id;
        self.next_session_id += 1;

        let session = Session::new(session_id, addr);
        info!("Session {} connected from {}", session_id, addr);
        self.sessions.insert(session_id, session);

        Some(session_id)
    }

    /// Removes a session, returning it so the caller can unwind its lobby
    /// membership. Removing an unknown id is a no-op returning `None`.
    pub fn remove(&mut self, session_id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&session_id);
        if let Some(session) = &session {
            info!("Session {} disconnected", session.id);
        }
        session
    }

    /// Finds the session registered for a source address.
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<SessionId> {
        self.sessions
            .iter()
            .find(|(_, session)| session.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn get(&self, session_id: SessionId) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    pub fn get_mut(&mut self, session_id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&session_id)
    }

    /// Refreshes the activity timestamp for the session at `addr` and
    /// returns its id. Unknown addresses return `None`.
    pub fn touch_by_addr(&mut self, addr: SocketAddr) -> Option<SessionId> {
        let id = self.find_by_addr(addr)?;
        if let Some(session) = self.sessions.get_mut(&id) {
            session.touch();
        }
        Some(id)
    }

    /// Records which lobby the session has joined.
    pub fn set_lobby(&mut self, session_id: SessionId, code: String, role: Role) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.lobby_code = Some(code);
            session.role = Some(role);
        }
    }

    /// Clears the session's lobby membership.
    pub fn clear_lobby(&mut self, session_id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.lobby_code = None;
            session.role = None;
        }
    }

    /// Network address of a session, for direct acknowledgements.
    pub fn addr_of(&self, session_id: SessionId) -> Option<SocketAddr> {
        self.sessions.get(&session_id).map(|s| s.addr)
    }

    /// Resolves the addresses of a set of sessions, skipping any that
    /// have already been removed.
    pub fn addrs_of(&self, ids: impl IntoIterator<Item = SessionId>) -> Vec<SocketAddr> {
        ids.into_iter()
            .filter_map(|id| self.addr_of(id))
            .collect()
    }

    /// Sweeps sessions that have exceeded the registry timeout.
    ///
    /// The expired sessions are removed and returned so the caller can
    /// run the same departure flow as an explicit leave.
    pub fn check_timeouts(&mut self) -> Vec<SessionId> {
        let timeout = self.timeout;
        let timed_out: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        for session_id in &timed_out {
            self.remove(*session_id);
        }

        timed_out
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    fn registry(max: usize) -> SessionRegistry {
        SessionRegistry::new(max, Duration::from_secs(30))
    }

    #[test]
    fn test_session_creation() {
        let session = Session::new(1, test_addr());

        assert_eq!(session.id, 1);
        assert_eq!(session.addr, test_addr());
        assert!(session.lobby_code.is_none());
        assert!(session.role.is_none());
    }

    #[test]
    fn test_session_timeout() {
        let mut session = Session::new(1, test_addr());

        assert!(!session.is_timed_out(Duration::from_secs(1)));

        session.last_seen = Instant::now() - Duration::from_secs(2);

        assert!(session.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_register() {
        let mut sessions = registry(2);

        let id = sessions.register(test_addr()).unwrap();
        assert_eq!(id, 1);
        assert_eq!(sessions.len(), 1);
        assert!(!sessions.is_empty());
    }

    #[test]
    fn test_register_assigns_unique_ids() {
        let mut sessions = registry(3);

        let id1 = sessions.register(test_addr()).unwrap();
        let id2 = sessions.register(test_addr2()).unwrap();

        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert_eq!(sessions.len(), 2);
    }

    #[test]
    fn test_register_at_capacity() {
        let mut sessions = registry(1);

        assert!(sessions.register(test_addr()).is_some());
        assert!(sessions.register(test_addr2()).is_none());
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut sessions = registry(2);
        let id = sessions.register(test_addr()).unwrap();

        let removed = sessions.remove(id);
        assert!(removed.is_some());
        assert!(sessions.is_empty());

        assert!(sessions.remove(999).is_none());
    }

    #[test]
    fn test_find_by_addr() {
        let mut sessions = registry(2);
        let id1 = sessions.register(test_addr()).unwrap();
        let _id2 = sessions.register(test_addr2()).unwrap();

        assert_eq!(sessions.find_by_addr(test_addr()), Some(id1));

        let unknown: SocketAddr = "192.168.1.1:9999".parse().unwrap();
        assert_eq!(sessions.find_by_addr(unknown), None);
    }

    #[test]
    fn test_touch_by_addr_refreshes() {
        let mut sessions = registry(2);
        let id = sessions.register(test_addr()).unwrap();

        sessions.get_mut(id).unwrap().last_seen = Instant::now() - Duration::from_secs(60);
        assert_eq!(sessions.touch_by_addr(test_addr()), Some(id));
        assert!(!sessions.get(id).unwrap().is_timed_out(Duration::from_secs(30)));

        assert_eq!(sessions.touch_by_addr(test_addr2()), None);
    }

    #[test]
    fn test_lobby_membership() {
        let mut sessions = registry(2);
        let id = sessions.register(test_addr()).unwrap();

        sessions.set_lobby(id, "A1B2C3".to_string(), Role::Player);
        let session = sessions.get(id).unwrap();
        assert_eq!(session.lobby_code.as_deref(), Some("A1B2C3"));
        assert_eq!(session.role, Some(Role::Player));

        sessions.clear_lobby(id);
        let session = sessions.get(id).unwrap();
        assert!(session.lobby_code.is_none());
        assert!(session.role.is_none());
    }

    #[test]
    fn test_addrs_of_skips_removed() {
        let mut sessions = registry(3);
        let id1 = sessions.register(test_addr()).unwrap();
        let id2 = sessions.register(test_addr2()).unwrap();

        sessions.remove(id2);

        let addrs = sessions.addrs_of([id1, id2, 999]);
        assert_eq!(addrs, vec![test_addr()]);
    }

    #[test]
    fn test_check_timeouts() {
        let mut sessions = SessionRegistry::new(4, Duration::from_secs(5));
        let id1 = sessions.register(test_addr()).unwrap();
        let id2 = sessions.register(test_addr2()).unwrap();

        sessions.get_mut(id1).unwrap().last_seen = Instant::now() - Duration::from_secs(10);

        let expired = sessions.check_timeouts();
        assert_eq!(expired, vec![id1]);
        assert_eq!(sessions.len(), 1);
        assert!(sessions.get(id2).is_some());
    }
}
