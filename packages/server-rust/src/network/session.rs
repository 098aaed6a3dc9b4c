//! Server-side session state.
//!
//! A [`Session`] outlives any single request: it is attached to a connection
//! once the peer authenticates and is shared (as `Arc<Session>`) by every
//! tracked operation that arrives on that connection. Holders that need the
//! session beyond an operation's lifetime clone the `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};

use optrack_core::{Principal, Stamp};
use parking_lot::RwLock;

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Mutable authentication state of a session.
#[derive(Debug, Default)]
pub struct SessionAuth {
    pub authenticated: bool,
    pub principal: Option<Principal>,
}

/// State of an ongoing peer interaction.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    /// For internal peers, the remote node's name.
    pub peer_node_id: Option<String>,
    pub opened_at: Stamp,
    auth: RwLock<SessionAuth>,
}

impl Session {
    #[must_use]
    pub fn new(peer_node_id: Option<String>, opened_at: Stamp) -> Self {
        Self {
            id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)),
            peer_node_id,
            opened_at,
            auth: RwLock::new(SessionAuth::default()),
        }
    }

    /// Records a successful authentication.
    pub fn authenticate(&self, principal: Principal) {
        let mut auth = self.auth.write();
        auth.authenticated = true;
        auth.principal = Some(principal);
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.auth.read().authenticated
    }

    #[must_use]
    pub fn principal(&self) -> Option<Principal> {
        self.auth.read().principal.clone()
    }
}
