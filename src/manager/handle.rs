use crate::connection::{Collection, Session};
use crate::core::{ConsistencyMode, Result, SessionError};
use std::fmt;
use uuid::Uuid;

/// How a handle was derived from its named session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Shares the named session's socket pool.
    Copy,
    /// Owns a socket dialed for it alone.
    Clone,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Copy => write!(f, "copy"),
            HandleKind::Clone => write!(f, "clone"),
        }
    }
}

/// A caller-scoped session for one unit of work.
///
/// Release it with [`SessionManager::close_session`](super::SessionManager::close_session)
/// or [`close`](SessionHandle::close); a handle dropped while still open is
/// released at that point.
pub struct SessionHandle {
    id: Uuid,
    name: String,
    kind: HandleKind,
    mode: ConsistencyMode,
    session: Option<Session>,
}

impl SessionHandle {
    pub(crate) fn new(name: &str, kind: HandleKind, session: Session) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind,
            mode: session.mode(),
            session: Some(session),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name of the session this handle came from.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn mode(&self) -> ConsistencyMode {
        self.mode
    }

    /// The underlying session, until the handle is closed.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Closed by the caller, or its named session was shut down.
    pub fn is_closed(&self) -> bool {
        self.session.as_ref().is_none_or(Session::is_closed)
    }

    /// Resolve `database.collection` on this handle's session.
    pub fn collection(&self, database: &str, collection: &str) -> Result<Collection> {
        let resolution = |reason: String| SessionError::Resolution {
            database: database.to_string(),
            collection: collection.to_string(),
            reason,
        };

        let session = self
            .session
            .as_ref()
            .filter(|session| !session.is_closed())
            .ok_or_else(|| resolution("session handle is closed".to_string()))?;

        session
            .db(database)
            .and_then(|db| db.collection(collection))
            .map_err(|err| resolution(err.to_string()))
    }

    /// Release the handle's socket. Returns false if it was already released.
    pub fn close(&mut self) -> bool {
        match self.session.take() {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}
