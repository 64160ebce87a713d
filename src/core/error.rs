use thiserror::Error;

/// Errors reported by the document store client.
///
/// `NotFound` is the typed sentinel for "no document matched"; callers that want
/// an empty result instead of a failure compare against it (see
/// [`crate::executor::OptionalExt`]) rather than inspecting message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("no reachable servers")]
    NoReachableServers,

    #[error("server '{0}' is unreachable")]
    Unreachable(String),

    #[error("authentication failed for user '{0}'")]
    Auth(String),

    #[error("server '{0}' is not the primary")]
    NotPrimary(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("session already closed")]
    SessionClosed,

    #[error("cursor {0} not found")]
    CursorNotFound(u64),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("timed out waiting for a socket to '{0}'")]
    PoolTimeout(String),

    #[error("lock error: {0}")]
    Lock(String),
}

/// Errors surfaced by the session manager and the executor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error for session '{session}': {source}")]
    Connection {
        session: String,
        #[source]
        source: StoreError,
    },

    #[error("session manager is not initialized")]
    NotInitialized,

    #[error("unable to locate session '{0}'")]
    NotFound(String),

    #[error("unable to resolve collection '{database}.{collection}': {reason}")]
    Resolution {
        database: String,
        collection: String,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    /// True when the error is the store's "no matching document" sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SessionError::Store(StoreError::NotFound))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidDocument(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_sentinel() {
        assert!(SessionError::from(StoreError::NotFound).is_not_found());
        assert!(!SessionError::NotFound("master".into()).is_not_found());
        assert!(!SessionError::Store(StoreError::SessionClosed).is_not_found());
    }

    #[test]
    fn test_connection_error_message() {
        let err = SessionError::Connection {
            session: "master".into(),
            source: StoreError::NoReachableServers,
        };
        assert_eq!(
            err.to_string(),
            "connection error for session 'master': no reachable servers"
        );
    }
}
