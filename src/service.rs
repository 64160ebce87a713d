//! Per-request database scope for service code.

use crate::core::{Result, SessionError};
use crate::executor::{DbAction, execute};
use crate::manager::{SessionHandle, SessionManager};
use std::fmt::Display;
use tracing::{Level, event};

/// A monotonic session handle held for the duration of one request.
///
/// ```
/// use docsession::{MemoryReplicaSet, ServiceScope, SessionError, SessionManager, StoreConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), SessionError> {
/// # let store = MemoryReplicaSet::new().with_primary("localhost:27017");
/// # let config = StoreConfig::new("localhost", "gotraining");
/// # let mut manager = SessionManager::with_config(store, config);
/// # manager.startup("main").await?;
/// let mut scope = ServiceScope::prepare(&manager, "request-1")?;
/// let total = scope
///     .db_action("gotraining", "buoy_stations", |stations: docsession::Collection| async move {
///         Ok::<_, SessionError>(stations.count(Default::default()).await?)
///     })
///     .await?;
/// assert_eq!(total, 0);
/// scope.finish();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ServiceScope {
    caller_id: String,
    handle: Option<SessionHandle>,
}

impl ServiceScope {
    /// Copy the monotonic session for `caller_id`.
    pub fn prepare(manager: &SessionManager, caller_id: impl Into<String>) -> Result<Self> {
        let caller_id = caller_id.into();
        let handle = manager.copy_monotonic_session(&caller_id)?;
        Ok(Self {
            caller_id,
            handle: Some(handle),
        })
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    pub fn handle(&self) -> Option<&SessionHandle> {
        self.handle.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_none()
    }

    /// Run `action` against `database.collection` on the scope's handle.
    pub async fn db_action<T, E, A>(
        &self,
        database: &str,
        collection: &str,
        action: A,
    ) -> std::result::Result<T, E>
    where
        A: DbAction<T, E>,
        E: From<SessionError> + Display,
    {
        let handle = self.handle.as_ref().ok_or_else(|| {
            E::from(SessionError::Resolution {
                database: database.to_string(),
                collection: collection.to_string(),
                reason: "service scope is finished".to_string(),
            })
        })?;
        execute(&self.caller_id, handle, database, collection, action).await
    }

    /// Release the handle. Later calls do nothing; dropping the scope has the same effect.
    pub fn finish(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
            event!(
                Level::DEBUG,
                caller_id = %self.caller_id,
                handle_id = %handle.id(),
                "service scope finished"
            );
        }
    }
}
