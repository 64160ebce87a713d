//! Run an operation against a collection resolved from a session handle.

use crate::connection::Collection;
use crate::core::{SessionError, StoreError, StoreResult};
use crate::manager::SessionHandle;
use std::fmt::Display;
use std::future::Future;
use tracing::{Instrument, Level, event, info_span};

/// An operation to run against one collection.
///
/// Implemented for every `FnOnce(Collection) -> impl Future<Output = Result<T, E>>`,
/// so an `async` closure or a function pointer can be passed directly; a
/// struct can implement it to carry its own parameters.
pub trait DbAction<T, E> {
    fn run(self, collection: Collection) -> impl Future<Output = Result<T, E>> + Send;
}

impl<F, Fut, T, E> DbAction<T, E> for F
where
    F: FnOnce(Collection) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send,
{
    fn run(self, collection: Collection) -> impl Future<Output = Result<T, E>> + Send {
        self(collection)
    }
}

/// Resolve `database.collection` on `handle` and run `action` against it.
///
/// A handle that is closed, or names that do not resolve, fail with
/// [`SessionError::Resolution`] converted into `E` before the action runs.
/// Whatever the action returns is passed through unchanged.
///
/// # Examples
///
/// ```
/// use docsession::{
///     Collection, MemoryReplicaSet, OptionalExt, SessionError, SessionManager, StoreConfig,
///     execute,
/// };
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), SessionError> {
/// let store = MemoryReplicaSet::new().with_primary("localhost:27017");
/// let config = StoreConfig::new("localhost", "gotraining");
/// let mut manager = SessionManager::with_config(store, config);
/// manager.startup("main").await?;
///
/// let handle = manager.copy_master_session("main")?;
/// let find = |stations: Collection| async move {
///     let filter = json!({"station_id": "42002"}).as_object().cloned().unwrap_or_default();
///     Ok::<_, SessionError>(stations.find_one(filter).await.optional()?)
/// };
/// let station = execute("main", &handle, "gotraining", "buoy_stations", find).await?;
/// assert!(station.is_none());
/// # Ok(())
/// # }
/// ```
pub async fn execute<T, E, A>(
    caller_id: &str,
    handle: &SessionHandle,
    database: &str,
    collection: &str,
    action: A,
) -> Result<T, E>
where
    A: DbAction<T, E>,
    E: From<SessionError> + Display,
{
    let span = info_span!(
        "session.execute",
        caller_id = %caller_id,
        session = %handle.name(),
        handle_id = %handle.id(),
        database = %database,
        collection = %collection
    );

    async move {
        event!(Level::DEBUG, "started");

        let collection = match handle.collection(database, collection) {
            Ok(collection) => collection,
            Err(err) => {
                event!(Level::ERROR, error = %err, "completed with error");
                return Err(E::from(err));
            }
        };

        match action.run(collection).await {
            Ok(value) => {
                event!(Level::DEBUG, "completed");
                Ok(value)
            }
            Err(err) => {
                event!(Level::ERROR, error = %err, "completed with error");
                Err(err)
            }
        }
    }
    .instrument(span)
    .await
}

/// Turn the store's not-found sentinel into `Ok(None)`.
///
/// Lookups that treat a missing document as an empty result opt in at the
/// call site: `collection.find_one(filter).await.optional()?`.
pub trait OptionalExt<T> {
    type Error;

    fn optional(self) -> Result<Option<T>, Self::Error>;
}

impl<T> OptionalExt<T> for StoreResult<T> {
    type Error = StoreError;

    fn optional(self) -> Result<Option<T>, StoreError> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(StoreError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl<T> OptionalExt<T> for Result<T, SessionError> {
    type Error = SessionError;

    fn optional(self) -> Result<Option<T>, SessionError> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}
