//! Registry of named sessions and the per-caller handles taken from them.

pub mod handle;
pub mod named;

use crate::connection::{ClusterStats, StoreConfig, Transport};
use crate::core::{ConsistencyMode, Result, SessionError};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

pub use handle::{HandleKind, SessionHandle};
pub use named::NamedSession;

/// Strong session: every operation runs on the primary.
pub const MASTER_SESSION: &str = "master";

/// Monotonic session: reads may use a secondary until the handle's first write.
pub const MONOTONIC_SESSION: &str = "monotonic";

const SESSIONS: [(&str, ConsistencyMode); 2] = [
    (MASTER_SESSION, ConsistencyMode::Strong),
    (MONOTONIC_SESSION, ConsistencyMode::Monotonic),
];

/// Where [`SessionManager::startup`] reads its configuration from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// `MGO_*` environment variables, read at each startup.
    Environment,
    /// `MGO_*` keys read from a fixed map instead of the process environment.
    Variables(BTreeMap<String, String>),
    Explicit(StoreConfig),
}

impl ConfigSource {
    /// A [`ConfigSource::Variables`] from `(key, value)` pairs.
    pub fn variables<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        ConfigSource::Variables(
            vars.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Started,
    Stopped,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Uninitialized => write!(f, "uninitialized"),
            ManagerState::Started => write!(f, "started"),
            ManagerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Owns the named sessions for the life of the process.
///
/// `startup` and `shutdown` need `&mut self`; handing out handles only needs
/// `&self`, so a started manager can be shared (for example behind an `Arc`)
/// by every request task.
///
/// # Examples
///
/// ```
/// use docsession::{MemoryReplicaSet, SessionManager, StoreConfig};
///
/// # #[tokio::main]
/// # async fn main() -> docsession::Result<()> {
/// let store = MemoryReplicaSet::new().with_primary("localhost:27017");
/// let config = StoreConfig::new("localhost", "gotraining");
/// let mut manager = SessionManager::with_config(store, config);
///
/// manager.startup("main").await?;
/// let mut handle = manager.copy_master_session("main")?;
/// manager.close_session("main", Some(&mut handle));
/// manager.shutdown("main")?;
/// # Ok(())
/// # }
/// ```
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    config_source: ConfigSource,
    state: ManagerState,
    sessions: HashMap<String, NamedSession>,
}

impl SessionManager {
    /// Manager configured from the environment at startup.
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::with_source(transport, ConfigSource::Environment)
    }

    pub fn with_config(transport: impl Transport + 'static, config: StoreConfig) -> Self {
        Self::with_source(transport, ConfigSource::Explicit(config))
    }

    pub fn with_source(transport: impl Transport + 'static, config_source: ConfigSource) -> Self {
        Self {
            transport: Arc::new(transport),
            config_source,
            state: ManagerState::Uninitialized,
            sessions: HashMap::new(),
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.state == ManagerState::Started
    }

    /// Registered session names, sorted.
    pub fn session_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sessions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn named_session(&self, name: &str) -> Option<&NamedSession> {
        self.sessions.get(name)
    }

    /// Dial and register the master and monotonic sessions.
    ///
    /// Does nothing if already started. If any dial fails, the sessions dialed
    /// so far are closed, the manager keeps its previous state, and the
    /// failure is returned.
    pub async fn startup(&mut self, caller_id: &str) -> Result<()> {
        let span = info_span!("session.startup", caller_id = %caller_id);
        async move {
            if self.is_started() {
                event!(Level::DEBUG, "already started");
                return Ok(());
            }
            event!(Level::DEBUG, state = %self.state, "started");

            let config = match self.resolve_config() {
                Ok(config) => config,
                Err(err) => {
                    event!(Level::ERROR, error = %err, "completed with error");
                    return Err(err);
                }
            };

            let mut sessions = HashMap::with_capacity(SESSIONS.len());
            for (name, mode) in SESSIONS {
                match NamedSession::dial(Arc::clone(&self.transport), name, mode, &config).await {
                    Ok(named) => {
                        sessions.insert(name.to_string(), named);
                    }
                    Err(err) => {
                        for dialed in sessions.values() {
                            if let Err(close_err) = dialed.close() {
                                event!(
                                    Level::WARN,
                                    session = %dialed.name(),
                                    error = %close_err,
                                    "failed to close session"
                                );
                            }
                        }
                        event!(Level::ERROR, error = %err, "completed with error");
                        return Err(err);
                    }
                }
            }

            self.sessions = sessions;
            self.state = ManagerState::Started;
            event!(
                Level::INFO,
                hosts = ?config.hosts,
                database = %config.database,
                "completed"
            );
            Ok(())
        }
        .instrument(span)
        .await
    }

    fn resolve_config(&self) -> Result<StoreConfig> {
        match &self.config_source {
            ConfigSource::Environment => StoreConfig::from_env().map_err(SessionError::Config),
            ConfigSource::Variables(vars) => {
                StoreConfig::from_lookup(|key| vars.get(key).cloned())
                    .map_err(SessionError::Config)
            }
            ConfigSource::Explicit(config) => {
                config.validate().map_err(SessionError::Config)?;
                Ok(config.clone())
            }
        }
    }

    /// Close every registered session and move to `Stopped`.
    ///
    /// Each session is closed even if another one fails; the first failure is
    /// logged, never returned. A manager that never started stays as it is.
    pub fn shutdown(&mut self, caller_id: &str) -> Result<()> {
        let span = info_span!("session.shutdown", caller_id = %caller_id);
        let _enter = span.enter();
        event!(Level::DEBUG, state = %self.state, "started");

        if self.state == ManagerState::Uninitialized {
            event!(Level::DEBUG, "never started");
            return Ok(());
        }

        for (name, named) in self.sessions.drain() {
            if let Err(err) = named.close() {
                event!(Level::WARN, session = %name, error = %err, "failed to close session");
            }
        }
        self.state = ManagerState::Stopped;

        event!(Level::INFO, "completed");
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<&NamedSession> {
        if !self.is_started() {
            return Err(SessionError::NotInitialized);
        }
        self.sessions
            .get(name)
            .ok_or_else(|| SessionError::NotFound(name.to_string()))
    }

    fn acquire(&self, caller_id: &str, name: &str, kind: HandleKind) -> Result<SessionHandle> {
        let span = info_span!(
            "session.acquire",
            caller_id = %caller_id,
            session = %name,
            kind = %kind
        );
        let _enter = span.enter();

        let named = match self.lookup(name) {
            Ok(named) => named,
            Err(err) => {
                event!(Level::ERROR, error = %err, "completed with error");
                return Err(err);
            }
        };

        let session = match kind {
            HandleKind::Copy => named.session().copy(),
            HandleKind::Clone => named.session().clone_dedicated(),
        };
        let handle = SessionHandle::new(name, kind, session);

        event!(Level::DEBUG, handle_id = %handle.id(), "completed");
        Ok(handle)
    }

    /// A handle sharing the named session's socket pool.
    pub fn copy_session(&self, caller_id: &str, name: &str) -> Result<SessionHandle> {
        self.acquire(caller_id, name, HandleKind::Copy)
    }

    /// A handle with its own socket, dialed outside the pool on first use.
    pub fn clone_session(&self, caller_id: &str, name: &str) -> Result<SessionHandle> {
        self.acquire(caller_id, name, HandleKind::Clone)
    }

    pub fn copy_master_session(&self, caller_id: &str) -> Result<SessionHandle> {
        self.copy_session(caller_id, MASTER_SESSION)
    }

    pub fn copy_monotonic_session(&self, caller_id: &str) -> Result<SessionHandle> {
        self.copy_session(caller_id, MONOTONIC_SESSION)
    }

    pub fn clone_master_session(&self, caller_id: &str) -> Result<SessionHandle> {
        self.clone_session(caller_id, MASTER_SESSION)
    }

    pub fn clone_monotonic_session(&self, caller_id: &str) -> Result<SessionHandle> {
        self.clone_session(caller_id, MONOTONIC_SESSION)
    }

    /// Release a handle. `None` and handles already released are ignored.
    pub fn close_session(&self, caller_id: &str, handle: Option<&mut SessionHandle>) {
        let Some(handle) = handle else {
            event!(Level::DEBUG, caller_id = %caller_id, "no session to close");
            return;
        };

        let span = info_span!(
            "session.close",
            caller_id = %caller_id,
            session = %handle.name(),
            handle_id = %handle.id()
        );
        let _enter = span.enter();

        if handle.close() {
            event!(Level::DEBUG, "completed");
        } else {
            event!(Level::DEBUG, "already closed");
        }
    }

    /// Pool statistics per registered session.
    pub fn stats(&self) -> BTreeMap<String, ClusterStats> {
        self.sessions
            .iter()
            .map(|(name, named)| (name.clone(), named.stats()))
            .collect()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        for (name, named) in &self.sessions {
            if let Err(err) = named.close() {
                event!(
                    Level::WARN,
                    session = %name,
                    error = %err,
                    "failed to close session on drop"
                );
            }
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("config_source", &self.config_source)
            .field("state", &self.state)
            .field("sessions", &self.session_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryReplicaSet;

    fn replica_set() -> MemoryReplicaSet {
        MemoryReplicaSet::new()
            .with_primary("p:27017")
            .with_secondary("s:27017")
    }

    fn manager(set: &MemoryReplicaSet) -> SessionManager {
        SessionManager::with_config(set.clone(), StoreConfig::new("p:27017,s:27017", "test"))
    }

    #[tokio::test]
    async fn test_startup_registers_both_sessions() {
        let set = replica_set();
        let mut manager = manager(&set);
        assert_eq!(manager.state(), ManagerState::Uninitialized);

        manager.startup("test").await.unwrap();
        assert_eq!(manager.state(), ManagerState::Started);
        assert_eq!(manager.session_names(), vec![MASTER_SESSION, MONOTONIC_SESSION]);
        assert_eq!(
            manager.named_session(MASTER_SESSION).unwrap().mode(),
            ConsistencyMode::Strong
        );
        assert_eq!(
            manager.named_session(MONOTONIC_SESSION).unwrap().mode(),
            ConsistencyMode::Monotonic
        );
    }

    #[tokio::test]
    async fn test_startup_is_idempotent() {
        let set = replica_set();
        let mut manager = manager(&set);

        manager.startup("test").await.unwrap();
        let opened = set.sockets_opened();
        manager.startup("test").await.unwrap();
        assert_eq!(set.sockets_opened(), opened);
    }

    #[tokio::test]
    async fn test_invalid_config_is_reported() {
        let set = replica_set();
        let mut manager = SessionManager::with_config(set, StoreConfig::new("", "test"));

        let err = manager.startup("test").await.unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
        assert_eq!(manager.state(), ManagerState::Uninitialized);
    }

    #[tokio::test]
    async fn test_restart_after_shutdown() {
        let set = replica_set();
        let mut manager = manager(&set);

        manager.startup("test").await.unwrap();
        manager.shutdown("test").unwrap();
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert!(manager.session_names().is_empty());
        assert_eq!(set.live_sockets(), 0);

        manager.startup("test").await.unwrap();
        assert!(manager.copy_master_session("test").is_ok());
    }

    #[tokio::test]
    async fn test_handle_kinds_and_modes() {
        let set = replica_set();
        let mut manager = manager(&set);
        manager.startup("test").await.unwrap();

        let copy = manager.copy_monotonic_session("test").unwrap();
        assert_eq!(copy.kind(), HandleKind::Copy);
        assert_eq!(copy.mode(), ConsistencyMode::Monotonic);
        assert_eq!(copy.name(), MONOTONIC_SESSION);

        let clone = manager.clone_master_session("test").unwrap();
        assert_eq!(clone.kind(), HandleKind::Clone);
        assert_eq!(clone.mode(), ConsistencyMode::Strong);
        assert!(clone.session().unwrap().is_dedicated());
        assert_ne!(copy.id(), clone.id());
    }

    #[tokio::test]
    async fn test_variables_source() {
        let set = replica_set();
        let source =
            ConfigSource::variables([("MGO_HOSTS", "p:27017,s:27017"), ("MGO_DATABASE", "test")]);
        let mut manager = SessionManager::with_source(set, source);

        manager.startup("test").await.unwrap();
        assert!(manager.is_started());
        let master = manager.named_session(MASTER_SESSION).unwrap();
        assert_eq!(master.dial_info().database, "test");

        let source = ConfigSource::variables([("MGO_HOSTS", "p:27017")]);
        let mut manager = SessionManager::with_source(replica_set(), source);
        let err = manager.startup("test").await.unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[tokio::test]
    async fn test_drop_closes_sessions() {
        let set = replica_set();
        let mut manager = manager(&set);
        manager.startup("test").await.unwrap();
        assert!(set.live_sockets() > 0);

        drop(manager);
        assert_eq!(set.live_sockets(), 0);
    }
}
