use crate::connection::{Cluster, ClusterStats, DialInfo, Safe, Session, StoreConfig, Transport};
use crate::core::{ConsistencyMode, Result, SessionError, StoreResult};
use std::sync::Arc;
use tracing::{Level, event};

/// A dialed cluster registered under a logical name, with the consistency
/// mode and write safety every handle taken from it inherits.
pub struct NamedSession {
    name: String,
    mode: ConsistencyMode,
    dial_info: DialInfo,
    safe: Option<Safe>,
    cluster: Arc<Cluster>,
    root: Session,
}

impl NamedSession {
    /// Dial `config`'s hosts and wrap the result as `name`.
    ///
    /// Writes through the session are always acknowledged.
    pub(crate) async fn dial(
        transport: Arc<dyn Transport>,
        name: &str,
        mode: ConsistencyMode,
        config: &StoreConfig,
    ) -> Result<Self> {
        let dial_info = config.dial_info();
        event!(
            Level::DEBUG,
            session = %name,
            mode = %mode,
            hosts = ?dial_info.addrs,
            database = %dial_info.database,
            "dialing session"
        );

        let cluster = Cluster::dial(transport, &dial_info)
            .await
            .map_err(|source| SessionError::Connection {
                session: name.to_string(),
                source,
            })?;
        let cluster = Arc::new(cluster);
        let safe = Some(Safe::default());

        Ok(Self {
            name: name.to_string(),
            mode,
            dial_info,
            safe,
            root: Session::new(Arc::clone(&cluster), mode, safe),
            cluster,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ConsistencyMode {
        self.mode
    }

    pub fn safe(&self) -> Option<Safe> {
        self.safe
    }

    pub fn dial_info(&self) -> &DialInfo {
        &self.dial_info
    }

    /// The live session handles are copied or cloned from.
    pub fn session(&self) -> &Session {
        &self.root
    }

    pub fn stats(&self) -> ClusterStats {
        self.cluster.stats()
    }

    /// Close the root session and every node pool behind it.
    pub(crate) fn close(&self) -> StoreResult<()> {
        self.root.close();
        self.cluster.close()
    }
}
