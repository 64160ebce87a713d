//! Client side of the replicated document store.
//!
//! A [`Cluster`] is the dialed set of nodes behind one named session, a
//! [`Session`] reserves sockets from it according to its consistency mode, and
//! [`Collection`] issues commands over the session's reserved socket. The wire
//! itself sits behind the [`Transport`] / [`Socket`] traits.

pub mod cluster;
pub mod collection;
pub mod config;
pub mod memory;
pub mod pool;
pub mod session;

use crate::core::{Document, StoreResult};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

pub use cluster::{Cluster, ClusterStats};
pub use collection::{Collection, Cursor, Database};
pub use config::StoreConfig;
pub use memory::MemoryReplicaSet;
pub use pool::{PoolStats, SocketPool};
pub use session::{Safe, Session};

/// Role a node reports during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Primary,
    Secondary,
}

/// Login material sent on every new socket.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Database the user is defined in.
    pub source: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("source", &self.source)
            .finish()
    }
}

/// Everything needed to dial one cluster.
#[derive(Debug, Clone)]
pub struct DialInfo {
    pub addrs: Vec<String>,
    pub timeout: Duration,
    pub database: String,
    pub credentials: Option<Credentials>,
    pub max_pool_size: usize,
    pub max_idle_time: Option<Duration>,
}

/// Acknowledgment requested for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteConcern {
    /// Fire and forget: the server result is discarded.
    Unacknowledged,
    /// The server confirms the write (and reports its errors) before replying.
    Acknowledged { w: u32, journal: bool },
}

/// A request sent over a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Find {
        database: String,
        collection: String,
        filter: Document,
        limit: Option<usize>,
        /// `None` returns every match in the first batch.
        batch_size: Option<usize>,
    },
    GetMore {
        cursor_id: u64,
        batch_size: usize,
    },
    KillCursor {
        cursor_id: u64,
    },
    Insert {
        database: String,
        collection: String,
        documents: Vec<Document>,
        concern: WriteConcern,
    },
    Update {
        database: String,
        collection: String,
        selector: Document,
        update: Document,
        upsert: bool,
        multi: bool,
        concern: WriteConcern,
    },
    Remove {
        database: String,
        collection: String,
        selector: Document,
        multi: bool,
        concern: WriteConcern,
    },
    Count {
        database: String,
        collection: String,
        filter: Document,
    },
    CollectionNames {
        database: String,
    },
}

impl Command {
    /// Writes must be served by the primary.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::Insert { .. } | Command::Update { .. } | Command::Remove { .. }
        )
    }
}

/// A server reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    /// A batch of documents; `cursor_id == 0` means the cursor is exhausted.
    Batch {
        documents: Vec<Document>,
        cursor_id: u64,
    },
    Written {
        matched: u64,
        modified: u64,
        upserted_id: Option<Value>,
    },
    Count(u64),
    Names(Vec<String>),
    Unacknowledged,
}

/// An authenticated connection to one node.
///
/// A socket serves one request at a time; server-side cursors live on the
/// socket that opened them.
#[async_trait]
pub trait Socket: Send {
    fn addr(&self) -> &str;

    /// Handshake; reports the node's current role.
    async fn hello(&mut self) -> StoreResult<NodeRole>;

    async fn run(&mut self, command: Command) -> StoreResult<Reply>;
}

/// Opens sockets to store nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        addr: &str,
        credentials: Option<&Credentials>,
    ) -> StoreResult<Box<dyn Socket>>;
}
