// ============================================================================
// docsession: named session pools over a replicated document store
// ============================================================================
//
// A `SessionManager` dials one pool per named session ("master" for strong
// reads, "monotonic" for secondary reads until the first write), hands out
// per-caller copies or clones of those sessions, and `execute` runs an
// operation against a collection resolved from a handle.

pub mod connection;
pub mod core;
pub mod executor;
pub mod logging;
pub mod manager;
pub mod service;

// Re-export main types for convenience
pub use crate::core::{ConsistencyMode, Document, Result, SessionError, StoreError, StoreResult};
pub use crate::core::{from_document, query_to_string, to_document};

// Re-export store client API
pub use connection::{
    Cluster, ClusterStats, Collection, Cursor, Database, MemoryReplicaSet, PoolStats, Safe,
    Session, StoreConfig, Transport,
};

// Re-export manager API
pub use executor::{DbAction, OptionalExt, execute};
pub use manager::{
    ConfigSource, HandleKind, MASTER_SESSION, MONOTONIC_SESSION, ManagerState, NamedSession,
    SessionHandle, SessionManager,
};
pub use service::ServiceScope;
