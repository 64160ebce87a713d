//! In-process replica set.
//!
//! Every node keeps its own copy of the data. Writes land on the primary and
//! are recorded in an oplog that secondaries apply either immediately or when
//! [`MemoryReplicaSet::replicate`] is called, which lets tests observe stale
//! secondary reads.

use super::{Command, Credentials, NodeRole, Reply, Socket, Transport, WriteConcern};
use crate::core::document::{ID_FIELD, apply_update, matches};
use crate::core::{Document, StoreError, StoreResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

type Databases = BTreeMap<String, BTreeMap<String, Vec<Document>>>;

/// Lowest cost bcrypt accepts; the hashes never leave the process.
const HASH_COST: u32 = 4;

#[derive(Debug, Clone)]
enum OplogEntry {
    Insert {
        database: String,
        collection: String,
        document: Document,
    },
    Replace {
        database: String,
        collection: String,
        document: Document,
    },
    Delete {
        database: String,
        collection: String,
        id: Value,
    },
}

impl OplogEntry {
    fn apply(&self, data: &mut Databases) {
        match self {
            OplogEntry::Insert {
                database,
                collection,
                document,
            } => {
                data.entry(database.clone())
                    .or_default()
                    .entry(collection.clone())
                    .or_default()
                    .push(document.clone());
            }
            OplogEntry::Replace {
                database,
                collection,
                document,
            } => {
                let docs = data
                    .entry(database.clone())
                    .or_default()
                    .entry(collection.clone())
                    .or_default();
                if let Some(slot) = docs
                    .iter_mut()
                    .find(|d| d.get(ID_FIELD) == document.get(ID_FIELD))
                {
                    *slot = document.clone();
                }
            }
            OplogEntry::Delete {
                database,
                collection,
                id,
            } => {
                if let Some(docs) = data.get_mut(database).and_then(|db| db.get_mut(collection)) {
                    docs.retain(|d| d.get(ID_FIELD) != Some(id));
                }
            }
        }
    }
}

struct MemoryNode {
    role: NodeRole,
    reachable: bool,
    data: Databases,
    /// Oplog entries applied so far (secondaries only).
    applied: usize,
}

impl MemoryNode {
    fn new(role: NodeRole) -> Self {
        Self {
            role,
            reachable: true,
            data: Databases::new(),
            applied: 0,
        }
    }

    fn collection(&self, database: &str, collection: &str) -> &[Document] {
        self.data
            .get(database)
            .and_then(|db| db.get(collection))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

struct ReplicaState {
    nodes: BTreeMap<String, MemoryNode>,
    oplog: Vec<OplogEntry>,
    /// username -> bcrypt hash
    users: HashMap<String, String>,
    auto_replicate: bool,
}

impl ReplicaState {
    fn node(&self, addr: &str) -> StoreResult<&MemoryNode> {
        self.nodes
            .get(addr)
            .filter(|node| node.reachable)
            .ok_or_else(|| StoreError::Unreachable(addr.to_string()))
    }

    fn catch_up(&mut self) {
        let oplog = &self.oplog;
        for node in self.nodes.values_mut() {
            if node.role == NodeRole::Secondary && node.reachable {
                for entry in &oplog[node.applied..] {
                    entry.apply(&mut node.data);
                }
                node.applied = oplog.len();
            }
        }
    }

    /// Apply a write on the primary at `addr` and log it.
    fn write(&mut self, addr: &str, entry: OplogEntry) -> StoreResult<()> {
        let node = self
            .nodes
            .get_mut(addr)
            .ok_or_else(|| StoreError::Unreachable(addr.to_string()))?;
        entry.apply(&mut node.data);
        self.oplog.push(entry);
        if self.auto_replicate {
            self.catch_up();
        }
        Ok(())
    }
}

struct Shared {
    state: Mutex<ReplicaState>,
    next_cursor: AtomicU64,
    sockets_opened: AtomicUsize,
    live_sockets: AtomicUsize,
    open_cursors: AtomicUsize,
}

/// An in-memory replica set implementing [`Transport`].
#[derive(Clone)]
pub struct MemoryReplicaSet {
    shared: Arc<Shared>,
}

impl Default for MemoryReplicaSet {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryReplicaSet {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ReplicaState {
                    nodes: BTreeMap::new(),
                    oplog: Vec::new(),
                    users: HashMap::new(),
                    auto_replicate: true,
                }),
                next_cursor: AtomicU64::new(1),
                sockets_opened: AtomicUsize::new(0),
                live_sockets: AtomicUsize::new(0),
                open_cursors: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_primary(self, addr: &str) -> Self {
        self.add_node(addr, NodeRole::Primary);
        self
    }

    pub fn with_secondary(self, addr: &str) -> Self {
        self.add_node(addr, NodeRole::Secondary);
        self
    }

    /// Require authentication as `username`.
    pub fn with_user(self, username: &str, password: &str) -> StoreResult<Self> {
        let hash = bcrypt::hash(password, HASH_COST)
            .map_err(|e| StoreError::Auth(format!("{}: {}", username, e)))?;
        self.shared
            .state
            .lock()?
            .users
            .insert(username.to_string(), hash);
        Ok(self)
    }

    /// Stop applying writes to secondaries until [`replicate`](Self::replicate) runs.
    pub fn with_replication_lag(self) -> Self {
        if let Ok(mut state) = self.shared.state.lock() {
            state.auto_replicate = false;
        }
        self
    }

    fn add_node(&self, addr: &str, role: NodeRole) {
        if let Ok(mut state) = self.shared.state.lock() {
            let mut node = MemoryNode::new(role);
            if role == NodeRole::Secondary {
                for entry in &state.oplog {
                    entry.apply(&mut node.data);
                }
                node.applied = state.oplog.len();
            }
            state.nodes.insert(addr.to_string(), node);
        }
    }

    /// Bring every reachable secondary up to date with the primary.
    pub fn replicate(&self) -> StoreResult<()> {
        self.shared.state.lock()?.catch_up();
        Ok(())
    }

    /// Mark a node as down or back up. Requests on existing sockets to a down
    /// node fail with [`StoreError::Unreachable`].
    pub fn set_reachable(&self, addr: &str, reachable: bool) -> StoreResult<()> {
        let mut state = self.shared.state.lock()?;
        let node = state
            .nodes
            .get_mut(addr)
            .ok_or_else(|| StoreError::Unreachable(addr.to_string()))?;
        node.reachable = reachable;
        Ok(())
    }

    /// Insert documents on the primary and replicate them everywhere,
    /// regardless of replication lag.
    pub fn seed(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> StoreResult<()> {
        let mut state = self.shared.state.lock()?;
        let primary = state
            .nodes
            .iter()
            .find(|(_, node)| node.role == NodeRole::Primary)
            .map(|(addr, _)| addr.clone())
            .ok_or(StoreError::NoReachableServers)?;
        for mut document in documents {
            document
                .entry(ID_FIELD)
                .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
            state.write(
                &primary,
                OplogEntry::Insert {
                    database: database.to_string(),
                    collection: collection.to_string(),
                    document,
                },
            )?;
        }
        state.catch_up();
        Ok(())
    }

    /// Documents currently stored on one node.
    pub fn documents_on(
        &self,
        addr: &str,
        database: &str,
        collection: &str,
    ) -> StoreResult<Vec<Document>> {
        let state = self.shared.state.lock()?;
        let node = state
            .nodes
            .get(addr)
            .ok_or_else(|| StoreError::Unreachable(addr.to_string()))?;
        Ok(node.collection(database, collection).to_vec())
    }

    /// Sockets ever opened against the set.
    pub fn sockets_opened(&self) -> usize {
        self.shared.sockets_opened.load(Ordering::SeqCst)
    }

    /// Sockets currently open.
    pub fn live_sockets(&self) -> usize {
        self.shared.live_sockets.load(Ordering::SeqCst)
    }

    /// Server-side cursors still holding documents, across every socket.
    pub fn open_cursors(&self) -> usize {
        self.shared.open_cursors.load(Ordering::SeqCst)
    }

    fn authenticate(state: &ReplicaState, credentials: Option<&Credentials>) -> StoreResult<()> {
        if state.users.is_empty() {
            return Ok(());
        }
        let credentials = credentials.ok_or_else(|| StoreError::Auth(String::new()))?;
        let verified = state
            .users
            .get(&credentials.username)
            .is_some_and(|hash| bcrypt::verify(&credentials.password, hash).unwrap_or(false));
        if verified {
            Ok(())
        } else {
            Err(StoreError::Auth(credentials.username.clone()))
        }
    }
}

#[async_trait]
impl Transport for MemoryReplicaSet {
    async fn connect(
        &self,
        addr: &str,
        credentials: Option<&Credentials>,
    ) -> StoreResult<Box<dyn Socket>> {
        {
            let state = self.shared.state.lock()?;
            state.node(addr)?;
            Self::authenticate(&state, credentials)?;
        }

        self.shared.sockets_opened.fetch_add(1, Ordering::SeqCst);
        self.shared.live_sockets.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemorySocket {
            shared: Arc::clone(&self.shared),
            addr: addr.to_string(),
            cursors: HashMap::new(),
        }))
    }
}

struct MemorySocket {
    shared: Arc<Shared>,
    addr: String,
    /// Server-side cursors opened on this socket.
    cursors: HashMap<u64, VecDeque<Document>>,
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        // Cursors die with their connection.
        self.shared
            .open_cursors
            .fetch_sub(self.cursors.len(), Ordering::SeqCst);
        self.shared.live_sockets.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemorySocket {
    fn open_cursor(&mut self, mut documents: Vec<Document>, batch_size: Option<usize>) -> Reply {
        match batch_size {
            Some(size) if size < documents.len() => {
                let rest: VecDeque<Document> = documents.split_off(size).into();
                let cursor_id = self.shared.next_cursor.fetch_add(1, Ordering::SeqCst);
                self.cursors.insert(cursor_id, rest);
                self.shared.open_cursors.fetch_add(1, Ordering::SeqCst);
                Reply::Batch {
                    documents,
                    cursor_id,
                }
            }
            _ => Reply::Batch {
                documents,
                cursor_id: 0,
            },
        }
    }

    fn get_more(&mut self, cursor_id: u64, batch_size: usize) -> StoreResult<Reply> {
        let remaining = self
            .cursors
            .get_mut(&cursor_id)
            .ok_or(StoreError::CursorNotFound(cursor_id))?;
        let take = batch_size.max(1).min(remaining.len());
        let documents: Vec<Document> = remaining.drain(..take).collect();
        let cursor_id = if remaining.is_empty() {
            self.kill_cursor(cursor_id);
            0
        } else {
            cursor_id
        };
        Ok(Reply::Batch {
            documents,
            cursor_id,
        })
    }

    fn kill_cursor(&mut self, cursor_id: u64) {
        if self.cursors.remove(&cursor_id).is_some() {
            self.shared.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn write(&self, state: &mut ReplicaState, command: Command) -> StoreResult<Reply> {
        if state.node(&self.addr)?.role != NodeRole::Primary {
            return Err(StoreError::NotPrimary(self.addr.clone()));
        }

        match command {
            Command::Insert {
                database,
                collection,
                documents,
                ..
            } => {
                for mut document in documents {
                    let id = document
                        .entry(ID_FIELD)
                        .or_insert_with(|| Value::String(Uuid::new_v4().to_string()))
                        .clone();
                    let exists = state
                        .node(&self.addr)?
                        .collection(&database, &collection)
                        .iter()
                        .any(|d| d.get(ID_FIELD) == Some(&id));
                    if exists {
                        return Err(StoreError::DuplicateKey(id.to_string()));
                    }
                    state.write(
                        &self.addr,
                        OplogEntry::Insert {
                            database: database.clone(),
                            collection: collection.clone(),
                            document,
                        },
                    )?;
                }
                Ok(Reply::Ok)
            }
            Command::Update {
                database,
                collection,
                selector,
                update,
                upsert,
                multi,
                ..
            } => {
                let targets: Vec<Document> = state
                    .node(&self.addr)?
                    .collection(&database, &collection)
                    .iter()
                    .filter(|d| matches(d, &selector))
                    .take(if multi { usize::MAX } else { 1 })
                    .cloned()
                    .collect();

                if targets.is_empty() && upsert {
                    let base: Document = selector
                        .iter()
                        .filter(|(k, v)| !k.starts_with('$') && !v.is_object())
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    let mut document = apply_update(&base, &update)?;
                    let id = document
                        .entry(ID_FIELD)
                        .or_insert_with(|| Value::String(Uuid::new_v4().to_string()))
                        .clone();
                    state.write(
                        &self.addr,
                        OplogEntry::Insert {
                            database,
                            collection,
                            document,
                        },
                    )?;
                    return Ok(Reply::Written {
                        matched: 0,
                        modified: 0,
                        upserted_id: Some(id),
                    });
                }

                let matched = targets.len() as u64;
                let mut modified = 0;
                for target in targets {
                    let document = apply_update(&target, &update)?;
                    if document != target {
                        modified += 1;
                    }
                    state.write(
                        &self.addr,
                        OplogEntry::Replace {
                            database: database.clone(),
                            collection: collection.clone(),
                            document,
                        },
                    )?;
                }
                Ok(Reply::Written {
                    matched,
                    modified,
                    upserted_id: None,
                })
            }
            Command::Remove {
                database,
                collection,
                selector,
                multi,
                ..
            } => {
                let ids: Vec<Value> = state
                    .node(&self.addr)?
                    .collection(&database, &collection)
                    .iter()
                    .filter(|d| matches(d, &selector))
                    .take(if multi { usize::MAX } else { 1 })
                    .filter_map(|d| d.get(ID_FIELD).cloned())
                    .collect();
                let removed = ids.len() as u64;
                for id in ids {
                    state.write(
                        &self.addr,
                        OplogEntry::Delete {
                            database: database.clone(),
                            collection: collection.clone(),
                            id,
                        },
                    )?;
                }
                Ok(Reply::Written {
                    matched: removed,
                    modified: removed,
                    upserted_id: None,
                })
            }
            other => Err(StoreError::InvalidDocument(format!(
                "not a write command: {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl Socket for MemorySocket {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn hello(&mut self) -> StoreResult<NodeRole> {
        let state = self.shared.state.lock()?;
        Ok(state.node(&self.addr)?.role)
    }

    async fn run(&mut self, command: Command) -> StoreResult<Reply> {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock()?;

        match command {
            Command::Ping => {
                state.node(&self.addr)?;
                Ok(Reply::Ok)
            }
            Command::Find {
                database,
                collection,
                filter,
                limit,
                batch_size,
            } => {
                let documents: Vec<Document> = state
                    .node(&self.addr)?
                    .collection(&database, &collection)
                    .iter()
                    .filter(|d| matches(d, &filter))
                    .take(limit.unwrap_or(usize::MAX))
                    .cloned()
                    .collect();
                Ok(self.open_cursor(documents, batch_size))
            }
            Command::GetMore {
                cursor_id,
                batch_size,
            } => {
                state.node(&self.addr)?;
                self.get_more(cursor_id, batch_size)
            }
            Command::KillCursor { cursor_id } => {
                self.kill_cursor(cursor_id);
                Ok(Reply::Ok)
            }
            Command::Count {
                database,
                collection,
                filter,
            } => {
                let count = state
                    .node(&self.addr)?
                    .collection(&database, &collection)
                    .iter()
                    .filter(|d| matches(d, &filter))
                    .count();
                Ok(Reply::Count(count as u64))
            }
            Command::CollectionNames { database } => {
                let names = state
                    .node(&self.addr)?
                    .data
                    .get(&database)
                    .map(|db| db.keys().cloned().collect())
                    .unwrap_or_default();
                Ok(Reply::Names(names))
            }
            write => {
                let concern = match &write {
                    Command::Insert { concern, .. }
                    | Command::Update { concern, .. }
                    | Command::Remove { concern, .. } => *concern,
                    _ => WriteConcern::Unacknowledged,
                };
                let outcome = self.write(&mut state, write);
                match concern {
                    WriteConcern::Acknowledged { .. } => outcome,
                    WriteConcern::Unacknowledged => {
                        // A dead node still breaks the socket.
                        if let Err(StoreError::Unreachable(addr)) = outcome {
                            return Err(StoreError::Unreachable(addr));
                        }
                        Ok(Reply::Unacknowledged)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    const ACK: WriteConcern = WriteConcern::Acknowledged {
        w: 1,
        journal: false,
    };

    fn insert(docs: Vec<Document>) -> Command {
        Command::Insert {
            database: "test".into(),
            collection: "stations".into(),
            documents: docs,
            concern: ACK,
        }
    }

    fn find(filter: Document, batch_size: Option<usize>) -> Command {
        Command::Find {
            database: "test".into(),
            collection: "stations".into(),
            filter,
            limit: None,
            batch_size,
        }
    }

    #[tokio::test]
    async fn test_writes_require_primary() {
        let set = MemoryReplicaSet::new()
            .with_primary("p:27017")
            .with_secondary("s:27017");
        let mut secondary = set.connect("s:27017", None).await.unwrap();

        assert_eq!(secondary.hello().await.unwrap(), NodeRole::Secondary);
        let result = secondary.run(insert(vec![doc(json!({"a": 1}))])).await;
        assert!(matches!(result, Err(StoreError::NotPrimary(_))));
    }

    #[tokio::test]
    async fn test_replication_lag() {
        let set = MemoryReplicaSet::new()
            .with_primary("p:27017")
            .with_secondary("s:27017")
            .with_replication_lag();
        let mut primary = set.connect("p:27017", None).await.unwrap();

        primary.run(insert(vec![doc(json!({"_id": 1}))])).await.unwrap();
        assert_eq!(set.documents_on("s:27017", "test", "stations").unwrap().len(), 0);

        set.replicate().unwrap();
        assert_eq!(set.documents_on("s:27017", "test", "stations").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_only_reported_when_acknowledged() {
        let set = MemoryReplicaSet::new().with_primary("p:27017");
        let mut socket = set.connect("p:27017", None).await.unwrap();

        socket.run(insert(vec![doc(json!({"_id": "x"}))])).await.unwrap();
        let dup = socket.run(insert(vec![doc(json!({"_id": "x"}))])).await;
        assert!(matches!(dup, Err(StoreError::DuplicateKey(_))));

        let silent = socket
            .run(Command::Insert {
                database: "test".into(),
                collection: "stations".into(),
                documents: vec![doc(json!({"_id": "x"}))],
                concern: WriteConcern::Unacknowledged,
            })
            .await;
        assert_eq!(silent, Ok(Reply::Unacknowledged));
    }

    #[tokio::test]
    async fn test_cursor_lives_on_its_socket() {
        let set = MemoryReplicaSet::new().with_primary("p:27017");
        set.seed(
            "test",
            "stations",
            (0..5).map(|i| doc(json!({"n": i}))).collect(),
        )
        .unwrap();

        let mut owner = set.connect("p:27017", None).await.unwrap();
        let mut other = set.connect("p:27017", None).await.unwrap();

        let Reply::Batch { documents, cursor_id } =
            owner.run(find(Document::new(), Some(2))).await.unwrap()
        else {
            panic!("expected a batch");
        };
        assert_eq!(documents.len(), 2);
        assert_ne!(cursor_id, 0);

        let foreign = other
            .run(Command::GetMore {
                cursor_id,
                batch_size: 2,
            })
            .await;
        assert_eq!(foreign, Err(StoreError::CursorNotFound(cursor_id)));

        let Reply::Batch { documents, cursor_id: next } = owner
            .run(Command::GetMore {
                cursor_id,
                batch_size: 10,
            })
            .await
            .unwrap()
        else {
            panic!("expected a batch");
        };
        assert_eq!(documents.len(), 3);
        assert_eq!(next, 0);
        assert_eq!(set.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_cursors_die_with_socket() {
        let set = MemoryReplicaSet::new().with_primary("p:27017");
        set.seed("test", "stations", (0..5).map(|i| doc(json!({"n": i}))).collect())
            .unwrap();
        let mut socket = set.connect("p:27017", None).await.unwrap();

        socket.run(find(Document::new(), Some(1))).await.unwrap();
        let Reply::Batch { cursor_id, .. } =
            socket.run(find(Document::new(), Some(1))).await.unwrap()
        else {
            panic!("expected a batch");
        };
        assert_eq!(set.open_cursors(), 2);

        socket.run(Command::KillCursor { cursor_id }).await.unwrap();
        assert_eq!(set.open_cursors(), 1);

        drop(socket);
        assert_eq!(set.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_upsert_builds_from_selector() {
        let set = MemoryReplicaSet::new().with_primary("p:27017");
        let mut socket = set.connect("p:27017", None).await.unwrap();

        let reply = socket
            .run(Command::Update {
                database: "test".into(),
                collection: "stations".into(),
                selector: doc(json!({"station_id": "42002"})),
                update: doc(json!({"$set": {"name": "West Gulf"}})),
                upsert: true,
                multi: false,
                concern: ACK,
            })
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Written { upserted_id: Some(_), .. }));

        let stored = set.documents_on("p:27017", "test", "stations").unwrap();
        assert_eq!(stored[0]["station_id"], json!("42002"));
        assert_eq!(stored[0]["name"], json!("West Gulf"));
    }

    #[tokio::test]
    async fn test_authentication() {
        let set = MemoryReplicaSet::new()
            .with_primary("p:27017")
            .with_user("app", "secret")
            .unwrap();

        let good = Credentials {
            username: "app".into(),
            password: "secret".into(),
            source: "test".into(),
        };
        let bad = Credentials {
            password: "wrong".into(),
            ..good.clone()
        };

        assert!(set.connect("p:27017", Some(&good)).await.is_ok());
        assert!(matches!(
            set.connect("p:27017", Some(&bad)).await,
            Err(StoreError::Auth(_))
        ));
        assert!(matches!(
            set.connect("p:27017", None).await,
            Err(StoreError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_node_breaks_sockets() {
        let set = MemoryReplicaSet::new().with_primary("p:27017");
        let mut socket = set.connect("p:27017", None).await.unwrap();

        set.set_reachable("p:27017", false).unwrap();
        assert!(matches!(socket.run(Command::Ping).await, Err(StoreError::Unreachable(_))));
        assert!(set.connect("p:27017", None).await.is_err());

        drop(socket);
        assert_eq!(set.live_sockets(), 0);
    }
}
