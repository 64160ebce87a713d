use super::pool::{PoolStats, SocketPool, connect_with_timeout};
use super::{Command, DialInfo, NodeRole, Reply, Socket, Transport};
use crate::core::{StoreError, StoreResult};
use std::collections::HashSet;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Node preference for a socket reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Primary,
    /// A secondary if one is reachable, otherwise the primary.
    PreferSecondary,
}

/// The dialed nodes behind one named session, one socket pool per node.
pub struct Cluster {
    nodes: Vec<Arc<SocketPool>>,
    /// Live sockets dialed outside the pools
    dedicated: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl Cluster {
    /// Connect to every seed address, learn each node's role, and keep the
    /// handshake sockets as the first pooled socket of each node.
    ///
    /// Fails unless a primary answered within the dial timeout.
    pub async fn dial(transport: Arc<dyn Transport>, info: &DialInfo) -> StoreResult<Self> {
        let mut seen = HashSet::new();
        let addrs: Vec<String> = info
            .addrs
            .iter()
            .filter(|addr| seen.insert(addr.as_str()))
            .cloned()
            .collect();

        let mut nodes: Vec<Arc<SocketPool>> = Vec::with_capacity(addrs.len());
        let mut auth_failure = None;

        for addr in addrs {
            let mut socket = match connect_with_timeout(
                transport.as_ref(),
                &addr,
                info.credentials.as_ref(),
                info.timeout,
            )
            .await
            {
                Ok(socket) => socket,
                Err(err @ StoreError::Auth(_)) => {
                    warn!(addr = %addr, error = %err, "authentication rejected");
                    auth_failure = Some(err);
                    continue;
                }
                Err(err) => {
                    debug!(addr = %addr, error = %err, "seed unreachable");
                    continue;
                }
            };

            let role = match tokio::time::timeout(info.timeout, socket.hello()).await {
                Ok(Ok(role)) => role,
                Ok(Err(err)) => {
                    debug!(addr = %addr, error = %err, "handshake failed");
                    continue;
                }
                Err(_) => {
                    debug!(addr = %addr, "handshake timed out");
                    continue;
                }
            };

            debug!(addr = %addr, role = ?role, "seed connected");
            let pool = SocketPool::new(
                addr,
                role,
                Arc::clone(&transport),
                info.credentials.clone(),
                info.timeout,
                info.max_pool_size,
                info.max_idle_time,
            );
            pool.seed(socket)?;
            nodes.push(Arc::new(pool));
        }

        if !nodes.iter().any(|node| node.role() == NodeRole::Primary) {
            for node in &nodes {
                if let Err(err) = node.close() {
                    warn!(addr = %node.addr(), error = %err, "failed to close node pool");
                }
            }
            return Err(auth_failure.unwrap_or(StoreError::NoReachableServers));
        }

        Ok(Self {
            nodes,
            dedicated: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn primary(&self) -> StoreResult<&Arc<SocketPool>> {
        self.nodes
            .iter()
            .find(|node| node.role() == NodeRole::Primary)
            .ok_or(StoreError::NoReachableServers)
    }

    /// The least busy secondary.
    fn secondary(&self) -> Option<&Arc<SocketPool>> {
        self.nodes
            .iter()
            .filter(|node| node.role() == NodeRole::Secondary)
            .min_by_key(|node| node.stats().in_use_sockets)
    }

    /// Reserve a socket on a node matching `target`. Dedicated sockets are
    /// dialed fresh and never enter a pool.
    pub(crate) async fn reserve(
        &self,
        target: Target,
        dedicated: bool,
    ) -> StoreResult<ReservedSocket> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::SessionClosed);
        }

        if target == Target::PreferSecondary {
            if let Some(pool) = self.secondary() {
                match self.reserve_on(pool, dedicated).await {
                    Ok(reserved) => return Ok(reserved),
                    Err(err) => {
                        debug!(
                            addr = %pool.addr(),
                            error = %err,
                            "secondary unavailable, using primary"
                        );
                    }
                }
            }
        }

        let primary = self.primary()?;
        self.reserve_on(primary, dedicated).await
    }

    async fn reserve_on(
        &self,
        pool: &Arc<SocketPool>,
        dedicated: bool,
    ) -> StoreResult<ReservedSocket> {
        if dedicated {
            let socket = pool.dial_dedicated().await?;
            self.dedicated.fetch_add(1, Ordering::SeqCst);
            Ok(ReservedSocket {
                socket: Some(socket),
                pool: Arc::clone(pool),
                dedicated: Some(Arc::clone(&self.dedicated)),
                open_cursors: HashSet::new(),
            })
        } else {
            let socket = pool.acquire().await?;
            Ok(ReservedSocket {
                socket: Some(socket),
                pool: Arc::clone(pool),
                dedicated: None,
                open_cursors: HashSet::new(),
            })
        }
    }

    /// Close every node pool. Each pool is closed even if another one fails;
    /// the first failure is reported.
    pub fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let mut first_error = None;
        for node in &self.nodes {
            if let Err(err) = node.close() {
                warn!(addr = %node.addr(), error = %err, "failed to close node pool");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ClusterStats {
        ClusterStats {
            pools: self.nodes.iter().map(|node| node.stats()).collect(),
            dedicated_sockets: self.dedicated.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterStats {
    pub pools: Vec<PoolStats>,
    pub dedicated_sockets: usize,
}

impl ClusterStats {
    pub fn pooled_in_use(&self) -> usize {
        self.pools.iter().map(|p| p.in_use_sockets).sum()
    }

    pub fn pooled_total(&self) -> usize {
        self.pools.iter().map(|p| p.total_sockets).sum()
    }
}

/// A socket held by one session.
///
/// Dropping it hands a pooled socket back to its pool and disconnects a
/// dedicated one. Server cursors still open on a pooled socket go back with
/// it and are killed before the next reservation uses it.
pub(crate) struct ReservedSocket {
    socket: Option<Box<dyn Socket>>,
    pool: Arc<SocketPool>,
    dedicated: Option<Arc<AtomicUsize>>,
    /// Cursors this socket opened that have not been exhausted or killed
    open_cursors: HashSet<u64>,
}

impl ReservedSocket {
    pub(crate) fn role(&self) -> NodeRole {
        self.pool.role()
    }

    pub(crate) async fn run(&mut self, command: Command) -> StoreResult<Reply> {
        let socket = self.socket.as_mut().ok_or(StoreError::SessionClosed)?;
        let continued = match &command {
            Command::GetMore { cursor_id, .. } | Command::KillCursor { cursor_id } => {
                Some(*cursor_id)
            }
            _ => None,
        };

        let reply = socket.run(command).await;

        if let Some(cursor_id) = continued {
            self.open_cursors.remove(&cursor_id);
        }
        if let Ok(Reply::Batch { cursor_id, .. }) = &reply {
            if *cursor_id != 0 {
                self.open_cursors.insert(*cursor_id);
            }
        }
        reply
    }

    /// Kill cursors abandoned by their readers. Ids this socket did not open
    /// are skipped.
    pub(crate) async fn kill_cursors(&mut self, cursor_ids: Vec<u64>) {
        for cursor_id in cursor_ids {
            if !self.open_cursors.contains(&cursor_id) {
                continue;
            }
            if let Err(err) = self.run(Command::KillCursor { cursor_id }).await {
                debug!(addr = %self.pool.addr(), cursor_id, error = %err, "failed to kill cursor");
            }
        }
    }

    /// Throw the socket away instead of returning it; used after a network failure.
    pub(crate) fn discard(mut self) {
        if let Some(socket) = self.socket.take() {
            match self.dedicated.take() {
                Some(counter) => {
                    drop(socket);
                    counter.fetch_sub(1, Ordering::SeqCst);
                }
                None => self.pool.discard(socket),
            }
        }
    }
}

impl Drop for ReservedSocket {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            match &self.dedicated {
                Some(counter) => {
                    drop(socket);
                    counter.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    let open_cursors = mem::take(&mut self.open_cursors).into_iter().collect();
                    self.pool.release_with_cursors(socket, open_cursors);
                }
            }
        }
    }
}
