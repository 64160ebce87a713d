use super::cluster::{Cluster, ReservedSocket, Target};
use super::collection::Database;
use super::{Command, NodeRole, Reply, WriteConcern};
use crate::core::{ConsistencyMode, StoreError, StoreResult};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Write safety policy. With a policy set, every write waits for the server's
/// acknowledgment and reports its errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Safe {
    /// Nodes that must confirm the write.
    pub w: u32,
    /// Wait for the journal commit.
    pub journal: bool,
}

impl Default for Safe {
    fn default() -> Self {
        Self { w: 1, journal: false }
    }
}

impl Safe {
    pub(crate) fn concern(safe: Option<Safe>) -> WriteConcern {
        match safe {
            Some(safe) => WriteConcern::Acknowledged {
                w: safe.w,
                journal: safe.journal,
            },
            None => WriteConcern::Unacknowledged,
        }
    }
}

/// Where a session gets its socket from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketSource {
    /// Checked out of the node pools, returned on close.
    Pooled,
    /// Dialed for this session alone, disconnected on close.
    Dedicated,
}

#[derive(Default)]
struct SocketSlot {
    reserved: Option<ReservedSocket>,
    /// Set by the first write; monotonic sessions then stay on the primary.
    wrote: bool,
}

struct SessionInner {
    cluster: Arc<Cluster>,
    mode: ConsistencyMode,
    safe: Option<Safe>,
    source: SocketSource,
    slot: Mutex<SocketSlot>,
    /// Cursors dropped before exhaustion, killed on the next request.
    abandoned: std::sync::Mutex<Vec<u64>>,
    closed: AtomicBool,
}

/// A logical session over a [`Cluster`].
///
/// The session reserves one socket lazily, on its first request, and keeps it
/// until [`close`](Session::close). Requests on the same session are
/// serialized over that socket.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.inner.mode)
            .field("safe", &self.inner.safe)
            .field("source", &self.inner.source)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Root session of a freshly dialed cluster.
    pub fn new(cluster: Arc<Cluster>, mode: ConsistencyMode, safe: Option<Safe>) -> Self {
        Self::with_source(cluster, mode, safe, SocketSource::Pooled)
    }

    fn with_source(
        cluster: Arc<Cluster>,
        mode: ConsistencyMode,
        safe: Option<Safe>,
        source: SocketSource,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                cluster,
                mode,
                safe,
                source,
                slot: Mutex::new(SocketSlot::default()),
                abandoned: std::sync::Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// A new session over the same pools, with the same mode and safety, but
    /// its own socket reservation.
    pub fn copy(&self) -> Session {
        Self::with_source(
            Arc::clone(&self.inner.cluster),
            self.inner.mode,
            self.inner.safe,
            SocketSource::Pooled,
        )
    }

    /// Like [`copy`](Session::copy), but the socket is dialed for this session
    /// alone and never shared through a pool.
    pub fn clone_dedicated(&self) -> Session {
        Self::with_source(
            Arc::clone(&self.inner.cluster),
            self.inner.mode,
            self.inner.safe,
            SocketSource::Dedicated,
        )
    }

    /// Another reference to this same session (same socket reservation).
    pub(crate) fn share(&self) -> Session {
        Session {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn mode(&self) -> ConsistencyMode {
        self.inner.mode
    }

    pub fn safe(&self) -> Option<Safe> {
        self.inner.safe
    }

    pub fn is_dedicated(&self) -> bool {
        self.inner.source == SocketSource::Dedicated
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst) || self.inner.cluster.is_closed()
    }

    /// Node role of the currently reserved socket, if any.
    pub async fn reserved_role(&self) -> Option<NodeRole> {
        let slot = self.inner.slot.lock().await;
        slot.reserved.as_ref().map(ReservedSocket::role)
    }

    pub fn db(&self, name: &str) -> StoreResult<Database> {
        if self.is_closed() {
            return Err(StoreError::SessionClosed);
        }
        Database::new(self.share(), name)
    }

    /// Release the reserved socket. Calling it again is a no-op.
    ///
    /// Returns true if this call closed the session.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.release();
        true
    }

    /// Drop the reservation unless a request holds the slot. That request
    /// releases it on its way out.
    fn release(&self) {
        if let Ok(mut slot) = self.inner.slot.try_lock() {
            slot.reserved = None;
        }
    }

    /// Queue a server cursor nobody will read again.
    pub(crate) fn abandon_cursor(&self, cursor_id: u64) {
        if let Ok(mut abandoned) = self.inner.abandoned.lock() {
            abandoned.push(cursor_id);
        }
    }

    fn take_abandoned(&self) -> Vec<u64> {
        self.inner
            .abandoned
            .lock()
            .map(|mut abandoned| std::mem::take(&mut *abandoned))
            .unwrap_or_default()
    }

    pub(crate) async fn run(&self, command: Command) -> StoreResult<Reply> {
        let result = if self.is_closed() {
            Err(StoreError::SessionClosed)
        } else {
            self.run_reserved(command).await
        };

        // close() skips the release while the slot is held.
        if self.is_closed() {
            self.release();
        }
        result
    }

    async fn run_reserved(&self, command: Command) -> StoreResult<Reply> {
        let mut slot = self.inner.slot.lock().await;
        if self.is_closed() {
            return Err(StoreError::SessionClosed);
        }

        let write = command.is_write();
        let needs_primary = write || slot.wrote || !self.inner.mode.allows_secondary_reads();

        if needs_primary
            && slot
                .reserved
                .as_ref()
                .is_some_and(|reserved| reserved.role() != NodeRole::Primary)
        {
            slot.reserved = None;
        }

        let mut reserved = match slot.reserved.take() {
            Some(reserved) => reserved,
            None => {
                let target = if needs_primary {
                    Target::Primary
                } else {
                    Target::PreferSecondary
                };
                self.inner
                    .cluster
                    .reserve(target, self.inner.source == SocketSource::Dedicated)
                    .await?
            }
        };

        let abandoned = self.take_abandoned();
        if !abandoned.is_empty() {
            reserved.kill_cursors(abandoned).await;
        }

        let result = reserved.run(command).await;

        match &result {
            Err(StoreError::Unreachable(_)) => reserved.discard(),
            _ => {
                if write {
                    slot.wrote = true;
                }
                slot.reserved = Some(reserved);
            }
        }

        result
    }
}
