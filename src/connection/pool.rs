use super::{Command, Credentials, NodeRole, Socket, Transport};
use crate::core::{StoreError, StoreResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Dial one node and bound the handshake by `timeout`.
pub(crate) async fn connect_with_timeout(
    transport: &dyn Transport,
    addr: &str,
    credentials: Option<&Credentials>,
    timeout: Duration,
) -> StoreResult<Box<dyn Socket>> {
    match tokio::time::timeout(timeout, transport.connect(addr, credentials)).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unreachable(addr.to_string())),
    }
}

/// Socket pool for a single node
///
/// Sockets handed out by [`SocketPool::acquire`] come back through
/// [`SocketPool::release`]; the pool never holds more than `max_size` sockets,
/// idle plus in use.
pub struct SocketPool {
    addr: String,
    role: NodeRole,
    transport: Arc<dyn Transport>,
    credentials: Option<Credentials>,
    timeout: Duration,
    max_size: usize,
    max_idle_time: Option<Duration>,
    /// Idle sockets
    idle: Mutex<VecDeque<IdleSocket>>,
    /// Sockets owned by the pool, idle or in use
    total: AtomicUsize,
    closed: AtomicBool,
}

struct IdleSocket {
    socket: Box<dyn Socket>,
    last_used: Instant,
    /// Server cursors left open by the last holder, killed before reuse.
    stale_cursors: Vec<u64>,
}

impl IdleSocket {
    fn new(socket: Box<dyn Socket>, stale_cursors: Vec<u64>) -> Self {
        Self {
            socket,
            last_used: Instant::now(),
            stale_cursors,
        }
    }

    fn is_idle_too_long(&self, max_idle_time: Option<Duration>) -> bool {
        max_idle_time.is_some_and(|limit| self.last_used.elapsed() > limit)
    }
}

impl SocketPool {
    pub(crate) fn new(
        addr: String,
        role: NodeRole,
        transport: Arc<dyn Transport>,
        credentials: Option<Credentials>,
        timeout: Duration,
        max_size: usize,
        max_idle_time: Option<Duration>,
    ) -> Self {
        Self {
            addr,
            role,
            transport,
            credentials,
            timeout,
            max_size,
            max_idle_time,
            idle: Mutex::new(VecDeque::new()),
            total: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Adopt an already dialed socket (the one used for the handshake).
    pub(crate) fn seed(&self, socket: Box<dyn Socket>) -> StoreResult<()> {
        let mut idle = self.idle.lock()?;
        idle.push_back(IdleSocket::new(socket, Vec::new()));
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Take an idle socket or dial a new one, waiting for a release when the
    /// pool is at capacity.
    pub async fn acquire(&self) -> StoreResult<Box<dyn Socket>> {
        let start = Instant::now();

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(StoreError::SessionClosed);
            }

            if let Some(entry) = self.try_get_idle()? {
                match self.kill_stale_cursors(entry).await {
                    Some(socket) => return Ok(socket),
                    None => continue,
                }
            }

            if self.try_reserve_slot() {
                debug!(addr = %self.addr, "dialing new pooled socket");
                return match connect_with_timeout(
                    self.transport.as_ref(),
                    &self.addr,
                    self.credentials.as_ref(),
                    self.timeout,
                )
                .await
                {
                    Ok(socket) => Ok(socket),
                    Err(err) => {
                        self.total.fetch_sub(1, Ordering::SeqCst);
                        Err(err)
                    }
                };
            }

            if start.elapsed() > self.timeout {
                return Err(StoreError::PoolTimeout(self.addr.clone()));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Dial a socket that is not accounted to the pool.
    pub async fn dial_dedicated(&self) -> StoreResult<Box<dyn Socket>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::SessionClosed);
        }
        connect_with_timeout(
            self.transport.as_ref(),
            &self.addr,
            self.credentials.as_ref(),
            self.timeout,
        )
        .await
    }

    /// Kill the cursors the previous holder abandoned. A socket that fails to
    /// do so is discarded.
    async fn kill_stale_cursors(&self, entry: IdleSocket) -> Option<Box<dyn Socket>> {
        let IdleSocket {
            mut socket,
            stale_cursors,
            ..
        } = entry;

        for cursor_id in stale_cursors {
            if let Err(err) = socket.run(Command::KillCursor { cursor_id }).await {
                debug!(addr = %self.addr, cursor_id, error = %err, "failed to kill stale cursor");
                self.discard(socket);
                return None;
            }
        }
        Some(socket)
    }

    fn try_get_idle(&self) -> StoreResult<Option<IdleSocket>> {
        let mut idle = self.idle.lock()?;

        let mut kept = VecDeque::with_capacity(idle.len());
        let mut removed = 0usize;
        while let Some(entry) = idle.pop_front() {
            if entry.is_idle_too_long(self.max_idle_time) {
                removed += 1;
            } else {
                kept.push_back(entry);
            }
        }
        *idle = kept;

        if removed > 0 {
            self.total.fetch_sub(removed, Ordering::SeqCst);
        }

        Ok(idle.pop_front())
    }

    fn try_reserve_slot(&self) -> bool {
        self.total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < self.max_size).then_some(total + 1)
            })
            .is_ok()
    }

    /// Return a socket. Once the pool is closed the socket is dropped instead.
    pub fn release(&self, socket: Box<dyn Socket>) {
        self.release_with_cursors(socket, Vec::new());
    }

    /// Return a socket that still has server cursors open; the next
    /// [`acquire`](SocketPool::acquire) kills them before handing it out.
    pub(crate) fn release_with_cursors(&self, socket: Box<dyn Socket>, open_cursors: Vec<u64>) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Ok(mut idle) = self.idle.lock() {
                idle.push_back(IdleSocket::new(socket, open_cursors));
                return;
            }
        }
        self.total.fetch_sub(1, Ordering::SeqCst);
    }

    /// Drop a socket that failed mid-request.
    pub fn discard(&self, socket: Box<dyn Socket>) {
        debug!(addr = %socket.addr(), "discarding broken socket");
        drop(socket);
        self.total.fetch_sub(1, Ordering::SeqCst);
    }

    /// Drop every idle socket and refuse new acquisitions. Sockets still in use
    /// are dropped as they are released.
    pub fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let mut idle = self.idle.lock()?;
        let drained = idle.len();
        idle.clear();
        self.total.fetch_sub(drained, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().map(|idle| idle.len()).unwrap_or(0);
        let total = self.total.load(Ordering::SeqCst);

        PoolStats {
            addr: self.addr.clone(),
            role: self.role,
            total_sockets: total,
            idle_sockets: idle,
            in_use_sockets: total.saturating_sub(idle),
            max_sockets: self.max_size,
        }
    }
}

/// Socket pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub addr: String,
    pub role: NodeRole,
    pub total_sockets: usize,
    pub idle_sockets: usize,
    pub in_use_sockets: usize,
    pub max_sockets: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({:?}): {}/{} in use, {} idle, max {}",
            self.addr,
            self.role,
            self.in_use_sockets,
            self.total_sockets,
            self.idle_sockets,
            self.max_sockets
        )
    }
}
