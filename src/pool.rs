//! Per-server connection pool with fast mark-down.
//!
//! Acquisition never blocks waiting for a free connection: if the idle
//! set is empty a new connection is opened, trading memory for latency.
//! A failure marks the server down; while down, all requests fail fast
//! except a single designated prober per mark-down period, selected by a
//! compare-and-set on an atomic claim stamp. A successful probe clears
//! the mark.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::connection::{Connection, SocketFactory};
use crate::error::Error;
use crate::key::ServerAddress;

/// Pool tuning knobs, shared by every pool a client creates.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections opened eagerly at construction.
    pub initial_pool_size: usize,
    /// Cap on retained idle connections; extras are closed on release.
    pub max_pool_size: usize,
    /// How long a server stays marked down after a failure, in seconds.
    pub mark_down_period_s: f64,
    /// Connect (and send) timeout, in seconds.
    pub connection_timeout: f64,
    /// Per-read receive timeout, in seconds.
    pub recv_timeout: f64,
    /// TCP_NODELAY on new sockets.
    pub no_delay: bool,
    /// Read buffer size in bytes; power of two.
    pub read_buffer_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            initial_pool_size: 1,
            max_pool_size: 3,
            mark_down_period_s: 10.0,
            connection_timeout: 1.0,
            recv_timeout: 1.0,
            no_delay: true,
            read_buffer_size: 4096,
        }
    }
}

impl PoolConfig {
    pub(crate) fn connection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connection_timeout)
    }

    pub(crate) fn recv_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recv_timeout)
    }

    fn mark_down_period_ms(&self) -> u64 {
        (self.mark_down_period_s * 1000.0) as u64
    }
}

/// A snapshot of one pool's counters. Reads are relaxed; the fields are
/// not a consistent cut.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolCounters {
    /// Idle connections ready to lease.
    pub available: usize,
    /// Connections currently leased out.
    pub active: usize,
    /// `available + active`.
    pub established: usize,
    /// Connections opened over the pool's lifetime.
    pub total_created: u64,
    /// Connect failures plus poisoned closes.
    pub total_errors: u64,
}

/// Connection pool for a single server.
pub struct ConnectionPool {
    addr: ServerAddress,
    config: PoolConfig,
    factory: Arc<dyn SocketFactory>,
    idle: Mutex<Vec<Connection>>,
    active: AtomicUsize,
    total_created: AtomicU64,
    total_errors: AtomicU64,
    /// Millis (pool clock) until which the server is considered down;
    /// zero means healthy.
    marked_down_until: AtomicU64,
    /// Pool-clock stamp of the last real connect attempt while down.
    prober_claimed_at: AtomicU64,
    epoch: Instant,
}

impl ConnectionPool {
    pub(crate) fn new(
        addr: ServerAddress,
        config: PoolConfig,
        factory: Arc<dyn SocketFactory>,
    ) -> ConnectionPool {
        ConnectionPool {
            addr,
            config,
            factory,
            idle: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            total_created: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            marked_down_until: AtomicU64::new(0),
            prober_claimed_at: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// The server this pool fronts.
    pub fn addr(&self) -> &ServerAddress {
        &self.addr
    }

    /// Eagerly opens `initial_pool_size` connections. Failures are
    /// tolerated here; the first real request will mark the pool down.
    pub(crate) async fn warm_up(&self) {
        for _ in 0..self.config.initial_pool_size {
            match self.open_connection().await {
                Ok(conn) => {
                    let mut idle = self.idle_lock();
                    if idle.len() < self.config.max_pool_size {
                        idle.push(conn);
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %self.addr, error = %e, "pool warm-up failed");
                    break;
                }
            }
        }
    }

    /// Leases a connection: pops an idle one or opens a new one. While
    /// marked down, only the designated prober reaches the network;
    /// everyone else gets [`Error::MarkedDown`] in O(µs).
    pub(crate) async fn acquire(&self) -> Result<Connection, Error> {
        if self.marked_down_until.load(Ordering::Acquire) != 0 {
            if !self.claim_probe() {
                return Err(Error::MarkedDown(self.addr.clone()));
            }
            tracing::debug!(server = %self.addr, "probing marked-down server");
            return match self.open_connection().await {
                Ok(conn) => {
                    self.marked_down_until.store(0, Ordering::Release);
                    self.active.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(server = %self.addr, "probe succeeded, mark-down cleared");
                    Ok(conn)
                }
                Err(e) => {
                    self.mark_down();
                    Err(e)
                }
            };
        }

        if let Some(conn) = self.idle_lock().pop() {
            self.active.fetch_add(1, Ordering::Relaxed);
            return Ok(conn);
        }

        match self.open_connection().await {
            Ok(conn) => {
                self.active.fetch_add(1, Ordering::Relaxed);
                Ok(conn)
            }
            Err(e) => {
                self.mark_down();
                Err(e)
            }
        }
    }

    /// Returns a leased connection. Poisoned connections are closed and
    /// mark the server down; beyond `max_pool_size` they are closed
    /// quietly.
    pub(crate) fn release(&self, conn: Connection) {
        self.active.fetch_sub(1, Ordering::Relaxed);

        if conn.is_poisoned() {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(server = %self.addr, "closing poisoned connection, marking server down");
            self.mark_down();
            return;
        }

        let mut idle = self.idle_lock();
        if idle.len() < self.config.max_pool_size {
            idle.push(conn);
        }
    }

    pub(crate) fn counters(&self) -> PoolCounters {
        let available = self.idle_lock().len();
        let active = self.active.load(Ordering::Relaxed);
        PoolCounters {
            available,
            active,
            established: available + active,
            total_created: self.total_created.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
        }
    }

    async fn open_connection(&self) -> Result<Connection, Error> {
        match Connection::open(&self.addr, &*self.factory, &self.config).await {
            Ok(conn) => {
                self.total_created.fetch_add(1, Ordering::Relaxed);
                Ok(conn)
            }
            Err(e) => {
                self.total_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn idle_lock(&self) -> MutexGuard<'_, Vec<Connection>> {
        // A panic while holding the lock leaves no broken invariants in
        // a Vec of connections, so poisoning is recoverable.
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts (or extends) a mark-down window. The connect attempt that
    /// failed counts as this period's probe, so the claim stamp is set
    /// too.
    fn mark_down(&self) {
        let now = self.now_ms();
        self.marked_down_until
            .store(now + self.config.mark_down_period_ms(), Ordering::Release);
        self.prober_claimed_at.store(now, Ordering::Release);
    }

    /// At most one caller per mark-down period wins the probe slot.
    fn claim_probe(&self) -> bool {
        let now = self.now_ms();
        let period = self.config.mark_down_period_ms();
        loop {
            let claimed = self.prober_claimed_at.load(Ordering::Acquire);
            if now < claimed.saturating_add(period) {
                return false;
            }
            if self
                .prober_claimed_at
                .compare_exchange(claimed, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Monotonic pool clock in milliseconds, starting at 1 so that zero
    /// stays free as the "healthy" sentinel.
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }
}
