//! Key routing: primary pool set, optional gutter tier, failure policy.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use fxhash::FxHashMap;

use crate::connection::SocketFactory;
use crate::error::Error;
use crate::key::{Key, ServerAddress};
use crate::pool::{ConnectionPool, PoolConfig, PoolCounters};
use crate::ring::Ring;

/// Per-call failure policy.
#[derive(Clone, Copy, Debug)]
pub struct FailureHandling {
    /// Overrides the router's `raise_on_server_error` default when set.
    pub raise_on_server_error: Option<bool>,
    /// Whether a failing write-class op notifies the write-failure
    /// listeners.
    pub track_write_failures: bool,
}

impl Default for FailureHandling {
    fn default() -> Self {
        FailureHandling {
            raise_on_server_error: None,
            track_write_failures: true,
        }
    }
}

impl FailureHandling {
    /// A policy that keeps failures quiet and untracked; used by
    /// best-effort writes such as `refill`.
    pub fn untracked() -> Self {
        FailureHandling {
            raise_on_server_error: None,
            track_write_failures: false,
        }
    }
}

type WriteFailureListener = Box<dyn Fn(&Key) + Send + Sync>;

/// A ring plus one pool per ring server.
pub(crate) struct PoolSet {
    ring: Ring,
    pools: FxHashMap<ServerAddress, Arc<ConnectionPool>>,
}

impl PoolSet {
    fn new(
        servers: Vec<ServerAddress>,
        config: &PoolConfig,
        factory: &Arc<dyn SocketFactory>,
    ) -> PoolSet {
        let pools = servers
            .iter()
            .map(|addr| {
                let pool = ConnectionPool::new(addr.clone(), config.clone(), Arc::clone(factory));
                (addr.clone(), Arc::new(pool))
            })
            .collect();
        PoolSet {
            ring: Ring::new(servers),
            pools,
        }
    }

    fn pool_for(&self, key: &Key) -> Arc<ConnectionPool> {
        let addr = self.ring.server_for(key.routing_token());
        // Every ring server was given a pool at construction.
        Arc::clone(&self.pools[addr])
    }

    /// Groups key indices by owning pool, preserving index order within
    /// each group.
    fn group(
        &self,
        keys: &[Key],
        indices: impl IntoIterator<Item = usize>,
    ) -> Vec<(Arc<ConnectionPool>, Vec<usize>)> {
        let mut by_server: FxHashMap<&ServerAddress, Vec<usize>> = FxHashMap::default();
        for index in indices {
            let addr = self.ring.server_for(keys[index].routing_token());
            by_server.entry(addr).or_default().push(index);
        }
        by_server
            .into_iter()
            .map(|(addr, indices)| (Arc::clone(&self.pools[addr]), indices))
            .collect()
    }

    async fn warm_up(&self) {
        for pool in self.pools.values() {
            pool.warm_up().await;
        }
    }
}

/// Maps keys to pools and owns the failure-handling machinery: the
/// gutter tier, the raise-vs-silence default, and the write-failure
/// listeners.
pub struct Router {
    primary: PoolSet,
    gutter: Option<PoolSet>,
    gutter_ttl: u32,
    raise_on_server_error: bool,
    listeners: Mutex<Vec<WriteFailureListener>>,
}

impl Router {
    pub(crate) fn new(
        servers: Vec<ServerAddress>,
        gutter_servers: Option<Vec<ServerAddress>>,
        gutter_ttl: u32,
        raise_on_server_error: bool,
        config: &PoolConfig,
        factory: Arc<dyn SocketFactory>,
    ) -> Router {
        Router {
            primary: PoolSet::new(servers, config, &factory),
            gutter: gutter_servers.map(|servers| PoolSet::new(servers, config, &factory)),
            gutter_ttl,
            raise_on_server_error,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub(crate) async fn warm_up(&self) {
        self.primary.warm_up().await;
        if let Some(gutter) = &self.gutter {
            gutter.warm_up().await;
        }
    }

    pub(crate) fn primary_pool(&self, key: &Key) -> Arc<ConnectionPool> {
        self.primary.pool_for(key)
    }

    pub(crate) fn gutter_pool(&self, key: &Key) -> Option<Arc<ConnectionPool>> {
        self.gutter.as_ref().map(|set| set.pool_for(key))
    }

    pub(crate) fn group_primary(
        &self,
        keys: &[Key],
        indices: impl IntoIterator<Item = usize>,
    ) -> Vec<(Arc<ConnectionPool>, Vec<usize>)> {
        self.primary.group(keys, indices)
    }

    pub(crate) fn group_gutter(
        &self,
        keys: &[Key],
        indices: impl IntoIterator<Item = usize>,
    ) -> Option<Vec<(Arc<ConnectionPool>, Vec<usize>)>> {
        self.gutter.as_ref().map(|set| set.group(keys, indices))
    }

    pub(crate) fn has_gutter(&self) -> bool {
        self.gutter.is_some()
    }

    /// The TTL ceiling applied to writes and touches that land on the
    /// gutter tier, so degraded-mode state ages out quickly.
    pub(crate) fn gutter_ttl(&self) -> u32 {
        self.gutter_ttl
    }

    /// Resolves the effective raise-vs-silence policy for one call.
    pub(crate) fn should_raise(&self, fh: &FailureHandling) -> bool {
        fh.raise_on_server_error.unwrap_or(self.raise_on_server_error)
    }

    /// Registers a write-failure listener. Listeners run synchronously
    /// after the failing op has left all pool locks; they must not
    /// block.
    pub fn on_write_failure(&self, listener: impl Fn(&Key) + Send + Sync + 'static) {
        self.listeners_lock().push(Box::new(listener));
    }

    /// Notifies listeners of a failed write-class op. A panicking
    /// listener is logged and does not stop the rest.
    pub(crate) fn emit_write_failure(&self, key: &Key) {
        let listeners = self.listeners_lock();
        for listener in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(key))).is_err() {
                tracing::warn!("write-failure listener panicked");
            }
        }
    }

    /// Counter snapshots for every pool, gutter included.
    pub fn counters(&self) -> FxHashMap<ServerAddress, PoolCounters> {
        let mut out = FxHashMap::default();
        for (addr, pool) in &self.primary.pools {
            out.insert(addr.clone(), pool.counters());
        }
        if let Some(gutter) = &self.gutter {
            for (addr, pool) in &gutter.pools {
                out.insert(addr.clone(), pool.counters());
            }
        }
        out
    }

    fn listeners_lock(&self) -> MutexGuard<'_, Vec<WriteFailureListener>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Validates a server list before ring construction.
pub(crate) fn require_servers(servers: &[ServerAddress]) -> Result<(), Error> {
    if servers.is_empty() {
        Err(Error::Connect(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "at least one server address is required",
        )))
    } else {
        Ok(())
    }
}
