//! The user-facing cache client: typed operations with herd-control
//! policies layered over the meta command dispatcher.

use std::sync::Arc;
use std::time::Duration;

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::connection::{SocketFactory, TcpSocketFactory};
use crate::error::Error;
use crate::key::{Key, ServerAddress};
use crate::meta::MetaDispatcher;
use crate::pool::{PoolConfig, PoolCounters};
use crate::proto::{
    ArithMode, ArithmeticResponse, ReadResponse, RequestFlags, ResponseFlags, SetMode,
    WriteResponse,
};
use crate::router::{require_servers, FailureHandling, Router};
use crate::value::{CacheValue, DefaultCodec, ValueCodec, ValueKind};

/// Recache window for plain gets. A hit whose remaining TTL has fallen
/// under `ttl` elects exactly one reader as the refresh winner: the
/// winner observes a miss and repopulates, everyone else keeps getting
/// the stale value.
#[derive(Clone, Copy, Debug)]
pub struct RecachePolicy {
    /// Remaining-TTL threshold in seconds.
    pub ttl: u32,
}

impl Default for RecachePolicy {
    fn default() -> Self {
        RecachePolicy { ttl: 30 }
    }
}

/// Lease policy for [`CacheClient::get_or_lease`]: on miss the server
/// vivifies an empty placeholder and elects the winner; losers poll
/// with capped exponential backoff until the winner repopulates.
#[derive(Clone, Copy, Debug)]
pub struct LeasePolicy {
    /// TTL of the vivified placeholder, in seconds.
    pub ttl: u32,
    /// How many times a loser re-polls before giving up.
    pub miss_retries: u32,
    /// Initial wait between polls, in seconds.
    pub miss_retry_wait: f64,
    /// Multiplier applied to the wait after each poll.
    pub wait_backoff_factor: f64,
    /// Ceiling on a single wait, in seconds.
    pub miss_max_retry_wait: f64,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        LeasePolicy {
            ttl: 30,
            miss_retries: 3,
            miss_retry_wait: 1.0,
            wait_backoff_factor: 1.2,
            miss_max_retry_wait: 5.0,
        }
    }
}

/// Serve-stale policy for deletes and CAS-conflicted sets.
#[derive(Clone, Copy, Debug, Default)]
pub struct StalePolicy {
    /// When above zero, deletes mark the item stale for this many
    /// seconds instead of dropping it, so readers keep a value while
    /// the writer refreshes.
    pub mark_stale_on_deletion_ttl: u32,
    /// When true, a CAS-conflicted set marks the surviving value stale
    /// instead of silently losing the write.
    pub mark_stale_on_cas_mismatch: bool,
}

/// Options for [`CacheClient::set_opts`].
#[derive(Clone, Debug, Default)]
pub struct SetOptions {
    /// Compare-and-swap token from an earlier read.
    pub cas_token: Option<u64>,
    /// Storage mode.
    pub mode: SetMode,
    /// Serve-stale behavior on CAS conflict.
    pub stale_policy: Option<StalePolicy>,
    /// Per-call failure policy.
    pub failure_handling: FailureHandling,
}

/// Options for [`CacheClient::delete_opts`] and
/// [`CacheClient::invalidate_opts`].
#[derive(Clone, Debug, Default)]
pub struct DeleteOptions {
    /// Delete only if the CAS token still matches.
    pub cas_token: Option<u64>,
    /// Serve-stale behavior.
    pub stale_policy: Option<StalePolicy>,
    /// Per-call failure policy.
    pub failure_handling: FailureHandling,
}

/// File-loadable client configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Primary servers, `host:port` or `tcp://host:port`.
    pub servers: Vec<String>,
    /// Gutter servers; empty disables the gutter tier.
    pub gutter_servers: Vec<String>,
    /// TTL ceiling for state written to the gutter tier, in seconds.
    pub gutter_ttl: u32,
    /// Whether server errors raise instead of degrading to miss/false.
    pub raise_on_server_error: bool,
    /// Pool tuning.
    pub pool: PoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            servers: Vec::new(),
            gutter_servers: Vec::new(),
            gutter_ttl: 30,
            raise_on_server_error: true,
            pool: PoolConfig::default(),
        }
    }
}

/// Builder for [`CacheClient`].
pub struct CacheClientBuilder {
    servers: Vec<ServerAddress>,
    gutter_servers: Option<Vec<ServerAddress>>,
    gutter_ttl: u32,
    pool_config: PoolConfig,
    raise_on_server_error: bool,
    error_on_type_mismatch: bool,
    socket_factory: Arc<dyn SocketFactory>,
    codec: Arc<dyn ValueCodec>,
}

impl CacheClientBuilder {
    /// Starts a builder for the given primary servers.
    pub fn new(servers: impl IntoIterator<Item = ServerAddress>) -> Self {
        CacheClientBuilder {
            servers: servers.into_iter().collect(),
            gutter_servers: None,
            gutter_ttl: 30,
            pool_config: PoolConfig::default(),
            raise_on_server_error: true,
            error_on_type_mismatch: false,
            socket_factory: Arc::new(TcpSocketFactory),
            codec: Arc::new(DefaultCodec::default()),
        }
    }

    /// Configures a gutter tier that absorbs traffic for marked-down
    /// primary servers.
    pub fn gutter(mut self, servers: impl IntoIterator<Item = ServerAddress>) -> Self {
        self.gutter_servers = Some(servers.into_iter().collect());
        self
    }

    /// TTL ceiling for writes landing on the gutter tier.
    pub fn gutter_ttl(mut self, ttl: u32) -> Self {
        self.gutter_ttl = ttl;
        self
    }

    /// Pool tuning knobs.
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Default for whether server errors raise; overridable per call.
    pub fn raise_on_server_error(mut self, raise: bool) -> Self {
        self.raise_on_server_error = raise;
        self
    }

    /// Makes typed getters fail instead of returning `None` on a type
    /// mismatch.
    pub fn error_on_type_mismatch(mut self, raise: bool) -> Self {
        self.error_on_type_mismatch = raise;
        self
    }

    /// Swaps the transport factory (TLS, test transports).
    pub fn socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.socket_factory = factory;
        self
    }

    /// Swaps the value codec.
    pub fn codec(mut self, codec: Arc<dyn ValueCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Builds the client and eagerly warms every pool up to
    /// `initial_pool_size` connections.
    pub async fn build(self) -> Result<CacheClient, Error> {
        require_servers(&self.servers)?;
        if let Some(gutter) = &self.gutter_servers {
            require_servers(gutter)?;
        }

        let router = Router::new(
            self.servers,
            self.gutter_servers,
            self.gutter_ttl,
            self.raise_on_server_error,
            &self.pool_config,
            self.socket_factory,
        );
        router.warm_up().await;

        Ok(CacheClient {
            meta: MetaDispatcher::new(router),
            codec: self.codec,
            error_on_type_mismatch: self.error_on_type_mismatch,
        })
    }
}

/// A memcached cluster client speaking the meta protocol.
///
/// Cheap to share: all operations take `&self` and may run concurrently
/// from many tasks.
pub struct CacheClient {
    meta: MetaDispatcher,
    codec: Arc<dyn ValueCodec>,
    error_on_type_mismatch: bool,
}

impl CacheClient {
    /// Starts a [`CacheClientBuilder`].
    pub fn builder(servers: impl IntoIterator<Item = ServerAddress>) -> CacheClientBuilder {
        CacheClientBuilder::new(servers)
    }

    /// Builds a builder from a [`ClientConfig`], typically deserialized
    /// from a config file.
    pub fn from_config(config: &ClientConfig) -> Result<CacheClientBuilder, Error> {
        let servers = config
            .servers
            .iter()
            .map(|s| ServerAddress::parse(s))
            .collect::<Result<Vec<_>, _>>()?;
        let mut builder = CacheClientBuilder::new(servers)
            .gutter_ttl(config.gutter_ttl)
            .raise_on_server_error(config.raise_on_server_error)
            .pool_config(config.pool.clone());
        if !config.gutter_servers.is_empty() {
            let gutter = config
                .gutter_servers
                .iter()
                .map(|s| ServerAddress::parse(s))
                .collect::<Result<Vec<_>, _>>()?;
            builder = builder.gutter(gutter);
        }
        Ok(builder)
    }

    /// Gets a key's value. `None` on miss.
    pub async fn get(&self, key: &Key) -> Result<Option<CacheValue>, Error> {
        self.get_with(key, None, None).await
    }

    /// Gets with an optional touch TTL and recache policy. Under a
    /// recache policy the elected winner sees `None` and must
    /// repopulate; losers are served the stale value.
    pub async fn get_with(
        &self,
        key: &Key,
        touch_ttl: Option<u32>,
        recache_policy: Option<&RecachePolicy>,
    ) -> Result<Option<CacheValue>, Error> {
        let fetched = self
            .fetch(key, touch_ttl, recache_policy, false, &FailureHandling::default())
            .await?;
        Ok(fetched.map(|(value, _)| value))
    }

    /// Gets a value together with its CAS token.
    pub async fn get_cas(&self, key: &Key) -> Result<Option<(CacheValue, u64)>, Error> {
        let fetched = self
            .fetch(key, None, None, true, &FailureHandling::default())
            .await?;
        Ok(fetched.map(|(value, flags)| (value, flags.cas_token.unwrap_or_default())))
    }

    /// Gets a value asserting its kind. A mismatch yields `None`, or an
    /// error when the client was built with `error_on_type_mismatch`.
    pub async fn get_typed(&self, key: &Key, kind: ValueKind) -> Result<Option<CacheValue>, Error> {
        match self.get(key).await? {
            Some(value) if value.kind() == kind => Ok(Some(value)),
            Some(value) => self.mismatch(kind, value.kind()).map(|_| None),
            None => Ok(None),
        }
    }

    /// [`CacheClient::get_cas`] with a kind assertion.
    pub async fn get_cas_typed(
        &self,
        key: &Key,
        kind: ValueKind,
    ) -> Result<Option<(CacheValue, u64)>, Error> {
        match self.get_cas(key).await? {
            Some((value, cas)) if value.kind() == kind => Ok(Some((value, cas))),
            Some((value, _)) => self.mismatch(kind, value.kind()).map(|_| None),
            None => Ok(None),
        }
    }

    /// Pipelined multi-get. Returns a map of the keys that hit; order of
    /// correspondence with the requested keys is preserved through the
    /// map keys.
    pub async fn multi_get(&self, keys: &[Key]) -> Result<FxHashMap<Key, CacheValue>, Error> {
        self.multi_get_with(keys, None, None).await
    }

    /// Multi-get with per-key touch TTL and recache policy.
    pub async fn multi_get_with(
        &self,
        keys: &[Key],
        touch_ttl: Option<u32>,
        recache_policy: Option<&RecachePolicy>,
    ) -> Result<FxHashMap<Key, CacheValue>, Error> {
        let fh = FailureHandling::default();
        let flags = RequestFlags {
            return_value: true,
            return_client_flag: true,
            cache_ttl: touch_ttl,
            recache_ttl: recache_policy.map(|p| p.ttl),
            ..RequestFlags::default()
        };

        let per_key = self.meta.meta_multiget(keys, &flags).await;

        let mut out = FxHashMap::default();
        for (key, result) in keys.iter().zip(per_key) {
            match result {
                Ok(ReadResponse::Value { flags, data }) => {
                    if flags.win == Some(true) {
                        continue;
                    }
                    let value = self.codec.decode(&data, flags.client_flag.unwrap_or(0))?;
                    out.insert(key.clone(), value);
                }
                Ok(_) => {}
                Err(e) if e.is_server_class() && !self.meta.router.should_raise(&fh) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Gets a key, taking a lease on miss. The lease winner gets `None`
    /// and must repopulate with [`CacheClient::set`]; losers wait for
    /// the winner with capped exponential backoff and get the value once
    /// it lands, or `None` after the retries run out.
    pub async fn get_or_lease(
        &self,
        key: &Key,
        lease_policy: &LeasePolicy,
    ) -> Result<Option<CacheValue>, Error> {
        self.get_or_lease_with(key, lease_policy, None, None).await
    }

    /// [`CacheClient::get_or_lease`] with touch TTL and recache policy.
    pub async fn get_or_lease_with(
        &self,
        key: &Key,
        lease_policy: &LeasePolicy,
        touch_ttl: Option<u32>,
        recache_policy: Option<&RecachePolicy>,
    ) -> Result<Option<CacheValue>, Error> {
        let fh = FailureHandling::default();
        let flags = RequestFlags {
            return_value: true,
            return_client_flag: true,
            return_cas_token: true,
            vivify_on_miss_ttl: Some(lease_policy.ttl),
            cache_ttl: touch_ttl,
            recache_ttl: recache_policy.map(|p| p.ttl),
            ..RequestFlags::default()
        };

        let mut wait = lease_policy.miss_retry_wait;
        for attempt in 0..=lease_policy.miss_retries {
            let response = match self.meta.meta_get(key, &flags, &fh).await {
                Ok(response) => response,
                Err(e) if e.is_server_class() && !self.meta.router.should_raise(&fh) => {
                    return Ok(None)
                }
                Err(e) => return Err(e),
            };

            match response {
                // A plain miss means the vivify lost to a concurrent
                // delete; this caller repopulates.
                ReadResponse::Miss | ReadResponse::Success { .. } => return Ok(None),
                ReadResponse::Value { flags, data } => match flags.win {
                    Some(true) => return Ok(None),
                    Some(false) => {
                        if attempt == lease_policy.miss_retries {
                            break;
                        }
                        let pause = wait.min(lease_policy.miss_max_retry_wait).max(0.0);
                        tokio::time::sleep(Duration::from_secs_f64(pause)).await;
                        wait *= lease_policy.wait_backoff_factor;
                    }
                    None => {
                        let value = self.codec.decode(&data, flags.client_flag.unwrap_or(0))?;
                        return Ok(Some(value));
                    }
                },
            }
        }
        Ok(None)
    }

    /// Stores a value. `true` iff the server stored it.
    pub async fn set(
        &self,
        key: &Key,
        value: impl Into<CacheValue>,
        ttl: u32,
    ) -> Result<bool, Error> {
        self.set_opts(key, value, ttl, &SetOptions::default()).await
    }

    /// Stores a value with mode, CAS and stale-policy control.
    ///
    /// On a CAS conflict with `mark_stale_on_cas_mismatch`, one
    /// follow-up set marks the surviving value stale so readers refresh
    /// it; the call still returns `false` because this write lost.
    pub async fn set_opts(
        &self,
        key: &Key,
        value: impl Into<CacheValue>,
        ttl: u32,
        opts: &SetOptions,
    ) -> Result<bool, Error> {
        let value = value.into();
        let (payload, client_flag) = self.codec.encode(&value)?;
        let flags = RequestFlags {
            return_value: false,
            cache_ttl: Some(ttl),
            client_flag: Some(client_flag),
            cas_token: opts.cas_token,
            set_mode: opts.mode,
            ..RequestFlags::default()
        };

        let response = match self
            .meta
            .meta_set(key, &payload, &flags, &opts.failure_handling)
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_server_class() && !self.meta.router.should_raise(&opts.failure_handling) => {
                return Ok(false)
            }
            Err(e) => return Err(e),
        };

        match response {
            WriteResponse::Success { .. } => Ok(true),
            WriteResponse::Conflict => {
                let mark_stale = opts
                    .stale_policy
                    .map_or(false, |p| p.mark_stale_on_cas_mismatch);
                if mark_stale {
                    let mut stale_flags = flags;
                    stale_flags.mark_stale = true;
                    let _ = self
                        .meta
                        .meta_set(key, &payload, &stale_flags, &FailureHandling::untracked())
                        .await;
                }
                Ok(false)
            }
            WriteResponse::NotStored | WriteResponse::Miss => Ok(false),
        }
    }

    /// Fire-and-forget store (`q`). Only transport failures surface.
    pub async fn set_no_reply(
        &self,
        key: &Key,
        value: impl Into<CacheValue>,
        ttl: u32,
    ) -> Result<(), Error> {
        let value = value.into();
        let (payload, client_flag) = self.codec.encode(&value)?;
        let flags = RequestFlags {
            return_value: false,
            no_reply: true,
            cache_ttl: Some(ttl),
            client_flag: Some(client_flag),
            ..RequestFlags::default()
        };
        let fh = FailureHandling::default();
        match self.meta.meta_set(key, &payload, &flags, &fh).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_server_class() && !self.meta.router.should_raise(&fh) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Repopulates a key that should be missing: an ADD that neither
    /// tracks nor reports failures. `false` when the key reappeared
    /// first; the stored value is left untouched.
    pub async fn refill(
        &self,
        key: &Key,
        value: impl Into<CacheValue>,
        ttl: u32,
    ) -> Result<bool, Error> {
        self.set_opts(
            key,
            value,
            ttl,
            &SetOptions {
                mode: SetMode::Add,
                failure_handling: FailureHandling::untracked(),
                ..SetOptions::default()
            },
        )
        .await
    }

    /// Deletes a key. `true` iff it existed.
    pub async fn delete(&self, key: &Key) -> Result<bool, Error> {
        self.delete_opts(key, &DeleteOptions::default()).await
    }

    /// Deletes with CAS and stale-policy control. With
    /// `mark_stale_on_deletion_ttl > 0` the item is marked stale for
    /// that long instead of dropped, so readers bridge the refresh.
    pub async fn delete_opts(&self, key: &Key, opts: &DeleteOptions) -> Result<bool, Error> {
        self.delete_inner(key, opts, false).await
    }

    /// Fire-and-forget delete (`q`).
    pub async fn delete_no_reply(&self, key: &Key) -> Result<(), Error> {
        let flags = RequestFlags {
            return_value: false,
            no_reply: true,
            ..RequestFlags::default()
        };
        let fh = FailureHandling::default();
        match self.meta.meta_delete(key, &flags, &fh).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_server_class() && !self.meta.router.should_raise(&fh) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Like delete, but an already-absent key counts as success.
    pub async fn invalidate(&self, key: &Key) -> Result<bool, Error> {
        self.invalidate_opts(key, &DeleteOptions::default()).await
    }

    /// [`CacheClient::invalidate`] with options.
    pub async fn invalidate_opts(&self, key: &Key, opts: &DeleteOptions) -> Result<bool, Error> {
        self.delete_inner(key, opts, true).await
    }

    /// Refreshes a key's TTL without reading it. `true` iff the key
    /// exists.
    pub async fn touch(&self, key: &Key, ttl: u32) -> Result<bool, Error> {
        let fh = FailureHandling::default();
        let flags = RequestFlags {
            return_value: false,
            cache_ttl: Some(ttl),
            ..RequestFlags::default()
        };
        match self.meta.meta_get(key, &flags, &fh).await {
            Ok(ReadResponse::Miss) => Ok(false),
            Ok(_) => Ok(true),
            Err(e) if e.is_server_class() && !self.meta.router.should_raise(&fh) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Adjusts a counter by `delta` (negative decrements). `false` when
    /// the key is absent or the CAS token mismatches.
    pub async fn delta(
        &self,
        key: &Key,
        delta: i64,
        refresh_ttl: Option<u32>,
        cas_token: Option<u64>,
    ) -> Result<bool, Error> {
        let response = self
            .arithmetic(key, delta, None, None, refresh_ttl, cas_token, false)
            .await?;
        Ok(matches!(response, Some(ArithmeticResponse::Success { .. })))
    }

    /// Like [`CacheClient::delta`], creating the counter at
    /// `initial_value` (with `initial_ttl`) when absent.
    pub async fn delta_initialize(
        &self,
        key: &Key,
        delta: i64,
        initial_value: u64,
        initial_ttl: u32,
    ) -> Result<bool, Error> {
        let response = self
            .arithmetic(
                key,
                delta,
                Some(initial_value),
                Some(initial_ttl),
                None,
                None,
                false,
            )
            .await?;
        Ok(matches!(response, Some(ArithmeticResponse::Success { .. })))
    }

    /// [`CacheClient::delta`] returning the post-op value.
    pub async fn delta_and_get(
        &self,
        key: &Key,
        delta: i64,
        refresh_ttl: Option<u32>,
        cas_token: Option<u64>,
    ) -> Result<Option<u64>, Error> {
        let response = self
            .arithmetic(key, delta, None, None, refresh_ttl, cas_token, true)
            .await?;
        arithmetic_value(response)
    }

    /// [`CacheClient::delta_initialize`] returning the post-op value.
    pub async fn delta_initialize_and_get(
        &self,
        key: &Key,
        delta: i64,
        initial_value: u64,
        initial_ttl: u32,
    ) -> Result<Option<u64>, Error> {
        let response = self
            .arithmetic(
                key,
                delta,
                Some(initial_value),
                Some(initial_ttl),
                None,
                None,
                true,
            )
            .await?;
        arithmetic_value(response)
    }

    /// Counter snapshots for every pool, keyed by server.
    pub fn get_counters(&self) -> FxHashMap<ServerAddress, PoolCounters> {
        self.meta.router.counters()
    }

    /// Registers a listener called with the key of every failed
    /// write-class operation whose call tracked write failures.
    pub fn on_write_failure(&self, listener: impl Fn(&Key) + Send + Sync + 'static) {
        self.meta.router.on_write_failure(listener);
    }

    async fn fetch(
        &self,
        key: &Key,
        touch_ttl: Option<u32>,
        recache_policy: Option<&RecachePolicy>,
        want_cas: bool,
        fh: &FailureHandling,
    ) -> Result<Option<(CacheValue, ResponseFlags)>, Error> {
        let flags = RequestFlags {
            return_value: true,
            return_client_flag: true,
            return_cas_token: want_cas,
            cache_ttl: touch_ttl,
            recache_ttl: recache_policy.map(|p| p.ttl),
            ..RequestFlags::default()
        };

        let response = match self.meta.meta_get(key, &flags, fh).await {
            Ok(response) => response,
            Err(e) if e.is_server_class() && !self.meta.router.should_raise(fh) => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        match response {
            ReadResponse::Miss | ReadResponse::Success { .. } => Ok(None),
            ReadResponse::Value { flags, data } => {
                // The recache winner must repopulate; hand it a miss.
                if flags.win == Some(true) {
                    return Ok(None);
                }
                let value = self.codec.decode(&data, flags.client_flag.unwrap_or(0))?;
                Ok(Some((value, flags)))
            }
        }
    }

    async fn delete_inner(
        &self,
        key: &Key,
        opts: &DeleteOptions,
        missing_ok: bool,
    ) -> Result<bool, Error> {
        let mut flags = RequestFlags {
            return_value: false,
            cas_token: opts.cas_token,
            ..RequestFlags::default()
        };
        if let Some(policy) = &opts.stale_policy {
            if policy.mark_stale_on_deletion_ttl > 0 {
                flags.mark_stale = true;
                flags.cache_ttl = Some(policy.mark_stale_on_deletion_ttl);
            }
        }

        let response = match self
            .meta
            .meta_delete(key, &flags, &opts.failure_handling)
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_server_class() && !self.meta.router.should_raise(&opts.failure_handling) => {
                return Ok(false)
            }
            Err(e) => return Err(e),
        };

        Ok(match response {
            WriteResponse::Success { .. } => true,
            WriteResponse::Miss => missing_ok,
            WriteResponse::NotStored | WriteResponse::Conflict => false,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn arithmetic(
        &self,
        key: &Key,
        delta: i64,
        initial_value: Option<u64>,
        initial_ttl: Option<u32>,
        refresh_ttl: Option<u32>,
        cas_token: Option<u64>,
        want_value: bool,
    ) -> Result<Option<ArithmeticResponse>, Error> {
        let (mode, magnitude) = if delta < 0 {
            (ArithMode::Decr, delta.unsigned_abs())
        } else {
            (ArithMode::Incr, delta as u64)
        };
        let fh = FailureHandling::default();
        let flags = RequestFlags {
            return_value: want_value,
            arith_mode: mode,
            ma_delta_value: Some(magnitude),
            ma_initial_value: initial_value,
            vivify_on_miss_ttl: initial_ttl,
            cache_ttl: refresh_ttl,
            cas_token,
            ..RequestFlags::default()
        };
        match self.meta.meta_arithmetic(key, &flags, &fh).await {
            Ok(response) => Ok(Some(response)),
            Err(e) if e.is_server_class() && !self.meta.router.should_raise(&fh) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn mismatch(&self, expected: ValueKind, found: ValueKind) -> Result<(), Error> {
        if self.error_on_type_mismatch {
            Err(Error::TypeMismatch { expected, found })
        } else {
            Ok(())
        }
    }
}

fn arithmetic_value(response: Option<ArithmeticResponse>) -> Result<Option<u64>, Error> {
    match response {
        Some(ArithmeticResponse::Success {
            value: Some(data), ..
        }) => {
            let text = std::str::from_utf8(&data)
                .map_err(|_| Error::Protocol("arithmetic result is not UTF-8".to_string()))?;
            let number = text
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::Protocol("arithmetic result is not a number".to_string()))?;
            Ok(Some(number))
        }
        _ => Ok(None),
    }
}
