//! The meta command layer: one typed operation per protocol verb.
//!
//! Each operation routes its key, runs the exchange through the
//! executor, retries once on the gutter tier when one is configured,
//! and shapes the raw reply into the typed response for the verb class.
//! High-level semantics (policies, value codecs, retries with backoff)
//! live a layer up.

use std::sync::Arc;

use futures::future::join_all;

use crate::error::Error;
use crate::executor;
use crate::key::Key;
use crate::pool::ConnectionPool;
use crate::proto::{encode, ArithmeticResponse, MetaReply, ReadResponse, RequestFlags, WriteResponse};
use crate::router::{FailureHandling, Router};

#[derive(Clone, Copy, Debug, PartialEq)]
enum Verb {
    Get,
    Set,
    Delete,
    Arithmetic,
}

impl Verb {
    fn is_write_class(self) -> bool {
        !matches!(self, Verb::Get)
    }
}

/// Dispatches meta commands through the router. Composed by value into
/// the client; the high-level layer calls down, never the other way.
pub(crate) struct MetaDispatcher {
    pub(crate) router: Router,
}

impl MetaDispatcher {
    pub(crate) fn new(router: Router) -> MetaDispatcher {
        MetaDispatcher { router }
    }

    /// `mg` — returns Miss, Value or flag-only Success.
    pub(crate) async fn meta_get(
        &self,
        key: &Key,
        flags: &RequestFlags,
        fh: &FailureHandling,
    ) -> Result<ReadResponse, Error> {
        let reply = self.exchange(Verb::Get, key, flags, None, fh).await?;
        Ok(read_response(reply))
    }

    /// `ms` — stores a payload under the key.
    pub(crate) async fn meta_set(
        &self,
        key: &Key,
        payload: &[u8],
        flags: &RequestFlags,
        fh: &FailureHandling,
    ) -> Result<WriteResponse, Error> {
        let reply = self.exchange(Verb::Set, key, flags, Some(payload), fh).await?;
        Ok(write_response(reply))
    }

    /// `md` — deletes, or marks stale when the flags say so.
    pub(crate) async fn meta_delete(
        &self,
        key: &Key,
        flags: &RequestFlags,
        fh: &FailureHandling,
    ) -> Result<WriteResponse, Error> {
        let reply = self.exchange(Verb::Delete, key, flags, None, fh).await?;
        Ok(write_response(reply))
    }

    /// `ma` — increments or decrements, optionally auto-vivifying and
    /// returning the new value.
    pub(crate) async fn meta_arithmetic(
        &self,
        key: &Key,
        flags: &RequestFlags,
        fh: &FailureHandling,
    ) -> Result<ArithmeticResponse, Error> {
        let reply = self.exchange(Verb::Arithmetic, key, flags, None, fh).await?;
        Ok(arithmetic_response(reply))
    }

    /// Pipelined `mg` fan-out. Returns one result per key, in key
    /// order. Batches are pipelined per server and run concurrently
    /// across servers; a failed batch is retried on the gutter tier
    /// when one is configured.
    pub(crate) async fn meta_multiget(
        &self,
        keys: &[Key],
        flags: &RequestFlags,
    ) -> Vec<Result<ReadResponse, Error>> {
        let mut results: Vec<Option<Result<ReadResponse, Error>>> =
            (0..keys.len()).map(|_| None).collect();

        let groups = self.router.group_primary(keys, 0..keys.len());
        let outcomes = run_batches(keys, flags, groups).await;

        let mut failed: Vec<usize> = Vec::new();
        for (indices, outcome) in outcomes {
            match outcome {
                Ok(replies) => {
                    for (index, reply) in indices.into_iter().zip(replies) {
                        match reply {
                            Ok(MetaReply::ServerError(msg)) => {
                                results[index] = Some(Err(Error::Server(msg)))
                            }
                            Ok(reply) => results[index] = Some(Ok(read_response(reply))),
                            Err(e) if e.is_server_class() && self.router.has_gutter() => {
                                failed.push(index);
                                results[index] = Some(Err(e));
                            }
                            Err(e) => results[index] = Some(Err(e)),
                        }
                    }
                }
                Err(e) if e.is_server_class() && self.router.has_gutter() => {
                    tracing::debug!(error = %e, "multiget batch failed, retrying on gutter");
                    failed.extend(indices.iter().copied());
                    for index in indices {
                        results[index] = Some(Err(Error::Server("batch failed".to_string())));
                    }
                }
                Err(e) => {
                    let msg = e.to_string();
                    for index in indices {
                        results[index] = Some(Err(Error::Server(msg.clone())));
                    }
                }
            }
        }

        if !failed.is_empty() {
            failed.sort_unstable();
            if let Some(groups) = self.router.group_gutter(keys, failed.iter().copied()) {
                let gutter_flags = self.gutterize(Verb::Get, flags);
                let outcomes = run_batches(keys, &gutter_flags, groups).await;
                for (indices, outcome) in outcomes {
                    match outcome {
                        Ok(replies) => {
                            for (index, reply) in indices.into_iter().zip(replies) {
                                match reply {
                                    Ok(MetaReply::ServerError(msg)) => {
                                        results[index] = Some(Err(Error::Server(msg)))
                                    }
                                    Ok(reply) => results[index] = Some(Ok(read_response(reply))),
                                    Err(e) => results[index] = Some(Err(e)),
                                }
                            }
                        }
                        Err(e) => {
                            let msg = e.to_string();
                            for index in indices {
                                results[index] = Some(Err(Error::Server(msg.clone())));
                            }
                        }
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(Error::Server("key not routed".to_string()))))
            .collect()
    }

    /// One request/reply cycle with gutter fallback and write-failure
    /// accounting.
    async fn exchange(
        &self,
        verb: Verb,
        key: &Key,
        flags: &RequestFlags,
        payload: Option<&[u8]>,
        fh: &FailureHandling,
    ) -> Result<MetaReply, Error> {
        let pool = self.router.primary_pool(key);
        let request = encode_verb(verb, key, flags, payload);
        let mut result = executor::execute(&pool, &request, flags.no_reply).await;

        if let Err(e) = &result {
            if e.is_server_class() {
                if let Some(gutter) = self.router.gutter_pool(key) {
                    tracing::debug!(server = %pool.addr(), error = %e, "retrying on gutter pool");
                    let gutter_flags = self.gutterize(verb, flags);
                    let request = encode_verb(verb, key, &gutter_flags, payload);
                    result = executor::execute(&gutter, &request, gutter_flags.no_reply).await;
                }
            }
        }

        if verb.is_write_class() && fh.track_write_failures {
            if let Err(e) = &result {
                if e.is_server_class() {
                    self.router.emit_write_failure(key);
                }
            }
        }

        result
    }

    /// Rewrites flags for a gutter attempt: state created on the gutter
    /// tier must not outlive the outage, so TTLs are clamped to
    /// `gutter_ttl`. Writes with no TTL (never expires) get the gutter
    /// TTL outright; reads only clamp TTLs they already carry.
    fn gutterize(&self, verb: Verb, flags: &RequestFlags) -> RequestFlags {
        let ceiling = self.router.gutter_ttl();
        let clamp = |ttl: u32| if ttl == 0 { ceiling } else { ttl.min(ceiling) };

        let mut flags = flags.clone();
        match verb {
            Verb::Set => {
                flags.cache_ttl = Some(flags.cache_ttl.map_or(ceiling, clamp));
            }
            Verb::Get | Verb::Delete | Verb::Arithmetic => {
                flags.cache_ttl = flags.cache_ttl.map(clamp);
            }
        }
        flags.vivify_on_miss_ttl = flags.vivify_on_miss_ttl.map(clamp);
        flags
    }
}

async fn run_batches(
    keys: &[Key],
    flags: &RequestFlags,
    groups: Vec<(Arc<ConnectionPool>, Vec<usize>)>,
) -> Vec<(Vec<usize>, Result<Vec<Result<MetaReply, Error>>, Error>)> {
    let batches: Vec<_> = groups
        .into_iter()
        .map(|(pool, indices)| {
            let request = encode::meta_multiget(indices.iter().map(|&i| &keys[i]), flags);
            async move {
                let outcome = executor::execute_pipeline(&pool, &request, indices.len()).await;
                (indices, outcome)
            }
        })
        .collect();
    join_all(batches).await
}

fn encode_verb(
    verb: Verb,
    key: &Key,
    flags: &RequestFlags,
    payload: Option<&[u8]>,
) -> bytes::BytesMut {
    match verb {
        Verb::Get => encode::meta_get(key, flags),
        Verb::Set => encode::meta_set(key, flags, payload.unwrap_or_default()),
        Verb::Delete => encode::meta_delete(key, flags),
        Verb::Arithmetic => encode::meta_arithmetic(key, flags),
    }
}

fn read_response(reply: MetaReply) -> ReadResponse {
    match reply {
        MetaReply::Success(flags) => ReadResponse::Success { flags },
        MetaReply::Value { flags, data } => ReadResponse::Value { flags, data },
        MetaReply::Miss(_) | MetaReply::NotStored(_) | MetaReply::Conflict(_) => ReadResponse::Miss,
        // ServerError replies were turned into errors by the executor.
        MetaReply::ServerError(_) => ReadResponse::Miss,
    }
}

fn write_response(reply: MetaReply) -> WriteResponse {
    match reply {
        MetaReply::Success(flags) => WriteResponse::Success { flags },
        MetaReply::Value { flags, .. } => WriteResponse::Success { flags },
        MetaReply::NotStored(_) => WriteResponse::NotStored,
        MetaReply::Conflict(_) => WriteResponse::Conflict,
        MetaReply::Miss(_) => WriteResponse::Miss,
        MetaReply::ServerError(_) => WriteResponse::Miss,
    }
}

fn arithmetic_response(reply: MetaReply) -> ArithmeticResponse {
    match reply {
        MetaReply::Success(flags) => ArithmeticResponse::Success { flags, value: None },
        MetaReply::Value { flags, data } => ArithmeticResponse::Success {
            flags,
            value: Some(data),
        },
        MetaReply::NotStored(_) => ArithmeticResponse::NotStored,
        MetaReply::Conflict(_) => ArithmeticResponse::Conflict,
        MetaReply::Miss(_) => ArithmeticResponse::Miss,
        MetaReply::ServerError(_) => ArithmeticResponse::Miss,
    }
}
