//! A Tokio-based memcached client speaking the meta text protocol.
//!
//! The pipeline for one call: the high-level operation encodes its
//! value and policies into request flags, the meta layer routes the key
//! through a ketama ring to a per-server connection pool, the executor
//! leases a connection, writes the command as a single line and parses
//! the typed reply, and the high-level layer interprets the reply flags
//! (CAS, win/lose, staleness) into the caller's result.
//!
//! Herd control is protocol-level: recache windows (`R`) elect one
//! refresher per expiring hot key, leases (`N`) elect one populator per
//! missing key, and stale-marking deletes (`I`) keep readers served
//! while a writer refreshes. Partial failure is absorbed by fast
//! mark-down of unreachable servers and an optional "gutter" fallback
//! tier with shortened TTLs.
//!
//! ```no_run
//! use meta_memcached::{CacheClient, Key, ServerAddress};
//!
//! # async fn demo() -> Result<(), meta_memcached::Error> {
//! let client = CacheClient::builder(vec![ServerAddress::parse("127.0.0.1:11211")?])
//!     .build()
//!     .await?;
//!
//! client.set(&Key::from("greeting"), "hello", 60).await?;
//! let value = client.get(&Key::from("greeting")).await?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;
mod error;
mod executor;
mod key;
mod meta;
mod pool;
mod proto;
mod ring;
mod router;
mod value;

pub use self::client::{
    CacheClient, CacheClientBuilder, ClientConfig, DeleteOptions, LeasePolicy, RecachePolicy,
    SetOptions, StalePolicy,
};
pub use self::connection::{CacheStream, SocketFactory, TcpSocketFactory};
pub use self::error::Error;
pub use self::key::{Key, ServerAddress, MAX_KEY_LENGTH};
pub use self::pool::{PoolConfig, PoolCounters};
pub use self::proto::{
    ArithMode, ArithmeticResponse, ReadResponse, RequestFlags, ResponseFlags, SetMode,
    WriteResponse,
};
pub use self::ring::Ring;
pub use self::router::FailureHandling;
pub use self::value::{CacheValue, DefaultCodec, ValueCodec, ValueKind};
