//! A single buffered connection to one server.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

use crate::error::Error;
use crate::key::ServerAddress;
use crate::pool::PoolConfig;
use crate::proto::parse::parse_meta_reply;
use crate::proto::MetaReply;

/// Transport requirements for a cache connection. Anything async-readable
/// and writable works: plain TCP, TLS wrappers, in-process test duplexes.
pub trait CacheStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> CacheStream for T {}

/// Opens transport streams to servers. Injected at client construction;
/// TLS and other transports live behind this seam.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Establishes a stream to `addr` within the configured connect
    /// timeout.
    async fn connect(
        &self,
        addr: &ServerAddress,
        config: &PoolConfig,
    ) -> Result<Box<dyn CacheStream>, Error>;
}

/// The stock TCP factory.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpSocketFactory;

#[async_trait]
impl SocketFactory for TcpSocketFactory {
    async fn connect(
        &self,
        addr: &ServerAddress,
        config: &PoolConfig,
    ) -> Result<Box<dyn CacheStream>, Error> {
        let stream = timeout(config.connection_timeout(), open_tcp(addr, config))
            .await
            .map_err(|_| {
                Error::Connect(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                ))
            })??;
        Ok(Box::new(stream))
    }
}

async fn open_tcp(addr: &ServerAddress, config: &PoolConfig) -> Result<TcpStream, Error> {
    let addrs = lookup_host((addr.host.as_str(), addr.port))
        .await
        .map_err(Error::Connect)?
        .collect::<Vec<SocketAddr>>();

    let mut last_err = None;

    for candidate in addrs {
        match TcpStream::connect(candidate).await {
            Ok(stream) => {
                stream.set_nodelay(config.no_delay).map_err(Error::Connect)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(Error::Connect(e)),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        Error::Connect(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} did not resolve to any address", addr),
        ))
    }))
}

/// One socket plus a reusable read buffer.
///
/// Requests are serialized by the caller into a single buffer and go out
/// in one `write_all`, letting the server coalesce. Replies are pulled
/// through the streaming parser against `buf`; the consumed prefix is
/// discarded lazily on the next read so returned payloads can be sliced
/// out first.
///
/// Any I/O error, timeout, EOF mid-reply or parse failure poisons the
/// connection: its reply stream is no longer known to be at a clean
/// boundary, so the pool will close it instead of reusing it.
pub struct Connection {
    stream: Box<dyn CacheStream>,
    buf: BytesMut,
    last_read_n: Option<usize>,
    config: PoolConfig,
    poisoned: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("buf_len", &self.buf.len())
            .field("last_read_n", &self.last_read_n)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl Connection {
    /// Opens a connection through the given factory.
    pub(crate) async fn open(
        addr: &ServerAddress,
        factory: &dyn SocketFactory,
        config: &PoolConfig,
    ) -> Result<Connection, Error> {
        let stream = factory.connect(addr, config).await?;
        Ok(Connection {
            stream,
            buf: BytesMut::with_capacity(config.read_buffer_size),
            last_read_n: None,
            config: config.clone(),
            poisoned: false,
        })
    }

    /// Writes a whole request buffer in one go.
    pub(crate) async fn send(&mut self, request: &[u8]) -> Result<(), Error> {
        let send_timeout = self.config.connection_timeout();
        let stream = &mut self.stream;
        let result = timeout(send_timeout, async move {
            stream.write_all(request).await?;
            stream.flush().await
        })
        .await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.poison();
                Err(e.into())
            }
            Err(_) => {
                self.poison();
                Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "send timed out",
                )))
            }
        }
    }

    /// Reads exactly one reply. Must be called once per expected reply,
    /// in order, before the connection goes back to the pool.
    pub(crate) async fn read_reply(&mut self) -> Result<MetaReply, Error> {
        // Advance past the previous reply only now: its payload may have
        // been borrowed until the caller copied it out.
        if let Some(n) = self.last_read_n.take() {
            let _ = self.buf.split_to(n);
        }

        let mut needs_more_data = false;
        loop {
            if self.buf.is_empty() || needs_more_data {
                self.fill_buf().await?;
                needs_more_data = false;
            }

            match parse_meta_reply(&self.buf) {
                Ok(Some((n, reply))) => {
                    self.last_read_n = Some(n);
                    return Ok(reply);
                }
                Ok(None) => {
                    needs_more_data = true;
                }
                Err(reason) => {
                    self.poison();
                    return Err(Error::Protocol(reason));
                }
            }
        }
    }

    async fn fill_buf(&mut self) -> Result<(), Error> {
        self.buf.reserve(self.config.read_buffer_size);
        let result = timeout(self.config.recv_timeout(), self.stream.read_buf(&mut self.buf)).await;
        match result {
            Ok(Ok(0)) => {
                self.poison();
                Err(Error::Io(io::ErrorKind::UnexpectedEof.into()))
            }
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                self.poison();
                Err(e.into())
            }
            Err(_) => {
                self.poison();
                Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "recv timed out",
                )))
            }
        }
    }

    /// Marks the reply stream as unusable.
    pub(crate) fn poison(&mut self) {
        self.poisoned = true;
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PoolConfig {
        PoolConfig {
            recv_timeout: 0.2,
            ..PoolConfig::default()
        }
    }

    async fn connected_pair() -> (Connection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        let conn = Connection {
            stream: Box::new(client),
            buf: BytesMut::with_capacity(64),
            last_read_n: None,
            config: test_config(),
            poisoned: false,
        };
        (conn, server)
    }

    #[tokio::test]
    async fn test_read_reply_across_split_chunks() {
        let (mut conn, mut server) = connected_pair().await;
        server.write_all(b"VA 10\r\ntest-").await.unwrap();
        let pending = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            server.write_all(b"value\r\n").await.unwrap();
            server
        });
        let reply = conn.read_reply().await.unwrap();
        match reply {
            MetaReply::Value { data, .. } => assert_eq!(data, b"test-value"),
            other => panic!("expected value, got {:?}", other),
        }
        assert!(!conn.is_poisoned());
        drop(pending.await.unwrap());
    }

    #[tokio::test]
    async fn test_pipelined_replies_read_in_order() {
        let (mut conn, mut server) = connected_pair().await;
        server.write_all(b"HD\r\nEN\r\nVA 1\r\nx\r\n").await.unwrap();
        assert!(matches!(conn.read_reply().await.unwrap(), MetaReply::Success(_)));
        assert!(matches!(conn.read_reply().await.unwrap(), MetaReply::Miss(_)));
        assert!(matches!(
            conn.read_reply().await.unwrap(),
            MetaReply::Value { .. }
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_reply_poisons() {
        let (mut conn, mut server) = connected_pair().await;
        server.write_all(b"VA 10\r\ntest-").await.unwrap();
        drop(server);
        assert!(conn.read_reply().await.is_err());
        assert!(conn.is_poisoned());
    }

    #[tokio::test]
    async fn test_recv_timeout_poisons() {
        let (mut conn, _server) = connected_pair().await;
        let err = conn.read_reply().await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(conn.is_poisoned());
    }

    #[tokio::test]
    async fn test_parse_failure_poisons() {
        let (mut conn, mut server) = connected_pair().await;
        server.write_all(b"CLIENT_ERROR bad data chunk\r\n").await.unwrap();
        let err = conn.read_reply().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(conn.is_poisoned());
    }

    #[tokio::test]
    async fn test_server_error_does_not_poison() {
        let (mut conn, mut server) = connected_pair().await;
        server.write_all(b"SERVER_ERROR oom\r\n").await.unwrap();
        let reply = conn.read_reply().await.unwrap();
        assert_eq!(reply, MetaReply::ServerError("oom".to_string()));
        assert!(!conn.is_poisoned());
    }
}
