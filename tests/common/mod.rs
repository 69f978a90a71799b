//! A scripted in-process memcached stand-in.
//!
//! The server understands just enough meta-protocol framing to pull one
//! request at a time off the socket (`ms` payloads are consumed via the
//! declared `S<size>`), records every request it saw, and answers each
//! one with the next canned reply from the script. An empty reply step
//! means "stay silent", which is what a `q`-flagged request expects.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use meta_memcached::ServerAddress;

pub struct MockServer {
    addr: ServerAddress,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    handle: JoinHandle<()>,
}

impl MockServer {
    /// Starts a server that replies with `replies` in order, across all
    /// requests on all connections.
    pub async fn start(replies: Vec<Vec<u8>>) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let port = listener.local_addr().expect("mock server addr").port();

        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let script: Arc<Mutex<VecDeque<Vec<u8>>>> = Arc::new(Mutex::new(replies.into()));

        let received_task = Arc::clone(&received);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let received = Arc::clone(&received_task);
                let script = Arc::clone(&script);
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut reader = BufReader::new(read_half);
                    while let Ok(Some(request)) = read_request(&mut reader).await {
                        received.lock().unwrap().push(request);
                        let reply = script.lock().unwrap().pop_front();
                        match reply {
                            Some(reply) if !reply.is_empty() => {
                                if write_half.write_all(&reply).await.is_err() {
                                    break;
                                }
                            }
                            Some(_) => {} // scripted silence (no-reply step)
                            None => break,
                        }
                    }
                });
            }
        });

        MockServer {
            addr: ServerAddress::new("127.0.0.1", port),
            received,
            handle,
        }
    }

    pub fn addr(&self) -> ServerAddress {
        self.addr.clone()
    }

    /// Everything received so far, one entry per framed request.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    /// Polls until `count` requests arrived or a short deadline passes.
    pub async fn wait_for_requests(&self, count: usize) -> Vec<Vec<u8>> {
        for _ in 0..100 {
            let seen = self.received();
            if seen.len() >= count {
                return seen;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        self.received()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Binds and immediately releases a port, yielding an address that
/// refuses connections.
pub async fn refused_addr() -> ServerAddress {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind probe");
    let port = listener.local_addr().expect("probe addr").port();
    drop(listener);
    ServerAddress::new("127.0.0.1", port)
}

async fn read_request<R>(reader: &mut BufReader<R>) -> std::io::Result<Option<Vec<u8>>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }

    let mut request = line.clone();
    if line.starts_with(b"ms ") {
        let header = String::from_utf8_lossy(&line);
        let size = header
            .split_whitespace()
            .find_map(|token| token.strip_prefix('S').and_then(|d| d.parse::<usize>().ok()))
            .unwrap_or(0);
        let mut payload = vec![0u8; size + 2];
        reader.read_exact(&mut payload).await?;
        request.extend_from_slice(&payload);
    }

    Ok(Some(request))
}
