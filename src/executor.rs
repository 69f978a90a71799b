//! Borrow a connection, run one exchange, give the connection back.
//!
//! The executor is deliberately thin: encoding happened upstream and
//! interpretation happens downstream. Its one responsibility is pairing
//! every acquired connection with exactly one release, with the reply
//! fully parsed (or the connection poisoned) in between.

use crate::connection::Connection;
use crate::error::Error;
use crate::pool::ConnectionPool;
use crate::proto::{MetaReply, ResponseFlags};

/// Writes one request and reads its reply. With `no_reply` the request
/// carried `q`: nothing comes back on success, so a synthetic Success is
/// returned without reading.
pub(crate) async fn execute(
    pool: &ConnectionPool,
    request: &[u8],
    no_reply: bool,
) -> Result<MetaReply, Error> {
    let mut conn = pool.acquire().await?;
    let result = exchange(&mut conn, request, no_reply).await;
    pool.release(conn);
    result
}

async fn exchange(
    conn: &mut Connection,
    request: &[u8],
    no_reply: bool,
) -> Result<MetaReply, Error> {
    conn.send(request).await?;
    if no_reply {
        return Ok(MetaReply::Success(ResponseFlags::default()));
    }
    match conn.read_reply().await? {
        MetaReply::ServerError(msg) => Err(Error::Server(msg)),
        reply => Ok(reply),
    }
}

/// Writes a pipelined batch in one buffer and reads `count` replies in
/// request order. A failed read loses the framing for everything behind
/// it, so the rest of the batch is reported as server errors and the
/// (already poisoned) connection goes back for closure.
///
/// The outer `Err` covers failures before any reply could be read
/// (acquire or send); then the whole batch failed together.
pub(crate) async fn execute_pipeline(
    pool: &ConnectionPool,
    request: &[u8],
    count: usize,
) -> Result<Vec<Result<MetaReply, Error>>, Error> {
    let mut conn = pool.acquire().await?;

    if let Err(e) = conn.send(request).await {
        pool.release(conn);
        return Err(e);
    }

    let mut replies = Vec::with_capacity(count);
    for i in 0..count {
        match conn.read_reply().await {
            Ok(MetaReply::ServerError(msg)) => replies.push(Err(Error::Server(msg))),
            Ok(reply) => replies.push(Ok(reply)),
            Err(e) => {
                replies.push(Err(e));
                for _ in i + 1..count {
                    replies.push(Err(Error::Server(
                        "pipelined batch aborted after earlier failure".to_string(),
                    )));
                }
                break;
            }
        }
    }

    pool.release(conn);
    Ok(replies)
}
