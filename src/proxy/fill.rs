//! Read-through GET: serve from the cache, or fetch from the origin while
//! filling the cache in the same pass.

use std::io;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::tee::{Tee, TeeError};
use super::{CONTENT_TYPE, ProxyError};
use crate::cache::{CacheError, CacheKey, CacheStore, EntryWriter};
use crate::http::{Body, BodySender, Method, Response, StatusCode};
use crate::origin::{Origin, OriginBody};

/// How a GET was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Hit,
    Miss,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Hit => "HIT",
            Outcome::Miss => "MISS",
        }
    }
}

/// What the background fill task ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillReport {
    /// Bytes committed to the cache, `None` if the entry was discarded.
    pub stored: Option<u64>,
    /// `true` if the client went away before the body was complete.
    pub client_detached: bool,
}

/// Answers a GET for `target`.
///
/// On a hit the entry is streamed from disk. On a miss the origin is fetched
/// first, then a cache writer is opened, and a background task tees the
/// origin body into both. The task outlives the client connection, so the
/// entry is completed even if the client disconnects. A client that stays
/// connected but stops reading is detached after the origin timeout.
///
/// # Errors
///
/// Fails before any body byte is sent: origin errors become gateway errors,
/// cache errors become internal errors. No entry is left behind.
pub async fn serve(
    store: &CacheStore,
    origin: &Origin,
    target: &str,
) -> Result<(Response, Outcome), ProxyError> {
    let key = CacheKey::derive(target);

    if store.exists(&key).await {
        match store.open_read(&key).await {
            Ok(entry) => {
                debug!(%key, target, len = entry.len, "serving from cache");
                let body = Body::File {
                    file: entry.file,
                    len: entry.len,
                };
                return Ok((response(body, Outcome::Hit), Outcome::Hit));
            }
            // Removed between the check and the open: treat as a miss.
            Err(CacheError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }

    let fetched = origin.fetch(&Method::Get, target, &Bytes::new()).await?;
    let writer = store.open_write(&key).await?;
    debug!(%key, target, status = fetched.status, "cache miss, filling from origin");

    let (client, body) = Body::channel(fetched.body.len());
    let client = client.stall_timeout(origin.timeout());
    tokio::spawn(fill(key, fetched.body, writer, client));

    Ok((response(body, Outcome::Miss), Outcome::Miss))
}

fn response(body: Body, outcome: Outcome) -> Response {
    Response::new(StatusCode::Ok)
        .header("Content-Type", CONTENT_TYPE)
        .header("X-Cache", outcome.as_str())
        .with_body(body)
}

/// Copies the origin body into the cache entry and the client stream.
///
/// The entry is committed only when the origin body completed and every
/// store write succeeded; otherwise the staged file is dropped.
pub(crate) async fn fill(
    key: CacheKey,
    mut origin: OriginBody,
    writer: EntryWriter,
    client: BodySender,
) -> FillReport {
    let mut tee = Tee::new(writer, client);

    loop {
        let chunk = match origin.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                warn!(%key, error = %e, received = origin.received(), "origin failed mid-body, entry discarded");
                return abandon(tee, io::Error::other(e.to_string()));
            }
        };

        match tee.write(&chunk).await {
            Ok(()) => {}
            Err(TeeError::Client(e)) => {
                debug!(%key, error = %e, "client detached, continuing cache fill");
            }
            Err(TeeError::Store(e)) => {
                warn!(%key, error = %e, "cache write failed, entry discarded");
                return abandon(tee, io::Error::other(e.to_string()));
            }
        }
    }

    let client_detached = !tee.client_attached();
    let (writer, client) = tee.into_parts();
    match writer.commit().await {
        Ok(bytes) => {
            info!(%key, bytes, client_detached, "cache entry stored");
            FillReport {
                stored: Some(bytes),
                client_detached,
            }
        }
        Err(e) => {
            warn!(%key, error = %e, "cache commit failed");
            if let Some(client) = client {
                client.abort(io::Error::other(e.to_string()));
            }
            FillReport {
                stored: None,
                client_detached,
            }
        }
    }
}

fn abandon(tee: Tee<EntryWriter, BodySender>, error: io::Error) -> FillReport {
    let (writer, client) = tee.into_parts();
    // Dropping the writer removes the staged file.
    drop(writer);
    let client_detached = client.is_none();
    if let Some(client) = client {
        client.abort(error);
    }
    FillReport {
        stored: None,
        client_detached,
    }
}
