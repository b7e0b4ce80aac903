//! Uncached relay for POST, PUT and DELETE.

use std::io;

use bytes::Bytes;
use tracing::{debug, warn};

use super::{CONTENT_TYPE, ProxyError};
use crate::http::{Body, BodySender, Method, Response, StatusCode};
use crate::origin::{Origin, OriginBody};

/// Forwards `method target` with the inbound body and streams the origin's
/// body back. The cache is never consulted or written. A client that stops
/// reading for longer than the origin timeout ends the relay.
///
/// # Errors
///
/// Fails with a gateway error when the origin cannot be reached or returns
/// an unusable head.
pub async fn relay(
    origin: &Origin,
    method: &Method,
    target: &str,
    body: &Bytes,
) -> Result<Response, ProxyError> {
    let fetched = origin.fetch(method, target, body).await?;
    debug!(%method, target, status = fetched.status, "relaying origin response");

    let (client, out) = Body::channel(fetched.body.len());
    let client = client.stall_timeout(origin.timeout());
    tokio::spawn(pump(fetched.body, client));

    Ok(Response::new(StatusCode::Ok)
        .header("Content-Type", CONTENT_TYPE)
        .with_body(out))
}

// Unlike a cache fill there is nothing to finish once the client is gone.
async fn pump(mut origin: OriginBody, client: BodySender) {
    loop {
        match origin.next_chunk().await {
            Ok(Some(chunk)) => {
                if client.send(chunk).await.is_err() {
                    debug!(received = origin.received(), "client went away, dropping origin connection");
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "origin failed mid-relay");
                client.abort(io::Error::other(e.to_string()));
                return;
            }
        }
    }
}
