//! Origin fetcher.
//!
//! Issues one HTTP/1.1 request per call over a fresh TCP connection
//! (`Connection: close`) and hands back the response body as a pull-based
//! stream. Status codes are reported but not interpreted: a 404 or 500 body
//! is streamed like any other. Interim 1xx responses are skipped and up to
//! [`MAX_REDIRECTS`] redirects are followed, so the body handed back is the
//! final resource's.

pub mod codec;

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use url::{Host, Url};

use crate::http::{Headers, Method};
use codec::{ChunkedDecoder, CodecError, Decoded, Framing};

/// Read size used for origin sockets.
const READ_BUF_SIZE: usize = 16 * 1024;

/// Redirects followed by one fetch before it fails.
pub const MAX_REDIRECTS: usize = 10;

/// Errors produced while talking to the origin.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The connection could not be established or the request not sent.
    #[error("origin {origin} unreachable: {source}")]
    Unreachable {
        origin: String,
        #[source]
        source: io::Error,
    },

    #[error("origin {origin} timed out while {stage}")]
    Timeout { origin: String, stage: &'static str },

    /// The transport failed after the request was sent.
    #[error("error reading from origin {origin}: {source}")]
    Upstream {
        origin: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid response from origin {origin}: {source}")]
    InvalidResponse {
        origin: String,
        #[source]
        source: CodecError,
    },

    #[error("origin {origin} redirected more than {limit} times")]
    TooManyRedirects { origin: String, limit: usize },
}

/// The upstream host requests are forwarded to.
#[derive(Debug, Clone)]
pub struct Origin {
    /// Host as passed to `connect` (IPv6 without brackets).
    connect_host: String,
    port: u16,
    /// `Host` header value.
    authority: String,
    timeout: Duration,
}

impl Origin {
    /// Creates an origin reachable at `host:port`.
    ///
    /// `timeout` bounds connecting, sending the request, receiving the
    /// response head, and every individual body read.
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        let connect_host = host.into();
        let bracketed = if connect_host.contains(':') {
            format!("[{connect_host}]")
        } else {
            connect_host.clone()
        };
        let authority = if port == 80 {
            bracketed
        } else {
            format!("{bracketed}:{port}")
        };
        Self {
            connect_host,
            port,
            authority,
            timeout,
        }
    }

    /// Builds an origin from the host and port of an `http` URL.
    ///
    /// Returns `None` for other schemes and for URLs without a host.
    pub fn from_url(url: &Url, timeout: Duration) -> Option<Self> {
        if url.scheme() != "http" {
            return None;
        }
        let host = match url.host()? {
            Host::Domain(domain) => domain.to_owned(),
            Host::Ipv4(addr) => addr.to_string(),
            Host::Ipv6(addr) => addr.to_string(),
        };
        let port = url.port_or_known_default().unwrap_or(80);
        Some(Self::new(host, port, timeout))
    }

    /// Returns the bound applied to each origin I/O step.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the `host[:port]` this origin is addressed by.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Returns the absolute URL for `target` on this origin.
    pub fn url_for(&self, target: &str) -> String {
        format!("http://{}{target}", self.authority)
    }

    async fn bounded<T>(
        &self,
        stage: &'static str,
        fut: impl Future<Output = io::Result<T>>,
        wrap: fn(String, io::Error) -> FetchError,
    ) -> Result<T, FetchError> {
        match timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(wrap(self.authority.clone(), source)),
            Err(_) => Err(FetchError::Timeout {
                origin: self.authority.clone(),
                stage,
            }),
        }
    }

    fn invalid(&self, source: CodecError) -> FetchError {
        FetchError::InvalidResponse {
            origin: self.authority.clone(),
            source,
        }
    }

    /// Sends `method target` with an optional body and waits for the final
    /// response head.
    ///
    /// Redirects (301, 302, 303, 307, 308) are followed to any `http` host,
    /// at most [`MAX_REDIRECTS`] times. 301, 302 and 303 re-issue a non-HEAD
    /// request as a bodiless GET; 307 and 308 repeat it unchanged. A redirect
    /// whose `Location` is missing, unparsable or not `http` is returned as
    /// the response.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Unreachable`] if connecting or sending fails.
    /// - [`FetchError::Upstream`] if the connection breaks before a complete head arrives.
    /// - [`FetchError::InvalidResponse`] if the head cannot be parsed.
    /// - [`FetchError::Timeout`] if any stage exceeds the configured bound.
    /// - [`FetchError::TooManyRedirects`] past the redirect limit.
    pub async fn fetch(
        &self,
        method: &Method,
        target: &str,
        body: &Bytes,
    ) -> Result<OriginResponse, FetchError> {
        let mut hop = Hop {
            origin: self.clone(),
            method: method.clone(),
            target: target.to_owned(),
            body: body.clone(),
        };
        let mut redirects = 0;
        loop {
            let response = hop.origin.exchange(&hop.method, &hop.target, &hop.body).await?;
            let Some(next) = hop.follow(&response) else {
                return Ok(response);
            };
            if redirects == MAX_REDIRECTS {
                return Err(FetchError::TooManyRedirects {
                    origin: self.authority.clone(),
                    limit: MAX_REDIRECTS,
                });
            }
            redirects += 1;
            debug!(
                status = response.status,
                from = %hop.origin.url_for(&hop.target),
                to = %next.origin.url_for(&next.target),
                "following redirect"
            );
            hop = next;
        }
    }

    /// One request/response exchange on a fresh connection.
    async fn exchange(
        &self,
        method: &Method,
        target: &str,
        body: &Bytes,
    ) -> Result<OriginResponse, FetchError> {
        let unreachable: fn(String, io::Error) -> FetchError =
            |origin, source| FetchError::Unreachable { origin, source };
        let upstream: fn(String, io::Error) -> FetchError =
            |origin, source| FetchError::Upstream { origin, source };

        let mut stream = self
            .bounded(
                "connecting",
                TcpStream::connect((self.connect_host.as_str(), self.port)),
                unreachable,
            )
            .await?;
        stream.set_nodelay(true).ok();

        let mut head = BytesMut::with_capacity(256 + body.len());
        head.put(format!("{method} {target} HTTP/1.1\r\n").as_bytes());
        head.put(format!("Host: {}\r\n", self.authority).as_bytes());
        head.put(&b"Connection: close\r\n"[..]);
        if !body.is_empty() || matches!(method, Method::Post | Method::Put) {
            head.put(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
        head.put(&b"\r\n"[..]);
        head.put(body.as_ref());

        self.bounded("sending request", stream.write_all(&head), unreachable)
            .await?;

        let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
        let (head, head_len) = loop {
            if let Some((head, len)) = codec::parse_head(&buf).map_err(|e| self.invalid(e))? {
                if !head.is_interim() {
                    break (head, len);
                }
                debug!(origin = %self.authority, status = head.status, "skipping interim response");
                let _ = buf.split_to(len);
                continue;
            }
            buf.reserve(READ_BUF_SIZE);
            let read = self
                .bounded("reading response head", stream.read_buf(&mut buf), upstream)
                .await?;
            if read == 0 {
                return Err(FetchError::Upstream {
                    origin: self.authority.clone(),
                    source: io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before response head",
                    ),
                });
            }
        };
        let _ = buf.split_to(head_len);

        let framing = Framing::for_response(method, &head).map_err(|e| self.invalid(e))?;
        debug!(
            origin = %self.authority,
            %method,
            target,
            status = head.status,
            ?framing,
            "origin responded"
        );

        Ok(OriginResponse {
            status: head.status,
            headers: head.headers,
            body: OriginBody::new(self.clone(), stream, buf, framing),
        })
    }
}

/// A request as sent on one leg of a redirect chain.
#[derive(Debug)]
struct Hop {
    origin: Origin,
    method: Method,
    target: String,
    body: Bytes,
}

impl Hop {
    /// The request a redirect `response` asks for, if it is one to follow.
    fn follow(&self, response: &OriginResponse) -> Option<Hop> {
        let keep_method = match response.status {
            301..=303 => false,
            307 | 308 => true,
            _ => return None,
        };
        let location = response.headers.get("location")?.trim();
        let base = Url::parse(&self.origin.url_for(&self.target)).ok()?;
        let next = base.join(location).ok()?;
        let origin = Origin::from_url(&next, self.origin.timeout)?;

        let mut target = next.path().to_owned();
        if let Some(query) = next.query() {
            target.push('?');
            target.push_str(query);
        }
        let (method, body) = if keep_method || self.method == Method::Head {
            (self.method.clone(), self.body.clone())
        } else {
            (Method::Get, Bytes::new())
        };
        Some(Hop {
            origin,
            method,
            target,
            body,
        })
    }
}

/// Response from the origin with its body not yet consumed.
#[derive(Debug)]
pub struct OriginResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: OriginBody,
}

#[derive(Debug)]
enum BodyState {
    Fixed(u64),
    Chunked(ChunkedDecoder),
    UntilClose,
    Done,
}

/// Single-use, sequential origin body stream. Dropping it closes the
/// connection.
#[derive(Debug)]
pub struct OriginBody {
    origin: Origin,
    stream: TcpStream,
    buf: BytesMut,
    state: BodyState,
    len: Option<u64>,
    received: u64,
}

impl OriginBody {
    fn new(origin: Origin, stream: TcpStream, buf: BytesMut, framing: Framing) -> Self {
        let (state, len) = match framing {
            Framing::Empty => (BodyState::Done, Some(0)),
            Framing::Fixed(0) => (BodyState::Done, Some(0)),
            Framing::Fixed(n) => (BodyState::Fixed(n), Some(n)),
            Framing::Chunked => (BodyState::Chunked(ChunkedDecoder::new()), None),
            Framing::UntilClose => (BodyState::UntilClose, None),
        };
        Self {
            origin,
            stream,
            buf,
            state,
            len,
            received: 0,
        }
    }

    /// Body length announced by the origin, if any.
    pub fn len(&self) -> Option<u64> {
        self.len
    }

    /// Returns `true` if the origin announced an empty body.
    pub fn is_empty(&self) -> bool {
        self.len == Some(0)
    }

    /// Payload bytes handed out so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    // Yields what can be produced from buffered bytes alone:
    // `Some(Some(chunk))`, `Some(None)` at end of body, `None` if a read is needed.
    fn take_buffered(&mut self) -> Result<Option<Option<Bytes>>, FetchError> {
        match &mut self.state {
            BodyState::Done => Ok(Some(None)),
            BodyState::Fixed(remaining) => {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let take = (*remaining).min(self.buf.len() as u64);
                let chunk = self.buf.split_to(take as usize).freeze();
                *remaining -= take;
                if *remaining == 0 {
                    self.state = BodyState::Done;
                }
                Ok(Some(Some(chunk)))
            }
            BodyState::UntilClose => {
                if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Some(self.buf.split().freeze())))
                }
            }
            BodyState::Chunked(decoder) => match decoder.decode(&mut self.buf) {
                Ok(Decoded::Data(chunk)) => Ok(Some(Some(chunk))),
                Ok(Decoded::End) => {
                    self.state = BodyState::Done;
                    Ok(Some(None))
                }
                Ok(Decoded::NeedMore) => Ok(None),
                Err(e) => Err(self.origin.invalid(e)),
            },
        }
    }

    /// Returns the next piece of the body, or `None` once it is complete.
    ///
    /// # Errors
    ///
    /// [`FetchError::Upstream`] if the connection fails or closes early,
    /// [`FetchError::Timeout`] if the origin stalls, and
    /// [`FetchError::InvalidResponse`] for broken chunked framing.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, FetchError> {
        loop {
            if let Some(next) = self.take_buffered()? {
                if let Some(chunk) = &next {
                    self.received += chunk.len() as u64;
                }
                return Ok(next);
            }

            self.buf.reserve(READ_BUF_SIZE);
            let read = self
                .origin
                .bounded(
                    "reading response body",
                    self.stream.read_buf(&mut self.buf),
                    |origin, source| FetchError::Upstream { origin, source },
                )
                .await?;
            if read == 0 {
                if matches!(self.state, BodyState::UntilClose) {
                    self.state = BodyState::Done;
                    return Ok(None);
                }
                return Err(FetchError::Upstream {
                    origin: self.origin.authority.clone(),
                    source: io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("connection closed after {} body bytes", self.received),
                    ),
                });
            }
        }
    }
}
