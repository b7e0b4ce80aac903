//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses and writing
//! them to a connection. The head is serialised into a single buffer; the
//! body is then streamed according to its [`Body`] variant.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{Body, Headers, StatusCode};

/// An HTTP/1.1 response, ready to be written to a connection.
///
/// # Examples
///
/// ```
/// use teecache::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let head = response.head_bytes();
/// let text = std::str::from_utf8(&head).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Empty,
            keep_alive: true,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::from(body.into());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::from(body.into());
        self
    }

    /// Sets a streaming or file-backed body.
    #[must_use]
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response body.
    pub fn body_ref(&self) -> &Body {
        &self.body
    }

    /// Consumes the response and returns its body.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Returns `true` if the connection may be reused after this response.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Serializes the status line and headers.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is in memory and
    ///   non-empty and no `Content-Type` header was set.
    /// - `Content-Length: <n>` when the body length is known, otherwise
    ///   `Transfer-Encoding: chunked`.
    /// - `Connection: keep-alive` or `Connection: close`.
    pub fn head_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        if matches!(self.body, Body::Full(_)) && !self.headers.contains("content-type") {
            buf.put(&b"Content-Type: text/plain; charset=utf-8\r\n"[..]);
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        buf.put(format!("Connection: {connection}\r\n").as_bytes());

        match self.body.len() {
            Some(len) => buf.put(format!("Content-Length: {len}\r\n").as_bytes()),
            None => buf.put(&b"Transfer-Encoding: chunked\r\n"[..]),
        }

        buf.put(&b"\r\n"[..]);
        buf
    }

    /// Writes the complete response to `out`, returning the number of body
    /// bytes written.
    ///
    /// # Errors
    ///
    /// Any error here leaves the peer with a partial response; the caller
    /// must close the connection.
    pub async fn write_to<W>(self, out: &mut W) -> std::io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        out.write_all(&self.head_bytes()).await?;
        let written = self.body.write_to(out).await?;
        out.flush().await?;
        Ok(written)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
