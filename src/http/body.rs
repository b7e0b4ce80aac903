//! Response bodies.
//!
//! A [`Body`] is either already in memory, an open cache file of known size,
//! or a stream of chunks fed through a bounded channel by another task. The
//! channel form is what lets a background task keep filling the cache after
//! the client has gone away, or stopped reading: the sender just starts
//! failing.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

/// Number of chunks buffered between a producer task and the connection.
const CHANNEL_CAPACITY: usize = 16;

/// A response body.
#[derive(Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    Full(Bytes),
    File { file: File, len: u64 },
    Stream(BodyStream),
}

/// Receiving half of a channel-fed body.
#[derive(Debug)]
pub struct BodyStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    len: Option<u64>,
    aborted: Arc<AtomicBool>,
}

/// Sending half of a channel-fed body.
#[derive(Debug, Clone)]
pub struct BodySender {
    tx: mpsc::Sender<io::Result<Bytes>>,
    aborted: Arc<AtomicBool>,
    stall: Option<Duration>,
}

fn receiver_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client body receiver closed")
}

impl BodySender {
    /// Fails [`send`](Self::send) once the channel has stayed full for
    /// `limit`, i.e. the connection stopped draining it.
    #[must_use]
    pub fn stall_timeout(mut self, limit: Duration) -> Self {
        self.stall = Some(limit);
        self
    }

    /// Queues `chunk` for the client.
    ///
    /// Fails with [`io::ErrorKind::BrokenPipe`] once the receiving connection
    /// has been dropped, and with [`io::ErrorKind::TimedOut`] when a stall
    /// timeout is set and the connection stopped reading. A timed-out body
    /// is aborted, so a client that resumes reading sees a truncation.
    pub async fn send(&self, chunk: Bytes) -> io::Result<()> {
        let Some(limit) = self.stall else {
            return self.tx.send(Ok(chunk)).await.map_err(|_| receiver_closed());
        };
        match self.tx.send_timeout(Ok(chunk), limit).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                self.aborted.store(true, Ordering::Release);
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("client stopped reading for {limit:?}"),
                ))
            }
            Err(SendTimeoutError::Closed(_)) => Err(receiver_closed()),
        }
    }

    /// Tells the connection the body cannot be completed. The connection is
    /// closed without a proper terminator so the client sees a truncation.
    ///
    /// Never waits: a full channel still ends in an error once the
    /// connection drains it.
    pub fn abort(&self, error: io::Error) {
        self.aborted.store(true, Ordering::Release);
        let _ = self.tx.try_send(Err(error));
    }
}

impl Body {
    /// Creates a channel-fed body. `len` is the exact number of bytes the
    /// producer promises to send, if known.
    pub fn channel(len: Option<u64>) -> (BodySender, Body) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let aborted = Arc::new(AtomicBool::new(false));
        let sender = BodySender {
            tx,
            aborted: Arc::clone(&aborted),
            stall: None,
        };
        (sender, Body::Stream(BodyStream { rx, len, aborted }))
    }

    /// Returns the body length if it is known up front.
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Full(bytes) => Some(bytes.len() as u64),
            Body::File { len, .. } => Some(*len),
            Body::Stream(stream) => stream.len,
        }
    }

    /// Returns `true` if the body is known to be empty.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Writes the body to `out`.
    ///
    /// Bodies of unknown length are framed with chunked transfer coding;
    /// everything else is written raw. Returns the number of payload bytes
    /// written.
    ///
    /// # Errors
    ///
    /// Propagates write errors, errors reported by the producer of a stream,
    /// and [`io::ErrorKind::UnexpectedEof`] when a stream or file ends before
    /// its announced length.
    pub async fn write_to<W>(self, out: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        match self {
            Body::Empty => Ok(0),
            Body::Full(bytes) => {
                out.write_all(&bytes).await?;
                Ok(bytes.len() as u64)
            }
            Body::File { file, len } => {
                let mut limited = file.take(len);
                let copied = tokio::io::copy(&mut limited, out).await?;
                check_length(copied, len)?;
                Ok(copied)
            }
            Body::Stream(BodyStream {
                mut rx,
                len,
                aborted,
            }) => {
                let mut total = 0u64;
                while let Some(chunk) = rx.recv().await {
                    let chunk = chunk?;
                    if chunk.is_empty() {
                        continue;
                    }
                    if len.is_some() {
                        out.write_all(&chunk).await?;
                    } else {
                        out.write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                            .await?;
                        out.write_all(&chunk).await?;
                        out.write_all(b"\r\n").await?;
                    }
                    total += chunk.len() as u64;
                }
                if aborted.load(Ordering::Acquire) {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "body producer aborted",
                    ));
                }
                match len {
                    Some(len) => check_length(total, len)?,
                    None => out.write_all(b"0\r\n\r\n").await?,
                }
                Ok(total)
            }
        }
    }
}

fn check_length(written: u64, expected: u64) -> io::Result<()> {
    if written == expected {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("body ended after {written} of {expected} bytes"),
        ))
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            Body::Empty
        } else {
            Body::Full(bytes)
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Bytes::from(text).into()
    }
}
