//! Origin response head parsing and body framing.
//!
//! Pure functions over buffers; the socket handling lives in the parent module.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::http::{Headers, Method};

/// Maximum number of response headers accepted from the origin.
const MAX_HEADERS: usize = 64;

/// Maximum size of a response head or chunk-size/trailer line.
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed response head: {0}")]
    Head(#[from] httparse::Error),

    #[error("response head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,

    #[error("invalid Content-Length value {0:?}")]
    ContentLength(String),

    #[error("invalid chunk size line")]
    ChunkSize,

    #[error("missing CRLF after chunk data")]
    ChunkTerminator,

    #[error("chunk metadata line exceeds {MAX_HEAD_SIZE} bytes")]
    LineTooLong,
}

/// Status line and headers of an origin response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
}

impl ResponseHead {
    /// `true` for 1xx heads that precede the final response (100 Continue,
    /// 103 Early Hints). 101 switches protocols and is final.
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }
}

/// Parses a response head from the start of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the head and the
/// number of bytes it occupied.
pub fn parse_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, CodecError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw = httparse::Response::new(&mut headers);
    match raw.parse(buf)? {
        httparse::Status::Complete(len) => {
            let head = ResponseHead {
                status: raw.code.unwrap_or_default(),
                headers: Headers::from_parsed(raw.headers),
            };
            Ok(Some((head, len)))
        }
        httparse::Status::Partial if buf.len() > MAX_HEAD_SIZE => Err(CodecError::HeadTooLarge),
        httparse::Status::Partial => Ok(None),
    }
}

/// How the body following a response head is delimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// No body at all (HEAD, 1xx, 204, 304).
    Empty,
    /// Exactly this many bytes.
    Fixed(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Everything until the origin closes the connection.
    UntilClose,
}

impl Framing {
    /// Determines the body framing per RFC 9112 §6.3. Transfer-Encoding wins
    /// over Content-Length.
    pub fn for_response(method: &Method, head: &ResponseHead) -> Result<Self, CodecError> {
        if *method == Method::Head
            || (100..200).contains(&head.status)
            || head.status == 204
            || head.status == 304
        {
            return Ok(Framing::Empty);
        }
        if head.headers.has_token("transfer-encoding", "chunked") {
            return Ok(Framing::Chunked);
        }
        match head.headers.get("content-length") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Framing::Fixed)
                .map_err(|_| CodecError::ContentLength(raw.to_owned())),
            None => Ok(Framing::UntilClose),
        }
    }
}

/// Result of one [`ChunkedDecoder::decode`] step.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Data(Bytes),
    NeedMore,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Incremental decoder for chunked transfer coding. Trailers are read and
/// discarded.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes framing from `buf` and returns the next piece of payload.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded, CodecError> {
        loop {
            match self.state {
                ChunkState::Size => match httparse::parse_chunk_size(buf) {
                    Ok(httparse::Status::Complete((consumed, size))) => {
                        buf.advance(consumed);
                        self.state = if size == 0 {
                            ChunkState::Trailers
                        } else {
                            ChunkState::Data(size)
                        };
                    }
                    Ok(httparse::Status::Partial) if buf.len() > MAX_HEAD_SIZE => {
                        return Err(CodecError::LineTooLong);
                    }
                    Ok(httparse::Status::Partial) => return Ok(Decoded::NeedMore),
                    Err(_) => return Err(CodecError::ChunkSize),
                },
                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(Decoded::NeedMore);
                    }
                    let take = remaining.min(buf.len() as u64);
                    // `take` is bounded by `buf.len()`, so it fits in usize.
                    let data = buf.split_to(take as usize).freeze();
                    self.state = match remaining - take {
                        0 => ChunkState::DataEnd,
                        left => ChunkState::Data(left),
                    };
                    return Ok(Decoded::Data(data));
                }
                ChunkState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(Decoded::NeedMore);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(CodecError::ChunkTerminator);
                    }
                    buf.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") else {
                        if buf.len() > MAX_HEAD_SIZE {
                            return Err(CodecError::LineTooLong);
                        }
                        return Ok(Decoded::NeedMore);
                    };
                    buf.advance(pos + 2);
                    if pos == 0 {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(Decoded::End),
            }
        }
    }
}
