#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow, bail};
use bytes::BytesMut;
use teecache::cache::{CacheKey, CacheStore};
use teecache::origin::Origin;
use teecache::origin::codec::{ChunkedDecoder, Decoded};
use teecache::{Proxy, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

/// What the stub origin sends back.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Status plus a `Content-Length` framed body.
    Fixed { status: u16, body: Vec<u8> },
    /// `Transfer-Encoding: chunked` body split into `chunk`-sized pieces.
    Chunked { body: Vec<u8>, chunk: usize },
    /// Announces `announced` bytes, sends `body`, then closes.
    Truncated { announced: usize, body: Vec<u8> },
    /// Closes the connection without answering.
    Hangup,
    /// Writes these bytes verbatim, then closes.
    Raw(Vec<u8>),
    /// `status` redirect to `location` with an empty body.
    Redirect { status: u16, location: String },
    /// Sends the body in pieces with a pause between each.
    Trickle {
        body: Vec<u8>,
        chunk: usize,
        pause: StdDuration,
    },
}

impl Reply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Reply::Fixed {
            status: 200,
            body: body.into(),
        }
    }
}

/// A request as the stub origin received it.
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: String,
    pub target: String,
    pub host: Option<String>,
    pub body: Vec<u8>,
}

/// Minimal HTTP/1.1 origin that records and counts requests.
pub struct StubOrigin {
    addr: SocketAddr,
    reply: Arc<Mutex<Reply>>,
    routes: Arc<Mutex<HashMap<String, Reply>>>,
    seen: Arc<Mutex<Vec<Seen>>>,
    hits: Arc<AtomicUsize>,
}

impl StubOrigin {
    pub async fn start(reply: Reply) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let reply = Arc::new(Mutex::new(reply));
        let routes = Arc::new(Mutex::new(HashMap::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hits = Arc::new(AtomicUsize::new(0));

        let stub = Self {
            addr,
            reply,
            routes,
            seen,
            hits,
        };
        let (reply, routes, seen, hits) = (
            stub.reply.clone(),
            stub.routes.clone(),
            stub.seen.clone(),
            stub.hits.clone(),
        );
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let (reply, routes, seen, hits) =
                    (reply.clone(), routes.clone(), seen.clone(), hits.clone());
                tokio::spawn(async move {
                    let _ = answer(socket, reply, routes, seen, hits).await;
                });
            }
        });

        Ok(stub)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn origin(&self) -> Origin {
        Origin::new("127.0.0.1", self.addr.port(), StdDuration::from_secs(2))
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    /// Answers requests for exactly `target` with `reply` instead of the default.
    pub fn route(&self, target: &str, reply: Reply) {
        self.routes.lock().unwrap().insert(target.to_owned(), reply);
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

async fn answer(
    mut socket: TcpStream,
    default_reply: Arc<Mutex<Reply>>,
    routes: Arc<Mutex<HashMap<String, Reply>>>,
    seen: Arc<Mutex<Vec<Seen>>>,
    hits: Arc<AtomicUsize>,
) -> Result<()> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let request = loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            bail!("client closed before sending a request");
        }
        data.extend_from_slice(&buf[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        if let httparse::Status::Complete(offset) = req.parse(&data)? {
            let header = |name: &str| {
                req.headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case(name))
                    .map(|h| String::from_utf8_lossy(h.value).into_owned())
            };
            let length: usize = header("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let host = header("host");
            let method = req.method.unwrap_or_default().to_owned();
            let target = req.path.unwrap_or_default().to_owned();
            while data.len() < offset + length {
                let n = socket.read(&mut buf).await?;
                if n == 0 {
                    bail!("client closed mid-body");
                }
                data.extend_from_slice(&buf[..n]);
            }
            break Seen {
                method,
                target,
                host,
                body: data[offset..offset + length].to_vec(),
            };
        }
    };

    let reply = routes
        .lock()
        .unwrap()
        .get(&request.target)
        .cloned()
        .unwrap_or_else(|| default_reply.lock().unwrap().clone());
    hits.fetch_add(1, Ordering::SeqCst);
    seen.lock().unwrap().push(request);

    match reply {
        Reply::Fixed { status, body } => {
            let head = format!(
                "HTTP/1.1 {status} Stub\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await?;
            socket.write_all(&body).await?;
        }
        Reply::Chunked { body, chunk } => {
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
                .await?;
            for piece in body.chunks(chunk.max(1)) {
                socket
                    .write_all(format!("{:x}\r\n", piece.len()).as_bytes())
                    .await?;
                socket.write_all(piece).await?;
                socket.write_all(b"\r\n").await?;
            }
            socket.write_all(b"0\r\n\r\n").await?;
        }
        Reply::Truncated { announced, body } => {
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {announced}\r\n\r\n");
            socket.write_all(head.as_bytes()).await?;
            socket.write_all(&body).await?;
        }
        Reply::Hangup => return Ok(()),
        Reply::Raw(bytes) => socket.write_all(&bytes).await?,
        Reply::Redirect { status, location } => {
            let head = format!(
                "HTTP/1.1 {status} Redirect\r\nLocation: {location}\r\nContent-Length: 0\r\n\r\n"
            );
            socket.write_all(head.as_bytes()).await?;
        }
        Reply::Trickle { body, chunk, pause } => {
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
            socket.write_all(head.as_bytes()).await?;
            for piece in body.chunks(chunk.max(1)) {
                socket.write_all(piece).await?;
                sleep(pause).await;
            }
        }
    }
    socket.shutdown().await.ok();
    Ok(())
}

/// A running proxy bound to an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub cache_dir: PathBuf,
    pub store: CacheStore,
}

impl TestProxy {
    pub async fn start(origin: Origin, cache_dir: &Path) -> Result<Self> {
        let server = Server::bind("127.0.0.1:0").await?;
        let addr = server.local_addr();
        let proxy = Proxy::new(CacheStore::new(cache_dir), origin);
        tokio::spawn(proxy.serve(server, std::future::pending()));
        Ok(Self {
            addr,
            cache_dir: cache_dir.to_owned(),
            store: CacheStore::new(cache_dir),
        })
    }

    pub fn entry_path(&self, target: &str) -> PathBuf {
        self.store.entry_path(&CacheKey::derive(target))
    }

    /// Names of everything in the cache directory.
    pub fn cache_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.cache_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    pub async fn request(&self, method: &str, target: &str, body: &[u8]) -> Result<ClientResponse> {
        send(self.addr, method, target, body).await
    }

    pub async fn get(&self, target: &str) -> Result<ClientResponse> {
        self.request("GET", target, b"").await
    }
}

#[derive(Debug)]
pub struct ClientResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// `false` if the connection ended before the framed body was complete.
    pub complete: bool,
}

impl ClientResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends one request with `Connection: close` and reads until EOF.
pub async fn send(addr: SocketAddr, method: &str, target: &str, body: &[u8]) -> Result<ClientResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    let head = format!(
        "{method} {target} HTTP/1.1\r\nHost: proxy.test\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;

    let mut raw = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        match timeout(StdDuration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => break,
            Ok(Ok(n)) => raw.extend_from_slice(&buf[..n]),
            Err(_) => bail!("timed out reading response"),
        }
    }
    parse_response(&raw)
}

fn parse_response(raw: &[u8]) -> Result<ClientResponse> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut headers);
    let offset = match resp.parse(raw)? {
        httparse::Status::Complete(offset) => offset,
        httparse::Status::Partial => bail!("incomplete response head: {:?}", String::from_utf8_lossy(raw)),
    };
    let status = resp.code.context("missing status")?;
    let headers: Vec<(String, String)> = resp
        .headers
        .iter()
        .map(|h| (h.name.to_owned(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();
    let find = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };

    let rest = &raw[offset..];
    let (body, complete) = if find("transfer-encoding").is_some_and(|v| v.contains("chunked")) {
        let mut buf = BytesMut::from(rest);
        let mut decoder = ChunkedDecoder::new();
        let mut body = Vec::new();
        let complete = loop {
            match decoder.decode(&mut buf) {
                Ok(Decoded::Data(chunk)) => body.extend_from_slice(&chunk),
                Ok(Decoded::End) => break true,
                Ok(Decoded::NeedMore) | Err(_) => break false,
            }
        };
        (body, complete)
    } else {
        let length: usize = find("content-length")
            .ok_or_else(|| anyhow!("response without framing"))?
            .parse()?;
        (rest[..rest.len().min(length)].to_vec(), rest.len() >= length)
    };

    Ok(ClientResponse {
        status,
        headers,
        body,
        complete,
    })
}

/// Polls until `path` holds exactly `expected`.
pub async fn wait_for_file(path: &Path, expected: &[u8]) -> Result<()> {
    for _ in 0..300 {
        if std::fs::read(path).is_ok_and(|content| content == expected) {
            return Ok(());
        }
        sleep(StdDuration::from_millis(50)).await;
    }
    Err(anyhow!("{} never reached the expected content", path.display()))
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
