//! # teecache
//!
//! A transparent caching reverse proxy on a from-scratch async HTTP/1.1 core.
//!
//! `GET` requests are answered from an on-disk cache keyed by the MD5 of the
//! request target. On a miss the origin response is streamed to the client
//! and into the cache in a single pass. `POST`, `PUT` and `DELETE` are
//! relayed to the origin without caching.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use teecache::{Proxy, Server, cache::CacheStore, origin::Origin};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let origin = Origin::new("origin.internal", 80, Duration::from_secs(30));
//!     let proxy = Proxy::new(CacheStore::new("/var/cache/teecache"), origin);
//!     let server = Server::bind("0.0.0.0:8080").await?;
//!     proxy.serve(server, std::future::pending()).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod logging;
pub mod origin;
pub mod proxy;
pub mod router;
pub mod server;

pub use http::{Headers, Method, Request, Response, StatusCode};
pub use proxy::{Proxy, ProxyError};
pub use router::Router;
pub use server::{Server, ServerError};
