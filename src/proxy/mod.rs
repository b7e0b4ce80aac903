//! The caching reverse proxy.
//!
//! Wires the cache store and origin into a [`Router`]:
//!
//! - `GET /*`: read-through cache ([`fill`]).
//! - `POST /*`, `PUT /*`, `DELETE /*`: uncached relay ([`pass`]).
//!
//! Every failure is turned into a response for that request alone; nothing
//! that happens while serving a request can stop the server.

pub mod error;
pub mod fill;
pub mod pass;
pub mod tee;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::config::ProxyConfig;
use crate::context::Context;
use crate::http::Method;
use crate::origin::Origin;
use crate::router::Router;
use crate::server::{Server, ServerError};
use crate::Response;

pub use error::ProxyError;

/// Content type of proxied bodies; origin headers are not forwarded.
pub(crate) const CONTENT_TYPE: &str = "application/octet-stream";

/// Shared state for all requests: the cache directory and the origin.
#[derive(Debug)]
pub struct Proxy {
    store: CacheStore,
    origin: Origin,
}

impl Proxy {
    pub fn new(store: CacheStore, origin: Origin) -> Self {
        Self { store, origin }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(CacheStore::new(&config.cache_dir), config.origin.clone())
    }

    /// Builds the router for this proxy.
    pub fn router(self: &Arc<Self>) -> Router {
        let mut router = Router::new();

        let proxy = Arc::clone(self);
        router.get("/*", move |ctx: Context| {
            let proxy = Arc::clone(&proxy);
            async move { proxy.handle_get(ctx).await }
        });

        let proxy = Arc::clone(self);
        router.route_methods(
            &[Method::Post, Method::Put, Method::Delete],
            "/*",
            move |ctx: Context| {
                let proxy = Arc::clone(&proxy);
                async move { proxy.handle_relay(ctx).await }
            },
        );

        router
    }

    /// Serves requests on `server` until `shutdown` resolves.
    pub async fn serve<S>(self, server: Server, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()>,
    {
        let router = Arc::new(Arc::new(self).router());
        server
            .serve_with_shutdown(
                move |request| {
                    let router = Arc::clone(&router);
                    async move { router.route(request).await }
                },
                shutdown,
            )
            .await
    }

    async fn handle_get(&self, ctx: Context) -> Response {
        let started = Instant::now();
        let target = ctx.captured();
        let result = match check_target(target) {
            Ok(()) => fill::serve(&self.store, &self.origin, target).await,
            Err(e) => Err(e),
        };
        match result {
            Ok((response, outcome)) => {
                info!(
                    method = "GET",
                    target,
                    cache = outcome.as_str(),
                    len = response.body_ref().len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request served"
                );
                response
            }
            Err(e) => failed(ctx.request().method(), target, e),
        }
    }

    async fn handle_relay(&self, ctx: Context) -> Response {
        let started = Instant::now();
        let request = ctx.request();
        let target = ctx.captured();
        let result = match check_target(target) {
            Ok(()) => pass::relay(&self.origin, request.method(), target, request.body()).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(response) => {
                info!(
                    method = %request.method(),
                    target,
                    cache = "PASS",
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request relayed"
                );
                response
            }
            Err(e) => failed(request.method(), target, e),
        }
    }
}

fn check_target(target: &str) -> Result<(), ProxyError> {
    if target.starts_with('/') {
        Ok(())
    } else {
        Err(ProxyError::InvalidTarget(target.to_owned()))
    }
}

fn failed(method: &Method, target: &str, error: ProxyError) -> Response {
    warn!(%method, target, kind = error.kind(), error = %error, "request failed");
    error.into_response()
}
