//! Request routing: maps target prefixes and HTTP methods to handler functions.
//!
//! Every pattern names a subtree with a trailing `/*`. The part of the raw
//! request-target (path plus query) after the prefix is captured verbatim and
//! handed to the handler through its [`Context`]:
//!
//! | Pattern     | Target                        | Captured                |
//! |-------------|-------------------------------|-------------------------|
//! | `/*`        | `/a/b/?q=1`                   | `/a/b/?q=1`             |
//! | `/files/*`  | `/files/docs/readme.txt`      | `/docs/readme.txt`      |
//!
//! No normalization happens: `/a` and `/a/` are different captures.
//!
//! Routes are matched in registration order; the first route whose method and pattern both
//! match the incoming request wins.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::{Method, Request, Response, StatusCode};

/// Type-erased, heap-allocated async handler that processes a [`Context`] and returns a
/// [`Response`].
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait via the blanket impl below.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

// Compiled `<prefix>/*` pattern; `/*` has an empty prefix and matches any target.
#[derive(Debug, Clone)]
struct Pattern {
    prefix: String,
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        let prefix = pattern.strip_suffix("/*").unwrap_or(pattern);
        Self {
            prefix: prefix.to_string(),
        }
    }

    // Returns the verbatim remainder of `target` after the prefix.
    fn capture<'t>(&self, target: &'t str) -> Option<&'t str> {
        let rest = target.strip_prefix(self.prefix.as_str())?;
        // `/files/*` must not match `/filesystem`.
        if self.prefix.is_empty() || rest.is_empty() || rest.starts_with(['/', '?']) {
            Some(rest)
        } else {
            None
        }
    }
}

// A single registered route binding a method + pattern to a handler.
struct Route {
    method: Method,
    pattern: Pattern,
    handler: Handler,
}

impl Route {
    fn capture<'t>(&self, method: &Method, target: &'t str) -> Option<&'t str> {
        if &self.method == method {
            self.pattern.capture(target)
        } else {
            None
        }
    }
}

/// HTTP request router that dispatches requests to registered handler functions.
///
/// When no route matches, a `404 Not Found` response is returned.
///
/// # Examples
///
/// ```rust,no_run
/// use teecache::{Router, Response, StatusCode};
/// use teecache::context::Context;
///
/// let mut router = Router::new();
/// router.get("/*", |ctx: Context| async move {
///     let target = ctx.request().target().to_owned();
///     Response::new(StatusCode::Ok).body(target)
/// });
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Create a new, empty `Router`.
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register a handler for `GET` requests under `pattern`.
    pub fn get(&mut self, pattern: &str, handler: impl IntoHandler) {
        self.route_methods(&[Method::Get], pattern, handler);
    }

    /// Register one handler for several methods on the same pattern.
    pub fn route_methods(&mut self, methods: &[Method], pattern: &str, handler: impl IntoHandler) {
        // Erase the concrete handler type and store it as a `Handler` trait object.
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        for method in methods {
            self.routes.push(Route {
                method: method.clone(),
                pattern: Pattern::parse(pattern),
                handler: Arc::clone(&handler),
            });
        }
    }

    /// Dispatch `request` to the first matching route and return its response,
    /// or `404 Not Found` when nothing matches.
    pub async fn route(&self, request: Request) -> Response {
        let matched = self.routes.iter().find_map(|route| {
            let captured = route.capture(request.method(), request.target())?;
            Some((route, captured.to_owned()))
        });

        match matched {
            Some((route, captured)) => (route.handler)(Context::new(request, captured)).await,
            None => Response::new(StatusCode::NotFound),
        }
    }
}
