//! Per-request context handed to route handlers.

use crate::Request;

/// A request together with the part of its target the route captured.
#[derive(Debug)]
pub struct Context {
    request: Request,
    captured: String,
}

impl Context {
    pub fn new(request: Request, captured: String) -> Self {
        Self { request, captured }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The target remainder matched by the route's `/*`, verbatim.
    pub fn captured(&self) -> &str {
        &self.captured
    }
}
