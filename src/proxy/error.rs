//! Per-request failures and the responses they turn into.

use serde::Serialize;
use thiserror::Error;

use crate::cache::CacheError;
use crate::http::{Response, StatusCode};
use crate::origin::FetchError;

/// A request-scoped failure. Never fatal to the process.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("request target {0:?} is not an origin-form path")]
    InvalidTarget(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    detail: String,
}

impl ProxyError {
    /// Short machine-readable kind, also used as the `error` field of the body.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Cache(_) => "cache_io",
            ProxyError::Fetch(FetchError::Unreachable { .. }) => "upstream_unreachable",
            ProxyError::Fetch(FetchError::Timeout { .. }) => "upstream_timeout",
            ProxyError::Fetch(FetchError::Upstream { .. }) => "upstream_error",
            ProxyError::Fetch(FetchError::InvalidResponse { .. }) => "upstream_invalid_response",
            ProxyError::Fetch(FetchError::TooManyRedirects { .. }) => "upstream_redirect_loop",
            ProxyError::InvalidTarget(_) => "invalid_target",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Cache(_) => StatusCode::InternalServerError,
            ProxyError::Fetch(FetchError::Timeout { .. }) => StatusCode::GatewayTimeout,
            ProxyError::Fetch(_) => StatusCode::BadGateway,
            ProxyError::InvalidTarget(_) => StatusCode::BadRequest,
        }
    }

    /// Renders the error as a JSON response.
    pub fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.kind(),
            detail: self.to_string(),
        };
        match serde_json::to_vec(&body) {
            Ok(json) => Response::new(status)
                .header("Content-Type", "application/json")
                .body_bytes(json),
            Err(_) => Response::new(status),
        }
    }
}
