//! Startup configuration.
//!
//! Options come from flags or the environment (`ORIGIN_HOST`, `CACHE_DIR`,
//! ...). [`Cli::into_config`] validates them eagerly and produces the
//! immutable [`ProxyConfig`] the proxy is built from; nothing reads the
//! environment after that.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use url::Url;

use crate::origin::Origin;

/// Fatal configuration problems detected before serving.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ORIGIN_HOST {value:?} is not a valid URL: {source}")]
    OriginUrl {
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error("ORIGIN_HOST scheme {0:?} is not supported (only http)")]
    OriginScheme(String),

    #[error("ORIGIN_HOST {0:?} has no host")]
    OriginHost(String),

    #[error("ORIGIN_HOST {0:?} must not carry a path, query or fragment")]
    OriginPath(String),

    #[error("upstream timeout must be at least one second")]
    ZeroTimeout,

    #[error("cache directory {} is unusable: {source}", .path.display())]
    CacheDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache directory {} is not a directory", .0.display())]
    CacheDirNotDirectory(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "teecache", about = "Read-through caching reverse proxy")]
pub struct Cli {
    /// Base URL of the origin, e.g. http://origin.internal:8080
    #[arg(long, env = "ORIGIN_HOST")]
    pub origin_host: String,

    /// Directory cache entries are stored in (created if missing).
    #[arg(long, env = "CACHE_DIR")]
    pub cache_dir: PathBuf,

    /// Address to listen on.
    #[arg(long = "listen", env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Bound in seconds on connecting to, and each read from, the origin.
    #[arg(long = "upstream-timeout", env = "UPSTREAM_TIMEOUT_SECS", default_value_t = 30)]
    pub upstream_timeout_secs: u64,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Validated, immutable configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub origin: Origin,
    pub cache_dir: PathBuf,
    pub listen_addr: String,
}

impl Cli {
    /// Validates every option. The cache directory is created if needed and
    /// probed for writability.
    pub fn into_config(self) -> Result<ProxyConfig, ConfigError> {
        if self.upstream_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        let timeout = Duration::from_secs(self.upstream_timeout_secs);
        let origin = parse_origin(&self.origin_host, timeout)?;
        prepare_cache_dir(&self.cache_dir)?;
        Ok(ProxyConfig {
            origin,
            cache_dir: self.cache_dir,
            listen_addr: self.listen_addr,
        })
    }
}

/// Parses `ORIGIN_HOST` into an [`Origin`].
pub fn parse_origin(raw: &str, timeout: Duration) -> Result<Origin, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|source| ConfigError::OriginUrl {
        value: raw.to_owned(),
        source,
    })?;
    if url.scheme() != "http" {
        return Err(ConfigError::OriginScheme(url.scheme().to_owned()));
    }
    if !matches!(url.path(), "" | "/") || url.query().is_some() || url.fragment().is_some() {
        return Err(ConfigError::OriginPath(raw.to_owned()));
    }
    Origin::from_url(&url, timeout).ok_or_else(|| ConfigError::OriginHost(raw.to_owned()))
}

/// Ensures `path` exists, is a directory and accepts new files.
pub fn prepare_cache_dir(path: &Path) -> Result<(), ConfigError> {
    let unusable = |source| ConfigError::CacheDir {
        path: path.to_owned(),
        source,
    };
    std::fs::create_dir_all(path).map_err(unusable)?;
    if !std::fs::metadata(path).map_err(unusable)?.is_dir() {
        return Err(ConfigError::CacheDirNotDirectory(path.to_owned()));
    }
    let probe = path.join(format!(".teecache-probe-{}", std::process::id()));
    std::fs::write(&probe, b"").map_err(unusable)?;
    std::fs::remove_file(&probe).map_err(unusable)?;
    Ok(())
}
