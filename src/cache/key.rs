//! Cache key derivation.
//!
//! A [`CacheKey`] is the lowercase hex MD5 digest of the raw request target.
//! The target is hashed verbatim: case, trailing slashes, percent-encoding and
//! the query string all participate, so `/a` and `/a/` are distinct entries.

use std::fmt;

/// Length of a rendered key: 128 bits as lowercase hex.
pub const KEY_LEN: usize = 32;

/// A fixed-length, filesystem-safe identifier for a cached response body.
///
/// # Examples
///
/// ```
/// use teecache::cache::CacheKey;
///
/// let key = CacheKey::derive("/a/b.json");
/// assert_eq!(key.as_str().len(), 32);
/// assert_eq!(key, CacheKey::derive("/a/b.json"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives the key for a request target. Pure, infallible, and stable
    /// across process restarts.
    pub fn derive(target: &str) -> Self {
        Self(format!("{:x}", md5::compute(target.as_bytes())))
    }

    /// Returns the key as it appears on disk.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
