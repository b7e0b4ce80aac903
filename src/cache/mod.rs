//! On-disk response cache.
//!
//! - [`CacheKey`]: digest of a request target, used as the entry filename.
//! - [`CacheStore`]: existence checks, readers and staged writers over a flat
//!   directory of entries.
//!
//! Entries are never expired, revalidated or evicted; they live until deleted
//! from outside the process.

pub mod key;
pub mod store;

pub use key::CacheKey;
pub use store::{CacheError, CacheStore, CachedEntry, EntryWriter};
