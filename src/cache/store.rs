//! Flat-directory cache store.
//!
//! Each entry is a single file named by its [`CacheKey`]; there is no index or
//! manifest, the presence of the file is the index. Writers stage bytes in a
//! hidden temporary file next to the entry and publish it with an atomic
//! rename, so a reader never observes a half-written body.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::CacheKey;

/// Errors produced by [`CacheStore`].
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no cache entry for key {key}")]
    NotFound { key: CacheKey },

    #[error("cache {op} failed for key {key}: {source}")]
    Io {
        op: &'static str,
        key: CacheKey,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    fn io(op: &'static str, key: &CacheKey, source: io::Error) -> Self {
        Self::Io {
            op,
            key: key.clone(),
            source,
        }
    }
}

/// An open cache entry positioned at its first byte.
#[derive(Debug)]
pub struct CachedEntry {
    pub file: File,
    pub len: u64,
}

/// Maps cache keys to files under a single directory.
#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    // Distinguishes temp files of concurrent writers for the same key.
    seq: AtomicU64,
}

impl CacheStore {
    /// Creates a store rooted at `dir`. The directory is not touched here;
    /// startup validation lives in [`crate::config`].
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicU64::new(0),
        }
    }

    /// Returns the directory entries are stored in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the on-disk path of the entry for `key`.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.as_str())
    }

    /// Returns `true` iff a committed entry for `key` exists and can be opened.
    pub async fn exists(&self, key: &CacheKey) -> bool {
        match fs::metadata(self.entry_path(key)).await {
            Ok(meta) if meta.is_file() => File::open(self.entry_path(key)).await.is_ok(),
            _ => false,
        }
    }

    /// Opens the entry for `key` for reading.
    ///
    /// # Errors
    ///
    /// - [`CacheError::NotFound`] if there is no entry for `key`.
    /// - [`CacheError::Io`] for any other filesystem failure.
    pub async fn open_read(&self, key: &CacheKey) -> Result<CachedEntry, CacheError> {
        let file = match File::open(self.entry_path(key)).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound { key: key.clone() });
            }
            Err(e) => return Err(CacheError::io("open", key, e)),
        };
        let len = file
            .metadata()
            .await
            .map_err(|e| CacheError::io("stat", key, e))?
            .len();
        Ok(CachedEntry { file, len })
    }

    /// Starts a new entry for `key`.
    ///
    /// Bytes go to a temporary file until [`EntryWriter::commit`] renames it
    /// over any existing entry. A writer dropped without committing deletes
    /// its temporary file and leaves the key untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the temporary file cannot be created
    /// (permissions, missing directory, disk full).
    pub async fn open_write(&self, key: &CacheKey) -> Result<EntryWriter, CacheError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let temp_path = self
            .dir
            .join(format!(".{}.{}.{seq}.tmp", key.as_str(), std::process::id()));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(|e| CacheError::io("create", key, e))?;
        debug!(key = %key, temp = %temp_path.display(), "cache entry opened for write");
        Ok(EntryWriter {
            file,
            temp_path,
            final_path: self.entry_path(key),
            key: key.clone(),
            written: 0,
            committed: false,
        })
    }
}

/// Append-only handle on an entry being filled.
#[derive(Debug)]
pub struct EntryWriter {
    file: File,
    temp_path: PathBuf,
    final_path: PathBuf,
    key: CacheKey,
    written: u64,
    committed: bool,
}

impl EntryWriter {
    /// Appends `chunk` to the entry.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), CacheError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| CacheError::io("write", &self.key, e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flushes the staged bytes and publishes them under the entry's key.
    ///
    /// Returns the number of bytes stored.
    pub async fn commit(mut self) -> Result<u64, CacheError> {
        self.file
            .flush()
            .await
            .map_err(|e| CacheError::io("flush", &self.key, e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| CacheError::io("sync", &self.key, e))?;
        fs::rename(&self.temp_path, &self.final_path)
            .await
            .map_err(|e| CacheError::io("rename", &self.key, e))?;
        self.committed = true;
        Ok(self.written)
    }
}

impl Drop for EntryWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.temp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(key = %self.key, error = %e, "failed to remove abandoned cache temp file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(store: &CacheStore, key: &CacheKey) -> Vec<u8> {
        let mut entry = store.open_read(key).await.unwrap();
        let mut buf = Vec::new();
        entry.file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf.len() as u64, entry.len);
        buf
    }

    fn entry_names(store: &CacheStore) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let key = CacheKey::derive("/missing");
        assert!(!store.exists(&key).await);
        assert!(matches!(
            store.open_read(&key).await,
            Err(CacheError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn commit_publishes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let key = CacheKey::derive("/a/b.json");

        let mut writer = store.open_write(&key).await.unwrap();
        writer.write_chunk(b"{\"x\":").await.unwrap();
        writer.write_chunk(b"1}").await.unwrap();
        assert!(!store.exists(&key).await);
        assert_eq!(writer.commit().await.unwrap(), 7);

        assert!(store.exists(&key).await);
        assert_eq!(read_all(&store, &key).await, b"{\"x\":1}");
        assert_eq!(entry_names(&store), vec![key.as_str().to_owned()]);
    }

    #[tokio::test]
    async fn empty_entry_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let key = CacheKey::derive("/empty");
        store.open_write(&key).await.unwrap().commit().await.unwrap();
        assert!(store.exists(&key).await);
        assert!(read_all(&store, &key).await.is_empty());
    }

    #[tokio::test]
    async fn dropped_writer_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let key = CacheKey::derive("/partial");
        {
            let mut writer = store.open_write(&key).await.unwrap();
            writer.write_chunk(b"half of it").await.unwrap();
        }
        assert!(!store.exists(&key).await);
        assert!(entry_names(&store).is_empty());
    }

    #[tokio::test]
    async fn last_commit_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let key = CacheKey::derive("/race");

        let mut first = store.open_write(&key).await.unwrap();
        let mut second = store.open_write(&key).await.unwrap();
        first.write_chunk(b"first").await.unwrap();
        second.write_chunk(b"second").await.unwrap();
        first.commit().await.unwrap();
        second.commit().await.unwrap();

        assert_eq!(read_all(&store, &key).await, b"second");
        assert_eq!(entry_names(&store).len(), 1);
    }

    #[tokio::test]
    async fn open_write_in_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("does/not/exist"));
        let key = CacheKey::derive("/x");
        assert!(matches!(
            store.open_write(&key).await,
            Err(CacheError::Io { op: "create", .. })
        ));
    }
}
