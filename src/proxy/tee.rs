//! Single-pass fan-out of one byte stream into two sinks.
//!
//! Every chunk goes to the store sink first and then to the client sink,
//! before the caller reads the next chunk from the origin. Both writes are
//! attempted even if the first fails, and the first error is returned.
//! A client that fails once is detached; the store keeps receiving chunks
//! so a disconnecting client cannot leave the cache short.

use std::future::Future;
use std::io;

use bytes::Bytes;

use crate::cache::{CacheError, EntryWriter};
use crate::http::BodySender;

/// Destination for chunks of a teed stream.
pub trait ChunkSink {
    type Error;

    fn send_chunk(&mut self, chunk: &Bytes) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

impl ChunkSink for EntryWriter {
    type Error = CacheError;

    async fn send_chunk(&mut self, chunk: &Bytes) -> Result<(), CacheError> {
        self.write_chunk(chunk).await
    }
}

impl ChunkSink for BodySender {
    type Error = io::Error;

    async fn send_chunk(&mut self, chunk: &Bytes) -> io::Result<()> {
        self.send(chunk.clone()).await
    }
}

/// Which side of a [`Tee`] failed.
#[derive(Debug)]
pub enum TeeError<S, C> {
    Store(S),
    Client(C),
}

/// Writes each chunk to a store sink and, while attached, a client sink.
#[derive(Debug)]
pub struct Tee<S, C> {
    store: S,
    client: Option<C>,
}

impl<S, C> Tee<S, C>
where
    S: ChunkSink,
    C: ChunkSink,
{
    pub fn new(store: S, client: C) -> Self {
        Self {
            store,
            client: Some(client),
        }
    }

    /// Writes `chunk` to the store, then to the client.
    ///
    /// On a client error the client is detached and subsequent writes reach
    /// only the store. A store error is reported first when both fail.
    pub async fn write(&mut self, chunk: &Bytes) -> Result<(), TeeError<S::Error, C::Error>> {
        let stored = self.store.send_chunk(chunk).await;

        let delivered = match self.client.as_mut() {
            Some(client) => client.send_chunk(chunk).await,
            None => Ok(()),
        };
        if delivered.is_err() {
            self.client = None;
        }

        stored.map_err(TeeError::Store)?;
        delivered.map_err(TeeError::Client)
    }

    /// Returns `true` while the client sink is still receiving chunks.
    pub fn client_attached(&self) -> bool {
        self.client.is_some()
    }

    /// Releases both sinks. The client is `None` if it was detached.
    pub fn into_parts(self) -> (S, Option<C>) {
        (self.store, self.client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Recorder {
        bytes: Vec<u8>,
        fail_after: Option<usize>,
        writes: usize,
    }

    impl Recorder {
        fn failing_after(writes: usize) -> Self {
            Self {
                fail_after: Some(writes),
                ..Self::default()
            }
        }
    }

    impl ChunkSink for Recorder {
        type Error = &'static str;

        async fn send_chunk(&mut self, chunk: &Bytes) -> Result<(), &'static str> {
            if self.fail_after.is_some_and(|n| self.writes >= n) {
                return Err("sink closed");
            }
            self.writes += 1;
            self.bytes.extend_from_slice(chunk);
            Ok(())
        }
    }

    fn chunks(sizes: &[usize]) -> Vec<Bytes> {
        let mut next = 0u8;
        sizes
            .iter()
            .map(|&n| {
                let chunk: Vec<u8> = (0..n)
                    .map(|_| {
                        next = next.wrapping_add(1);
                        next
                    })
                    .collect();
                Bytes::from(chunk)
            })
            .collect()
    }

    #[tokio::test]
    async fn both_sinks_get_identical_bytes() {
        for sizes in [&[][..], &[1][..], &[0, 3, 0, 70_000, 5][..]] {
            let mut tee = Tee::new(Recorder::default(), Recorder::default());
            let input = chunks(sizes);
            for chunk in &input {
                tee.write(chunk).await.unwrap();
            }
            let (store, client) = tee.into_parts();
            let expected: Vec<u8> = input.iter().flat_map(|c| c.iter().copied()).collect();
            assert_eq!(store.bytes, expected);
            assert_eq!(client.unwrap().bytes, expected);
        }
    }

    #[tokio::test]
    async fn client_failure_detaches_but_store_continues() {
        let mut tee = Tee::new(Recorder::default(), Recorder::failing_after(1));
        let input = chunks(&[4, 4, 4]);

        tee.write(&input[0]).await.unwrap();
        assert!(matches!(tee.write(&input[1]).await, Err(TeeError::Client(_))));
        assert!(!tee.client_attached());
        tee.write(&input[2]).await.unwrap();

        let (store, client) = tee.into_parts();
        assert_eq!(store.bytes.len(), 12);
        assert!(client.is_none());
    }

    #[tokio::test]
    async fn store_failure_is_reported_first() {
        let mut tee = Tee::new(Recorder::failing_after(0), Recorder::failing_after(0));
        let input = chunks(&[2]);
        assert!(matches!(tee.write(&input[0]).await, Err(TeeError::Store(_))));
        assert!(!tee.client_attached());
    }

    #[tokio::test]
    async fn store_failure_still_writes_client() {
        let mut tee = Tee::new(Recorder::failing_after(0), Recorder::default());
        let input = chunks(&[2]);
        assert!(matches!(tee.write(&input[0]).await, Err(TeeError::Store(_))));
        assert!(tee.client_attached());
        let (_, client) = tee.into_parts();
        assert_eq!(client.unwrap().bytes, input[0].to_vec());
    }
}
