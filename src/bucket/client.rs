use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::sink::SinkExt;
use tokio::net::TcpStream;
use tokio_stream::StreamExt;

use super::SMALL_PAYLOAD_THRESHOLD;
use crate::config::BucketClientConfig;
use crate::retry::{self, with_retries};
use crate::wire::{self, join_fields, BIG_PREFIX, NULL_FRAME};

/// A client for the bucket server. One TCP connection per request; transient
/// failures are retried with the timeout doubling per attempt.
pub struct BucketClient {
    host: String,
    port: u16,
    tries: u32,
    base_timeout: Duration,
}

impl BucketClient {
    pub fn new(cfg: &BucketClientConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            tries: retry::DEFAULT_TRIES,
            base_timeout: retry::DEFAULT_BASE_TIMEOUT,
        }
    }

    /// Overrides the retry policy; tests use short timeouts.
    pub fn with_retry_policy(mut self, tries: u32, base: Duration) -> Self {
        self.tries = tries;
        self.base_timeout = base;
        self
    }

    async fn connect(&self) -> Result<TcpStream> {
        let conn = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| {
                format!("connecting to bucket at {}:{}", self.host, self.port)
            })?;
        conn.set_nodelay(true).context("setting NODELAY")?;
        Ok(conn)
    }

    /// Durably stores `data` under `key`, overwriting any previous value.
    pub async fn set(&self, key: &str, data: &[u8]) -> Result<()> {
        with_retries(self.tries, self.base_timeout, |t| {
            self.set_once(key, data, t)
        })
        .await
    }

    async fn set_once(
        &self,
        key: &str,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let secs = timeout.as_secs().to_string();

        tokio::time::timeout(timeout, async {
            let mut framed = wire::framed(self.connect().await?);

            if data.len() < SMALL_PAYLOAD_THRESHOLD {
                framed
                    .send(join_fields(&[
                        key.as_bytes(),
                        b"set",
                        secs.as_bytes(),
                        data,
                    ]))
                    .await?;
                recv_frame(&mut framed).await?;
            } else {
                framed
                    .send(join_fields(&[
                        key.as_bytes(),
                        b"big-set",
                        secs.as_bytes(),
                        data.len().to_string().as_bytes(),
                    ]))
                    .await?;
                recv_frame(&mut framed).await?;
                framed.send(Bytes::copy_from_slice(data)).await?;
                recv_frame(&mut framed).await?;
            }

            Ok(())
        })
        .await
        .context("bucket set timed out")?
    }

    /// Returns the value stored under `key`, or `None` if absent.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        with_retries(self.tries, self.base_timeout, |t| self.get_once(key, t))
            .await
    }

    async fn get_once(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Bytes>> {
        let secs = timeout.as_secs().to_string();

        tokio::time::timeout(timeout, async {
            let mut framed = wire::framed(self.connect().await?);

            framed
                .send(join_fields(&[
                    key.as_bytes(),
                    b"get",
                    secs.as_bytes(),
                    NULL_FRAME,
                ]))
                .await?;

            let reply = recv_frame(&mut framed).await?;

            if reply.starts_with(BIG_PREFIX) {
                framed.send(Bytes::from_static(wire::OK_FRAME)).await?;
                let data = recv_frame(&mut framed).await?;
                return Ok(Some(data));
            }
            if reply.as_ref() == NULL_FRAME {
                return Ok(None);
            }
            Ok(Some(reply))
        })
        .await
        .context("bucket get timed out")?
    }

    /// Removes `key` if present; absent keys are not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        with_retries(self.tries, self.base_timeout, |t| {
            self.delete_once(key, t)
        })
        .await
    }

    async fn delete_once(&self, key: &str, timeout: Duration) -> Result<()> {
        let secs = timeout.as_secs().to_string();

        tokio::time::timeout(timeout, async {
            let mut framed = wire::framed(self.connect().await?);

            framed
                .send(join_fields(&[
                    key.as_bytes(),
                    b"delete",
                    secs.as_bytes(),
                    NULL_FRAME,
                ]))
                .await?;
            recv_frame(&mut framed).await?;

            Ok(())
        })
        .await
        .context("bucket delete timed out")?
    }
}

async fn recv_frame(
    framed: &mut tokio_util::codec::Framed<TcpStream, wire::Codec>,
) -> Result<Bytes> {
    match framed.next().await {
        Some(r) => r.context("reading reply"),
        None => bail!("connection closed awaiting reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    use crate::bucket::store::BucketStore;

    async fn start_server(
        max_memory: usize,
    ) -> (tempfile::TempDir, Arc<BucketStore>, BucketClient, CancellationToken)
    {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(BucketStore::new(dir.path(), max_memory).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let cancel = CancellationToken::new();
        tokio::spawn(crate::bucket::server::serve(
            listener,
            store.clone(),
            cancel.clone(),
        ));

        let client = BucketClient::new(&BucketClientConfig {
            host: "127.0.0.1".into(),
            port,
        })
        .with_retry_policy(2, Duration::from_secs(5));

        (dir, store, client, cancel)
    }

    #[tokio::test]
    async fn test_small_round_trip() {
        let (_dir, _store, client, _cancel) =
            start_server(super::super::store::DEFAULT_MAX_MEMORY).await;

        assert_eq!(client.get("missing").await.unwrap(), None);

        client.set("k", b"x").await.unwrap();
        assert_eq!(client.get("k").await.unwrap().unwrap().as_ref(), b"x");

        client.delete("k").await.unwrap();
        assert_eq!(client.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sizes_straddling_threshold() {
        let (_dir, _store, client, _cancel) =
            start_server(super::super::store::DEFAULT_MAX_MEMORY).await;

        for size in [
            0,
            1,
            SMALL_PAYLOAD_THRESHOLD - 1,
            SMALL_PAYLOAD_THRESHOLD,
            SMALL_PAYLOAD_THRESHOLD + 1,
        ] {
            let data = vec![b'v'; size];
            let key = format!("size-{size}");
            client.set(&key, &data).await.unwrap();
            let got = client.get(&key).await.unwrap().unwrap();
            assert_eq!(got.as_ref(), data.as_slice(), "size {size}");
        }
    }

    #[tokio::test]
    async fn test_big_payload_evicts_but_disk_serves() {
        // 10 MiB payload with a 1 MiB memory budget: the write itself
        // overflows the cache, and the value still reads back from disk.
        let (_dir, store, client, _cancel) =
            start_server(1024 * 1024).await;

        let data = vec![0xabu8; 10 * 1024 * 1024];
        client.set("big", &data).await.unwrap();

        assert!(store.footprint() <= 1024 * 1024);
        assert!(!store.cached("big"));

        let got = client.get("big").await.unwrap().unwrap();
        assert_eq!(got.len(), data.len());
        assert_eq!(got.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_eviction_across_keys() {
        let (_dir, store, client, _cancel) = start_server(5000).await;

        client.set("a", &vec![b'a'; 3000]).await.unwrap();
        client.set("b", &vec![b'b'; 3000]).await.unwrap();

        assert!(!store.cached("a"));

        // evicted key re-materializes via the server from disk
        let got = client.get("a").await.unwrap().unwrap();
        assert_eq!(got.as_ref(), vec![b'a'; 3000].as_slice());
    }

    #[tokio::test]
    async fn test_retries_exhaust_on_dead_endpoint() {
        // Bind-then-drop gives a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = BucketClient::new(&BucketClientConfig {
            host: "127.0.0.1".into(),
            port,
        })
        .with_retry_policy(2, Duration::from_millis(200));

        assert!(client.get("k").await.is_err());
    }
}
