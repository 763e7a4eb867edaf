use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::sink::SinkExt;
use tokio::net::TcpStream;
use tokio_stream::StreamExt;

use super::protocol::{Reply, Request};
use super::store::{ScopeStats, StepRecord};
use crate::config::HubClientConfig;
use crate::retry::{self, with_retries};
use crate::types::b64::Blob;
use crate::types::step::Step;
use crate::wire;

/// A client for the hub. One TCP connection per call; transport failures
/// are retried with the timeout doubling per attempt, and an `Err` reply
/// (the hub understood and refused) surfaces without retry.
pub struct HubClient {
    host: String,
    port: u16,
    worker_id: String,
    tries: u32,
    base_timeout: Duration,
}

impl HubClient {
    pub fn new(cfg: &HubClientConfig) -> Self {
        let worker_id = format!(
            "{}:{}",
            std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".into()),
            std::process::id()
        );

        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            worker_id,
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

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    async fn call(&self, request: &Request) -> Result<Reply> {
        let frame = Bytes::from(serde_json::to_vec(request)?);

        let reply = with_retries(self.tries, self.base_timeout, |t| {
            let frame = frame.clone();
            async move {
                tokio::time::timeout(t, self.round_trip(frame))
                    .await
                    .context("hub call timed out")?
            }
        })
        .await?;

        if let Reply::Err { message } = reply {
            bail!("hub refused: {message}");
        }
        Ok(reply)
    }

    async fn round_trip(&self, frame: Bytes) -> Result<Reply> {
        let conn = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| {
                format!("connecting to hub at {}:{}", self.host, self.port)
            })?;
        conn.set_nodelay(true).context("setting NODELAY")?;

        let mut framed = wire::framed(conn);
        framed.send(frame).await?;

        let reply = match framed.next().await {
            Some(r) => r.context("reading reply")?,
            None => bail!("connection closed awaiting reply"),
        };
        serde_json::from_slice(&reply).context("parsing reply")
    }

    pub async fn submit(&self, steps: Vec<Step>) -> Result<()> {
        match self.call(&Request::Submit { steps }).await? {
            Reply::Ok => Ok(()),
            other => bail!("unexpected reply {other:?}"),
        }
    }

    pub async fn get_steps(
        &self,
        scopes: &[String],
        reverse: bool,
    ) -> Result<Vec<String>> {
        let request = Request::GetSteps {
            scopes: scopes.to_vec(),
            reverse,
            worker: self.worker_id.clone(),
        };
        match self.call(&request).await? {
            Reply::StepIds { ids } => Ok(ids),
            other => bail!("unexpected reply {other:?}"),
        }
    }

    pub async fn get_step(&self, id: &str) -> Result<Option<StepRecord>> {
        match self.call(&Request::GetStep { id: id.into() }).await? {
            Reply::Step { record } => Ok(record),
            other => bail!("unexpected reply {other:?}"),
        }
    }

    pub async fn bulk_get_step(
        &self,
        ids: &[String],
    ) -> Result<BTreeMap<String, StepRecord>> {
        let request = Request::BulkGetStep { ids: ids.to_vec() };
        match self.call(&request).await? {
            Reply::Steps { records } => Ok(records),
            other => bail!("unexpected reply {other:?}"),
        }
    }

    pub async fn get_data(&self, id: &str) -> Result<Option<Vec<u8>>> {
        match self.call(&Request::GetData { id: id.into() }).await? {
            Reply::Data { value } => Ok(value.map(|b| b.0)),
            other => bail!("unexpected reply {other:?}"),
        }
    }

    pub async fn bulk_get_data(
        &self,
        ids: &[String],
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let request = Request::BulkGetData { ids: ids.to_vec() };
        match self.call(&request).await? {
            Reply::DataMap { values } => {
                Ok(values.into_iter().map(|(k, v)| (k, v.0)).collect())
            },
            other => bail!("unexpected reply {other:?}"),
        }
    }

    pub async fn set_data(&self, id: &str, data: Vec<u8>) -> Result<()> {
        let request = Request::SetData {
            id: id.into(),
            data: Blob(data),
        };
        match self.call(&request).await? {
            Reply::Ok => Ok(()),
            other => bail!("unexpected reply {other:?}"),
        }
    }

    pub async fn bulk_set_data(
        &self,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<()> {
        let request = Request::BulkSetData {
            data: data.into_iter().map(|(k, v)| (k, Blob(v))).collect(),
        };
        match self.call(&request).await? {
            Reply::Ok => Ok(()),
            other => bail!("unexpected reply {other:?}"),
        }
    }

    pub async fn done(&self, id: &str) -> Result<()> {
        self.simple(Request::Done { id: id.into() }).await
    }

    pub async fn dones(&self, ids: Vec<String>) -> Result<()> {
        self.simple(Request::Dones { ids }).await
    }

    pub async fn pending(&self, id: &str) -> Result<()> {
        self.simple(Request::Pending { id: id.into() }).await
    }

    pub async fn pendings(&self, ids: Vec<String>) -> Result<()> {
        self.simple(Request::Pendings { ids }).await
    }

    pub async fn reset(&self, id: &str) -> Result<()> {
        self.simple(Request::Reset { id: id.into() }).await
    }

    pub async fn resets(&self, ids: Vec<String>) -> Result<()> {
        self.simple(Request::Resets { ids }).await
    }

    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.simple(Request::Cancel { id: id.into() }).await
    }

    pub async fn cancels(&self, ids: Vec<String>) -> Result<()> {
        self.simple(Request::Cancels { ids }).await
    }

    pub async fn error(&self, id: &str, message: &str, trace: &str) -> Result<()> {
        self.simple(Request::Error {
            id: id.into(),
            message: message.into(),
            trace: trace.into(),
        })
        .await
    }

    pub async fn stats(&self) -> Result<BTreeMap<String, ScopeStats>> {
        match self.call(&Request::Stats).await? {
            Reply::Stats { scopes } => Ok(scopes),
            other => bail!("unexpected reply {other:?}"),
        }
    }

    async fn simple(&self, request: Request) -> Result<()> {
        match self.call(&request).await? {
            Reply::Ok => Ok(()),
            other => bail!("unexpected reply {other:?}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    use crate::bucket::{BucketClient, BucketStore};
    use crate::config::BucketClientConfig;
    use crate::hub::server::HubServer;
    use crate::hub::store::{HubStore, HubStoreConfig};
    use crate::types::status::StepStatus;

    pub(crate) async fn start_stack() -> (
        tempfile::TempDir,
        HubClient,
        HubClientConfig,
        CancellationToken,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();

        // bucket
        let store = Arc::new(
            BucketStore::new(dir.path().join("bucket"), 50 * 1024 * 1024)
                .unwrap(),
        );
        let bucket_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bucket_port = bucket_listener.local_addr().unwrap().port();
        tokio::spawn(crate::bucket::server::serve(
            bucket_listener,
            store,
            cancel.clone(),
        ));

        // hub
        let hub_store = HubStore::open(
            &dir.path().join("hub.redb"),
            HubStoreConfig {
                batch_size: 50,
                pending_delay: Duration::from_millis(50),
                default_lease: Duration::from_secs(3600),
            },
        )
        .unwrap();
        let bucket_client = BucketClient::new(&BucketClientConfig {
            host: "127.0.0.1".into(),
            port: bucket_port,
        })
        .with_retry_policy(2, Duration::from_secs(5));
        let hub = Arc::new(HubServer::new(hub_store, bucket_client));

        let hub_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hub_port = hub_listener.local_addr().unwrap().port();
        tokio::spawn(crate::hub::server::serve(
            hub_listener,
            hub,
            cancel.clone(),
        ));

        let endpoint = HubClientConfig {
            host: "127.0.0.1".into(),
            port: hub_port,
        };
        let client = HubClient::new(&endpoint)
            .with_retry_policy(2, Duration::from_secs(5));

        (dir, client, endpoint, cancel)
    }

    fn step(id: &str, parents: &[&str]) -> Step {
        Step {
            id: id.into(),
            name: id.into(),
            scope: "default".into(),
            priority: 0,
            timeout: None,
            parents: parents.iter().map(|p| p.to_string()).collect(),
            code: String::new(),
        }
    }

    #[tokio::test]
    async fn test_submit_lease_and_transition() {
        let (_dir, client, _endpoint, _cancel) = start_stack().await;

        client
            .submit(vec![step("s1", &[]), step("s2", &["s1"])])
            .await
            .unwrap();

        let scopes = vec!["default".to_string()];
        let ids = client.get_steps(&scopes, false).await.unwrap();
        assert_eq!(ids, ["s1"]);

        let record = client.get_step("s1").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Working);
        assert_eq!(record.lease.as_ref().unwrap().worker, client.worker_id());

        client.done("s1").await.unwrap();
        assert_eq!(client.get_steps(&scopes, false).await.unwrap(), ["s2"]);
    }

    #[tokio::test]
    async fn test_submit_refusal_is_not_retried_blindly() {
        let (_dir, client, _endpoint, _cancel) = start_stack().await;

        let err = client
            .submit(vec![step("a", &["ghost"])])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("hub refused"));
    }

    #[tokio::test]
    async fn test_data_proxies_to_bucket() {
        let (_dir, client, _endpoint, _cancel) = start_stack().await;

        assert_eq!(client.get_data("s1").await.unwrap(), None);

        client.set_data("s1", b"out-1".to_vec()).await.unwrap();
        assert_eq!(
            client.get_data("s1").await.unwrap(),
            Some(b"out-1".to_vec())
        );

        client
            .bulk_set_data(BTreeMap::from([
                ("s2".to_string(), b"out-2".to_vec()),
                ("s3".to_string(), b"out-3".to_vec()),
            ]))
            .await
            .unwrap();

        let got = client
            .bulk_get_data(&[
                "s1".to_string(),
                "s2".to_string(),
                "s3".to_string(),
                "missing".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got["s2"], b"out-2".to_vec());
        assert!(!got.contains_key("missing"));
    }

    #[tokio::test]
    async fn test_bulk_get_step_and_stats() {
        let (_dir, client, _endpoint, _cancel) = start_stack().await;

        client
            .submit(vec![step("s1", &[]), step("s2", &["s1"])])
            .await
            .unwrap();

        let records = client
            .bulk_get_step(&["s1".to_string(), "s2".to_string()])
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records["s2"].step.parents, vec!["s1".to_string()]);

        let stats = client.stats().await.unwrap();
        assert_eq!(stats["default"].queued, 2);
    }

    #[tokio::test]
    async fn test_cancel_cascade_over_wire() {
        let (_dir, client, _endpoint, _cancel) = start_stack().await;

        client
            .submit(vec![
                step("s1", &[]),
                step("s2", &["s1"]),
                step("s3", &["s2"]),
            ])
            .await
            .unwrap();

        client.cancel("s1").await.unwrap();
        for id in ["s1", "s2", "s3"] {
            let record = client.get_step(id).await.unwrap().unwrap();
            assert_eq!(record.status, StepStatus::Cancel);
        }
    }
}
