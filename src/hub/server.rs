use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::sink::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Level};

use super::protocol::{Reply, Request};
use super::store::{now_ms, HubStore};
use crate::bucket::BucketClient;
use crate::types::b64::Blob;
use crate::wire;

/// Shared state behind the hub server: the store under one lock, and the
/// bucket client used to proxy step data.
pub struct HubServer {
    store: Mutex<HubStore>,
    bucket: BucketClient,
}

impl HubServer {
    pub fn new(store: HubStore, bucket: BucketClient) -> Self {
        Self {
            store: Mutex::new(store),
            bucket,
        }
    }
}

/// Accepts connections until cancelled. Each connection carries exactly one
/// request. A background tick reverts expired leases and due deferrals so
/// crashed workers' steps re-queue without waiting for the next poll.
pub async fn serve(
    listener: TcpListener,
    hub: Arc<HubServer>,
    cancel: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "hub listening");

    {
        let hub = hub.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                select! {
                    _ = tick.tick() => {},
                    _ = cancel.cancelled() => return,
                }
                if let Err(error) = hub.store.lock().await.reap(now_ms()) {
                    warn!(%error, "reap failed");
                }
            }
        });
    }

    loop {
        match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => return Ok(()),
        } {
            Ok((conn, _)) => {
                tokio::spawn(handle_conn(hub.clone(), conn));
            },
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };
    }
}

#[instrument(name = "hub_conn", err(level = Level::WARN), fields(peer = %conn.peer_addr()?), skip_all)]
async fn handle_conn(hub: Arc<HubServer>, conn: TcpStream) -> Result<()> {
    conn.set_nodelay(true).context("setting NODELAY")?;

    let mut framed = wire::framed(conn);

    let frame = match framed.next().await {
        Some(r) => r.context("reading request")?,
        None => bail!("connection closed before a request"),
    };

    let reply = match serde_json::from_slice::<Request>(&frame) {
        Ok(request) => {
            debug!(?request, "request");
            match dispatch(&hub, request).await {
                Ok(reply) => reply,
                Err(error) => Reply::Err {
                    message: format!("{error:#}"),
                },
            }
        },
        Err(error) => Reply::Err {
            message: format!("bad request: {error}"),
        },
    };

    framed.send(Bytes::from(serde_json::to_vec(&reply)?)).await?;

    framed
        .into_inner()
        .shutdown()
        .await
        .context("during shutdown")?;

    Ok(())
}

async fn dispatch(hub: &HubServer, request: Request) -> Result<Reply> {
    Ok(match request {
        Request::Submit { steps } => {
            hub.store.lock().await.submit(steps)?;
            Reply::Ok
        },
        Request::GetSteps {
            scopes,
            reverse,
            worker,
        } => Reply::StepIds {
            ids: hub
                .store
                .lock()
                .await
                .get_steps(&scopes, reverse, &worker)?,
        },
        Request::GetStep { id } => Reply::Step {
            record: hub.store.lock().await.get_step(&id),
        },
        Request::BulkGetStep { ids } => Reply::Steps {
            records: hub.store.lock().await.bulk_get_step(&ids),
        },
        Request::GetData { id } => Reply::Data {
            value: hub.bucket.get(&id).await?.map(|b| Blob(b.to_vec())),
        },
        Request::BulkGetData { ids } => {
            let mut values = BTreeMap::new();
            for id in ids {
                if let Some(data) = hub.bucket.get(&id).await? {
                    values.insert(id, Blob(data.to_vec()));
                }
            }
            Reply::DataMap { values }
        },
        Request::SetData { id, data } => {
            hub.bucket.set(&id, &data.0).await?;
            Reply::Ok
        },
        Request::BulkSetData { data } => {
            for (id, blob) in data {
                hub.bucket.set(&id, &blob.0).await?;
            }
            Reply::Ok
        },
        Request::Done { id } => {
            hub.store.lock().await.done(&id)?;
            Reply::Ok
        },
        Request::Dones { ids } => {
            hub.store.lock().await.dones(&ids)?;
            Reply::Ok
        },
        Request::Pending { id } => {
            hub.store.lock().await.pending(&id)?;
            Reply::Ok
        },
        Request::Pendings { ids } => {
            hub.store.lock().await.pendings(&ids)?;
            Reply::Ok
        },
        Request::Reset { id } => {
            hub.store.lock().await.reset(&id)?;
            Reply::Ok
        },
        Request::Resets { ids } => {
            hub.store.lock().await.resets(&ids)?;
            Reply::Ok
        },
        Request::Cancel { id } => {
            hub.store.lock().await.cancel(&id)?;
            Reply::Ok
        },
        Request::Cancels { ids } => {
            hub.store.lock().await.cancels(&ids)?;
            Reply::Ok
        },
        Request::Error { id, message, trace } => {
            hub.store.lock().await.error(&id, &message, &trace)?;
            Reply::Ok
        },
        Request::Stats => Reply::Stats {
            scopes: hub.store.lock().await.stats(),
        },
    })
}
