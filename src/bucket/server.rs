use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::sink::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn, Level};

use super::store::BucketStore;
use super::SMALL_PAYLOAD_THRESHOLD;
use crate::wire::{self, split_fields, BIG_PREFIX, NULL_FRAME, OK_FRAME};

/// Accepts connections until cancelled, handling each as its own task. One
/// connection carries exactly one request.
pub async fn serve(
    listener: TcpListener,
    store: Arc<BucketStore>,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "bucket listening");

    loop {
        match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => return Ok(()),
        } {
            Ok((conn, _)) => {
                tokio::spawn(handle_conn(store.clone(), conn));
            },
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };
    }
}

#[instrument(name = "bucket_conn", err(level = Level::WARN), fields(peer = %conn.peer_addr()?), skip_all)]
async fn handle_conn(store: Arc<BucketStore>, conn: TcpStream) -> Result<()> {
    conn.set_nodelay(true).context("setting NODELAY")?;

    let mut framed = wire::framed(conn);

    let request = match framed.next().await {
        Some(r) => r.context("reading request")?,
        None => bail!("connection closed before a request"),
    };

    let Some(fields) = split_fields(&request, 4) else {
        bail!("malformed request frame");
    };
    let key = std::str::from_utf8(&fields[0])
        .context("key is not utf-8")?
        .to_string();
    let method = fields[1].clone();
    let timeout = parse_timeout(&fields[2])?;
    let payload = fields[3].clone();

    debug!(%key, method = %String::from_utf8_lossy(&method), "request");

    match method.as_ref() {
        b"set" => {
            store.set(&key, payload).await?;
            framed.send(Bytes::from_static(OK_FRAME)).await?;
        },
        b"big-set" => {
            let declared: usize = std::str::from_utf8(&payload)
                .ok()
                .and_then(|s| s.parse().ok())
                .context("bad big-set length")?;

            framed.send(Bytes::from_static(OK_FRAME)).await?;

            let data = match tokio::time::timeout(timeout, framed.next())
                .await
                .context("timed out awaiting big-set payload")?
            {
                Some(r) => r.context("reading big-set payload")?,
                None => bail!("connection closed mid big-set"),
            };
            if data.len() != declared {
                debug!(declared, got = data.len(), "big-set length mismatch");
            }

            store.set(&key, data).await?;
            framed.send(Bytes::from_static(OK_FRAME)).await?;
        },
        b"get" => match store.get(&key).await? {
            None => framed.send(Bytes::from_static(NULL_FRAME)).await?,
            Some(data) if data.len() < SMALL_PAYLOAD_THRESHOLD => {
                framed.send(data).await?
            },
            Some(data) => {
                let marker = Bytes::from(
                    [BIG_PREFIX, data.len().to_string().as_bytes()].concat(),
                );
                framed.send(marker).await?;

                match tokio::time::timeout(timeout, framed.next())
                    .await
                    .context("timed out awaiting big-get ack")?
                {
                    Some(r) => {
                        r.context("reading big-get ack")?;
                    },
                    None => bail!("connection closed mid big-get"),
                }

                framed.send(data).await?;
            },
        },
        b"delete" => {
            store.delete(&key).await?;
            framed.send(Bytes::from_static(OK_FRAME)).await?;
        },
        other => {
            bail!("unknown method {:?}", String::from_utf8_lossy(other));
        },
    }

    framed
        .into_inner()
        .shutdown()
        .await
        .context("during shutdown")?;

    Ok(())
}

fn parse_timeout(field: &[u8]) -> Result<Duration> {
    let secs: f64 = std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .context("bad timeout field")?;

    Ok(Duration::from_secs_f64(secs.clamp(1.0, 60.0 * 60.0)))
}
