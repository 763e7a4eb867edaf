use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use itertools::Itertools;
use tracing::{debug, error, warn};

use super::txqueue::TransactionQueue;
use crate::config::HubClientConfig;
use crate::hub::HubClient;
use crate::types::status::ResultStatus;
use crate::types::step::{Outcome, StepResult, Transaction};

/// Most transactions reported to the hub in one chunk.
pub const DRAIN_CHUNK: usize = 1000;

/// Starts the drainer on its own OS thread. Its workload is blocking
/// network I/O against the hub, so it runs a dedicated single-threaded
/// runtime and progresses independently of the worker's event loop. It
/// exits after draining everything ahead of the `None` sentinel.
pub fn spawn(
    queue: Arc<TransactionQueue>,
    hub_cfg: HubClientConfig,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("drainer".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "drainer runtime failed to start");
                    return;
                },
            };
            let client = HubClient::new(&hub_cfg);
            rt.block_on(drain_loop(&queue, &client));
        })
        .context("spawning drainer thread")
}

async fn drain_loop(queue: &TransactionQueue, client: &HubClient) {
    loop {
        let first = match queue.get() {
            Ok(Some(txn)) => txn,
            Ok(None) => return,
            Err(error) => {
                error!(%error, "transaction queue read failed");
                return;
            },
        };

        let mut chunk = vec![first];
        while chunk.len() < DRAIN_CHUNK && queue.qsize() > 0 {
            match queue.get() {
                Ok(Some(txn)) => chunk.push(txn),
                Ok(None) => {
                    // keep the sentinel for the outer loop to observe after
                    // this chunk lands
                    if let Err(error) = queue.put(None) {
                        warn!(%error, "re-queueing sentinel failed");
                    }
                    break;
                },
                Err(error) => {
                    error!(%error, "transaction queue read failed");
                    break;
                },
            }
        }

        process_chunk(client, chunk).await;
    }
}

/// Reports one chunk: failures individually as `error`, everything else via
/// one bulk data write and status-bucketed batch transitions. If the bulk
/// path fails, each item is reported on its own so one poisoned entry
/// cannot wedge the rest.
async fn process_chunk(client: &HubClient, chunk: Vec<Transaction>) {
    debug!(len = chunk.len(), "draining chunk");

    let mut finished: Vec<(Transaction, StepResult)> = Vec::new();
    for txn in chunk {
        match txn.outcome.clone() {
            Outcome::Failed { error, trace } => {
                if let Err(e) =
                    client.error(&txn.step.id, &error, &trace).await
                {
                    warn!(id = %txn.step.id, error = %e, "error report failed");
                }
            },
            Outcome::Finished(result) => finished.push((txn, result)),
        }
    }
    if finished.is_empty() {
        return;
    }

    if let Err(error) = bulk_report(client, &finished).await {
        warn!(%error, "bulk report failed; falling back to per-item");
        for (txn, result) in &finished {
            if let Err(e) = single_report(client, txn, result).await {
                warn!(id = %txn.step.id, error = %e, "per-item report failed");
                let _ = client
                    .error(&txn.step.id, &e.to_string(), &format!("{e:#}"))
                    .await;
            }
        }
    }
}

async fn bulk_report(
    client: &HubClient,
    finished: &[(Transaction, StepResult)],
) -> Result<()> {
    let data: BTreeMap<String, Vec<u8>> = finished
        .iter()
        .map(|(txn, result)| (txn.step.id.clone(), result.data.clone()))
        .collect();
    client.bulk_set_data(data).await?;

    let by_status = finished
        .iter()
        .map(|(txn, result)| (result.status, txn.step.id.clone()))
        .into_group_map();

    for (status, ids) in by_status {
        match status {
            ResultStatus::Success => client.dones(ids).await?,
            ResultStatus::Pending => client.pendings(ids).await?,
            ResultStatus::Reset => client.resets(ids).await?,
            ResultStatus::Cancel => client.cancels(ids).await?,
        }
    }

    Ok(())
}

async fn single_report(
    client: &HubClient,
    txn: &Transaction,
    result: &StepResult,
) -> Result<()> {
    client.set_data(&txn.step.id, result.data.clone()).await?;

    match result.status {
        ResultStatus::Success => client.done(&txn.step.id).await,
        ResultStatus::Pending => client.pending(&txn.step.id).await,
        ResultStatus::Reset => client.reset(&txn.step.id).await,
        ResultStatus::Cancel => client.cancel(&txn.step.id).await,
    }
}
