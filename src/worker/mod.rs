//! The worker: a pull-based, bounded-concurrency executor. It polls the hub
//! for ready steps by scope, materializes parent outputs, runs bodies under
//! per-step timeouts, and funnels results through the durable transaction
//! queue, which a dedicated drainer thread reports back to the hub.

pub mod cleaner;
pub mod drainer;
pub mod runner;
pub mod txqueue;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use itertools::Itertools;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, info, warn};

use crate::config::{stop_worker_requested, HubClientConfig, WorkerConfig};
use crate::hub::{HubClient, StepRecord};
use crate::types::step::{Outcome, Step, Transaction};
use runner::Runner;
use txqueue::TransactionQueue;

/// Poll timeout for a blocking fetch when the local batch is empty.
const POLL_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll timeout for the overlapped prefetch of the next batch.
const PREFETCH_TIMEOUT: Duration = Duration::from_secs(35);
/// Backoff after a failed or timed-out fetch.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// Sleep between polls while the hub has nothing for us.
const IDLE_SLEEP: Duration = Duration::from_secs(1);
/// Backlog at which the worker exits to let the drainer catch up.
const QUEUE_DEPTH_LIMIT: usize = 1000;

pub struct Worker {
    cfg: WorkerConfig,
    hub_cfg: HubClientConfig,
    hub: Arc<HubClient>,
    runner: Arc<dyn Runner>,
    queue: Arc<TransactionQueue>,
}

impl Worker {
    pub fn new(
        cfg: WorkerConfig,
        hub_cfg: HubClientConfig,
        runner: Arc<dyn Runner>,
    ) -> Result<Self> {
        let queue = Arc::new(TransactionQueue::open(&cfg.queue_path)?);
        let hub = Arc::new(HubClient::new(&hub_cfg));

        Ok(Self {
            cfg,
            hub_cfg,
            hub,
            runner,
            queue,
        })
    }

    /// The full worker lifecycle: starts the cleaner task and the drainer
    /// thread, runs the work loop until it decides to exit, then flushes
    /// the transaction queue before returning.
    pub async fn run(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.cfg.scratch_dir)
            .await
            .context("creating scratch dir")?;

        let cleaner = tokio::spawn(cleaner::run(
            PathBuf::from("."),
            self.cfg.scratch_dir.clone(),
            cleaner::TEMP_FILE_LIFETIME,
        ));
        let drainer =
            drainer::spawn(self.queue.clone(), self.hub_cfg.clone())?;

        let result = self.work().await;

        cleaner.abort();

        self.queue.put(None)?;
        info!(pending = self.queue.qsize(), "waiting on transaction drain");
        tokio::task::spawn_blocking(move || drainer.join())
            .await?
            .map_err(|_| anyhow!("drainer thread panicked"))?;
        info!("transaction drain complete");

        result
    }

    async fn work(&self) -> Result<()> {
        let start = Instant::now();
        let scopes = self.cfg.scopes.clone();
        info!(?scopes, "worker starting");

        let mut last_loop_had_steps = true;
        let mut steps: Vec<String> = Vec::new();

        loop {
            if stop_worker_requested() {
                info!("stop requested");
                return Ok(());
            }

            if steps.is_empty() {
                steps = match timeout(
                    POLL_TIMEOUT,
                    self.hub.get_steps(&scopes, self.cfg.reverse_priority),
                )
                .await
                {
                    Ok(Ok(ids)) => ids,
                    Ok(Err(error)) => {
                        warn!(%error, "error getting steps");
                        sleep(ERROR_BACKOFF).await;
                        continue;
                    },
                    Err(_) => {
                        warn!("timed out getting steps from hub");
                        sleep(ERROR_BACKOFF).await;
                        continue;
                    },
                };
            }

            if steps.is_empty() {
                if last_loop_had_steps {
                    last_loop_had_steps = false;
                    info!("waiting..");
                } else if self.cfg.one_shot {
                    return Ok(());
                }
                sleep(IDLE_SLEEP).await;
                continue;
            }
            last_loop_had_steps = true;

            // overlap the next fetch with this batch's execution
            let prefetch = {
                let hub = self.hub.clone();
                let scopes = scopes.clone();
                let reverse = self.cfg.reverse_priority;
                tokio::spawn(async move {
                    timeout(PREFETCH_TIMEOUT, hub.get_steps(&scopes, reverse))
                        .await
                })
            };

            let batch = std::mem::take(&mut steps);
            if let Err(error) = self.run_batch(batch).await {
                warn!(%error, "batch failed");
                sleep(ERROR_BACKOFF).await;
            }

            steps = match prefetch.await {
                Ok(Ok(Ok(ids))) => ids,
                Ok(Ok(Err(error))) => {
                    warn!(%error, "error getting next batch");
                    Vec::new()
                },
                Ok(Err(_)) => {
                    warn!("timed out getting next batch");
                    Vec::new()
                },
                Err(error) => {
                    warn!(%error, "prefetch task failed");
                    Vec::new()
                },
            };

            if start.elapsed() > self.cfg.restart_interval {
                info!("restart interval reached; exiting for respawn");
                return Ok(());
            }
            if self.cfg.once {
                return Ok(());
            }
            if !self.cfg.subprocess_jobs
                && self.queue.qsize() > QUEUE_DEPTH_LIMIT
            {
                info!("transaction backlog; exiting to let the drain land");
                return Ok(());
            }
        }
    }

    /// Resolves one leased batch (records in one round trip, unique parent
    /// outputs in another) and runs its steps with bounded concurrency.
    async fn run_batch(&self, ids: Vec<String>) -> Result<()> {
        let mut records = self.hub.bulk_get_step(&ids).await?;

        let parents: Vec<String> = records
            .values()
            .flat_map(|r| r.step.parents.iter().cloned())
            .unique()
            .collect();
        let data = if parents.is_empty() {
            BTreeMap::new()
        } else {
            self.hub.bulk_get_data(&parents).await?
        };
        let data = Arc::new(data);

        let semaphore = Arc::new(Semaphore::new(self.cfg.n_workers.max(1)));
        let mut tasks = Vec::new();

        for id in ids {
            let Some(record) = records.remove(&id) else {
                // leased an id the hub no longer has a record for
                warn!(%id, "step record missing; resetting");
                if let Err(error) = self.hub.reset(&id).await {
                    warn!(%id, %error, "reset failed");
                }
                continue;
            };

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("worker pool closed")?;

            let hub = self.hub.clone();
            let runner = self.runner.clone();
            let queue = self.queue.clone();
            let data = data.clone();
            let subprocess = self.cfg.subprocess_jobs;
            let job_cmd = self.cfg.job_cmd.clone();
            let job_timeout = self.cfg.job_timeout;

            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                run_one(
                    hub,
                    runner,
                    queue,
                    subprocess,
                    &job_cmd,
                    job_timeout,
                    record,
                    data,
                )
                .await;
            }));
        }

        for task in tasks {
            if let Err(error) = task.await {
                warn!(%error, "step task panicked");
            }
        }

        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one(
    hub: Arc<HubClient>,
    runner: Arc<dyn Runner>,
    queue: Arc<TransactionQueue>,
    subprocess: bool,
    job_cmd: &str,
    job_timeout: Duration,
    record: StepRecord,
    data: Arc<BTreeMap<String, Vec<u8>>>,
) {
    let step = record.step;
    let deadline = Duration::from_secs(step.timeout_or(job_timeout.as_secs()));
    info!(id = %step.id, name = %step.name, "handling");

    if subprocess {
        // the child reports to the hub itself; only its exit matters here
        match timeout(deadline, run_subprocess(job_cmd, &step.id)).await {
            Ok(Ok(())) => {},
            Ok(Err(error)) => {
                warn!(id = %step.id, %error, "job process failed");
                let report = hub
                    .error(&step.id, &error.to_string(), &format!("{error:#}"))
                    .await;
                if let Err(error) = report {
                    warn!(id = %step.id, %error, "error report failed");
                }
            },
            Err(_) => {
                warn!(id = %step.id, "job timed out");
                if let Err(error) =
                    hub.error(&step.id, "Job timed out", "").await
                {
                    warn!(id = %step.id, %error, "error report failed");
                }
            },
        }
        return;
    }

    let outcome =
        match timeout(deadline, run_body(&hub, &*runner, &step, &data)).await
        {
            Ok(Ok(result)) => Outcome::Finished(result),
            Ok(Err(error)) => Outcome::Failed {
                error: error.to_string(),
                trace: format!("{error:#}"),
            },
            Err(_) => Outcome::Failed {
                error: "Job timed out".into(),
                trace: String::new(),
            },
        };

    if let Err(error) = queue.put(Some(Transaction { step, outcome })) {
        error!(%error, "failed to enqueue transaction");
    }
}

/// Feeds the step's parents' outputs (prefetched where possible, fetched on
/// miss) to the runner in declared order.
async fn run_body(
    hub: &HubClient,
    runner: &dyn Runner,
    step: &Step,
    data: &BTreeMap<String, Vec<u8>>,
) -> Result<crate::types::step::StepResult> {
    let mut inputs = Vec::with_capacity(step.parents.len());
    for parent in &step.parents {
        match data.get(parent) {
            Some(d) => inputs.push(Some(d.clone())),
            None => inputs.push(hub.get_data(parent).await?),
        }
    }

    runner.run(step.clone(), inputs).await
}

async fn run_subprocess(job_cmd: &str, step_id: &str) -> Result<()> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(job_cmd)
        .env("STEP_ID", step_id)
        .kill_on_drop(true)
        .status()
        .await
        .context("spawning job process")?;

    if !status.success() {
        bail!("job process exited with {status}");
    }
    Ok(())
}

/// Runs one step to completion in this process, reporting straight to the
/// hub. This is the body of the `job` mode that subprocess-mode workers
/// spawn with `STEP_ID` set; the transaction queue is bypassed.
pub async fn job(
    hub: &HubClient,
    runner: &dyn Runner,
    step_id: &str,
    job_timeout: Duration,
) -> Result<()> {
    let Some(record) = hub.get_step(step_id).await? else {
        warn!(%step_id, "no such step; resetting");
        return hub.reset(step_id).await;
    };
    let step = record.step;
    let deadline = Duration::from_secs(step.timeout_or(job_timeout.as_secs()));
    info!(id = %step.id, name = %step.name, "handling");

    let data = BTreeMap::new();
    match timeout(deadline, run_body(hub, runner, &step, &data)).await {
        Ok(Ok(result)) => {
            hub.set_data(&step.id, result.data.clone()).await?;
            match result.status {
                crate::types::status::ResultStatus::Success => {
                    hub.done(&step.id).await
                },
                crate::types::status::ResultStatus::Pending => {
                    hub.pending(&step.id).await
                },
                crate::types::status::ResultStatus::Reset => {
                    hub.reset(&step.id).await
                },
                crate::types::status::ResultStatus::Cancel => {
                    hub.cancel(&step.id).await
                },
            }
        },
        Ok(Err(error)) => {
            hub.error(&step.id, &error.to_string(), &format!("{error:#}"))
                .await
        },
        Err(_) => hub.error(&step.id, "Job timed out", "").await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::hub::client::tests::start_stack;
    use crate::types::status::{ResultStatus, StepStatus};
    use crate::types::step::StepResult;

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

    fn worker_config(dir: &tempfile::TempDir, n: usize) -> WorkerConfig {
        WorkerConfig {
            scopes: vec!["default".to_string()],
            n_workers: n,
            reverse_priority: false,
            subprocess_jobs: false,
            job_cmd: String::new(),
            restart_interval: Duration::from_secs(3600),
            job_timeout: Duration::from_secs(60),
            one_shot: true,
            once: false,
            queue_path: dir.path().join("worker_queue.queue"),
            scratch_dir: dir.path().join("scratch"),
        }
    }

    #[tokio::test]
    async fn test_chain_of_three() {
        let (_dir, client, endpoint, _cancel) = start_stack().await;
        let wdir = tempfile::tempdir().unwrap();

        client
            .submit(vec![
                step("s1", &[]),
                step("s2", &["s1"]),
                step("s3", &["s2"]),
            ])
            .await
            .unwrap();

        let runner = runner::runner_fn(|_step, _inputs| async move {
            Ok(StepResult::success(b"x".to_vec()))
        });
        let worker =
            Worker::new(worker_config(&wdir, 15), endpoint, runner).unwrap();
        worker.run().await.unwrap();

        for id in ["s1", "s2", "s3"] {
            let record = client.get_step(id).await.unwrap().unwrap();
            assert_eq!(record.status, StepStatus::Success, "{id}");
            assert_eq!(
                client.get_data(id).await.unwrap(),
                Some(b"x".to_vec()),
                "{id}"
            );
        }
        assert!(client
            .get_steps(&["default".to_string()], false)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_feeds_parent_output() {
        let (_dir, client, endpoint, _cancel) = start_stack().await;
        let wdir = tempfile::tempdir().unwrap();

        client
            .submit(vec![
                step("s1", &[]),
                step("s2", &["s1"]),
                step("s3", &["s1"]),
                step("s4", &["s1"]),
            ])
            .await
            .unwrap();

        let seen: Arc<Mutex<HashMap<String, Vec<Option<Vec<u8>>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let runner = {
            let seen = seen.clone();
            runner::runner_fn(move |step, inputs| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().insert(step.id.clone(), inputs);
                    Ok(StepResult::success(
                        format!("out-{}", step.id).into_bytes(),
                    ))
                }
            })
        };

        let worker =
            Worker::new(worker_config(&wdir, 2), endpoint, runner).unwrap();
        worker.run().await.unwrap();

        for id in ["s1", "s2", "s3", "s4"] {
            let record = client.get_step(id).await.unwrap().unwrap();
            assert_eq!(record.status, StepStatus::Success, "{id}");
        }

        let seen = seen.lock().unwrap();
        for id in ["s2", "s3", "s4"] {
            assert_eq!(
                seen[id],
                vec![Some(b"out-s1".to_vec())],
                "{id} saw its parent's bytes"
            );
        }
    }

    #[tokio::test]
    async fn test_timeout_reports_job_timed_out() {
        let (_dir, client, endpoint, _cancel) = start_stack().await;
        let wdir = tempfile::tempdir().unwrap();

        let mut slow = step("slow", &[]);
        slow.timeout = Some(1);
        client.submit(vec![slow]).await.unwrap();

        let runner = runner::runner_fn(|_step, _inputs| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(StepResult::success(b"never".to_vec()))
        });
        let worker =
            Worker::new(worker_config(&wdir, 15), endpoint, runner).unwrap();
        worker.run().await.unwrap();

        let record = client.get_step("slow").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Error);
        assert_eq!(record.last_error.as_deref(), Some("Job timed out"));
        assert!(record.attempts >= 1);
    }

    #[tokio::test]
    async fn test_pending_defers_then_succeeds() {
        let (_dir, client, endpoint, _cancel) = start_stack().await;
        let wdir = tempfile::tempdir().unwrap();

        client.submit(vec![step("s1", &[])]).await.unwrap();

        // first run defers, second succeeds
        let calls = Arc::new(Mutex::new(0u32));
        let runner = {
            let calls = calls.clone();
            runner::runner_fn(move |_step, _inputs| {
                let calls = calls.clone();
                async move {
                    let mut calls = calls.lock().unwrap();
                    *calls += 1;
                    if *calls == 1 {
                        Ok(StepResult {
                            status: ResultStatus::Pending,
                            data: vec![],
                        })
                    } else {
                        Ok(StepResult::success(b"finally".to_vec()))
                    }
                }
            })
        };

        let worker =
            Worker::new(worker_config(&wdir, 15), endpoint, runner).unwrap();
        worker.run().await.unwrap();

        let record = client.get_step("s1").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Success);
        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(
            client.get_data("s1").await.unwrap(),
            Some(b"finally".to_vec())
        );
    }

    #[tokio::test]
    async fn test_worker_respects_stop_via_once() {
        let (_dir, client, endpoint, _cancel) = start_stack().await;
        let wdir = tempfile::tempdir().unwrap();

        client
            .submit(vec![step("s1", &[]), step("s2", &["s1"])])
            .await
            .unwrap();

        let runner = runner::runner_fn(|_step, _inputs| async move {
            Ok(StepResult::success(b"x".to_vec()))
        });
        let mut cfg = worker_config(&wdir, 15);
        cfg.one_shot = false;
        cfg.once = true;

        let worker = Worker::new(cfg, endpoint, runner).unwrap();
        worker.run().await.unwrap();

        // a single batch ran: s1 finished, s2 still pending its turn
        assert_eq!(
            client.get_step("s1").await.unwrap().unwrap().status,
            StepStatus::Success
        );
        assert_ne!(
            client.get_step("s2").await.unwrap().unwrap().status,
            StepStatus::Success
        );
    }
}
